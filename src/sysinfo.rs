//! System-information decoding.
//!
//! In sysinfo mode the device exposes a self-describing register map: a
//! fixed header of big-endian offsets locating the cydata, test,
//! physical-config, operational-config, design-data and manufacturing-data
//! blocks. Block sizes are not transmitted; each is the distance to the
//! next block, with the manufacturing block running to the end of the map.
//!
//! The operational-config block in turn carries the layout of the live
//! touch interface: command/report offsets, button geometry and the
//! bit-packed location descriptors for every touch-record field.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;

use crate::defs::*;
use crate::event::{Button, ButtonState};
use crate::rw::{BusAddr, RegisterBus};
use crate::{Error, Tma884};

/// Raw sysinfo header read from the base register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct SysInfoHeader {
  pub hst_mode: u8,
  pub map_sz: u16,
  pub cydata_ofs: u16,
  pub test_ofs: u16,
  pub pcfg_ofs: u16,
  pub opcfg_ofs: u16,
  pub ddata_ofs: u16,
  pub mdata_ofs: u16,
}

impl SysInfoHeader {
  pub(crate) const SIZE: usize = 16;

  pub(crate) fn parse(raw: &[u8; Self::SIZE]) -> Self {
    let be = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    Self {
      hst_mode: raw[0],
      map_sz: be(2),
      cydata_ofs: be(4),
      test_ofs: be(6),
      pcfg_ofs: be(8),
      opcfg_ofs: be(10),
      ddata_ofs: be(12),
      mdata_ofs: be(14),
    }
  }

  /// Block sizes derived from consecutive offsets. Fails when offsets are
  /// not monotonically increasing or overrun the declared map size.
  pub(crate) fn block_sizes(&self) -> Result<BlockSizes, SysInfoError> {
    let span = |from: u16, to: u16| {
      to.checked_sub(from).map(usize::from).ok_or(SysInfoError::NonMonotonic)
    };
    let sizes = BlockSizes {
      cydata: span(self.cydata_ofs, self.test_ofs)?,
      test: span(self.test_ofs, self.pcfg_ofs)?,
      pcfg: span(self.pcfg_ofs, self.opcfg_ofs)?,
      opcfg: span(self.opcfg_ofs, self.ddata_ofs)?,
      ddata: span(self.ddata_ofs, self.mdata_ofs)?,
      mdata: span(self.mdata_ofs, self.map_sz)?,
    };
    if usize::from(self.cydata_ofs) < Self::SIZE {
      return Err(SysInfoError::NonMonotonic);
    }
    if sizes.largest() > BLOCK_CAP {
      return Err(SysInfoError::TooLarge);
    }
    Ok(sizes)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockSizes {
  pub cydata: usize,
  pub test: usize,
  pub pcfg: usize,
  pub opcfg: usize,
  pub ddata: usize,
  pub mdata: usize,
}

impl BlockSizes {
  fn largest(&self) -> usize {
    let mut n = self.cydata;
    for s in [self.test, self.pcfg, self.opcfg, self.ddata, self.mdata] {
      n = n.max(s);
    }
    n
  }
}

/// Decode failures; all collapse into [`Error::Protocol`] at the bus layer
/// but stay distinct for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum SysInfoError {
  NonMonotonic,
  TooLarge,
  ShortBlock,
  FieldOverflow,
  TooManyButtons,
}

/// Device identity and firmware version block (cydata).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CyData {
  pub product_id: u16,
  pub fw_ver_major: u8,
  pub fw_ver_minor: u8,
  pub revctrl: [u8; 8],
  pub bl_ver_major: u8,
  pub bl_ver_minor: u8,
  pub silicon_id: u32,
  pub ttsp_ver_major: u8,
  pub ttsp_ver_minor: u8,
  pub device_info: u8,
}

impl CyData {
  pub(crate) const MIN_SIZE: usize = 34;

  pub(crate) fn parse(raw: &[u8]) -> Result<Self, SysInfoError> {
    if raw.len() < Self::MIN_SIZE {
      return Err(SysInfoError::ShortBlock);
    }
    let mut revctrl = [0u8; 8];
    revctrl.copy_from_slice(&raw[4..12]);
    Ok(Self {
      product_id: u16::from_be_bytes([raw[0], raw[1]]),
      fw_ver_major: raw[2],
      fw_ver_minor: raw[3],
      revctrl,
      bl_ver_major: raw[12],
      bl_ver_minor: raw[13],
      silicon_id: u32::from_be_bytes([raw[14], raw[15], raw[16], raw[17]]),
      ttsp_ver_major: raw[31],
      ttsp_ver_minor: raw[32],
      device_info: raw[33],
    })
  }

  pub fn fw_version(&self) -> u16 {
    u16::from(self.fw_ver_major) << 8 | u16::from(self.fw_ver_minor)
  }

  /// High revision-control word, big-endian over revctrl[0..4].
  pub fn revctrl_high(&self) -> u32 {
    u32::from_be_bytes([self.revctrl[0], self.revctrl[1], self.revctrl[2], self.revctrl[3]])
  }

  /// Low revision-control word, big-endian over revctrl[4..8].
  pub fn revctrl_low(&self) -> u32 {
    u32::from_be_bytes([self.revctrl[4], self.revctrl[5], self.revctrl[6], self.revctrl[7]])
  }
}

/// Physical panel configuration (pcfg block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PanelConfig {
  pub electrodes_x: u8,
  pub electrodes_y: u8,
  pub len_x: u16,
  pub len_y: u16,
  pub res_x: u16,
  pub res_y: u16,
  pub max_z: u16,
}

impl PanelConfig {
  pub(crate) const MIN_SIZE: usize = 12;

  pub(crate) fn parse(raw: &[u8]) -> Result<Self, SysInfoError> {
    if raw.len() < Self::MIN_SIZE {
      return Err(SysInfoError::ShortBlock);
    }
    let be = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    Ok(Self {
      electrodes_x: raw[0],
      electrodes_y: raw[1],
      len_x: be(2),
      len_y: be(4),
      res_x: be(6),
      res_y: be(8),
      max_z: be(10),
    })
  }
}

/// Raw operational-config block fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpConfig {
  pub cmd_ofs: u8,
  pub rep_ofs: u8,
  pub rep_sz: u16,
  pub num_btns: u8,
  pub tt_stat_ofs: u8,
  pub obj_cfg0: u8,
  pub max_tchs: u8,
  pub tch_rec_siz: u8,
  /// Per-field (location, size-in-bits) descriptors, X Y P T E O W order.
  pub tch_rec: [(u8, u8); TCH_NUM_ABS],
  pub btn_rec_siz: u8,
  pub btn_diff_ofs: u8,
  pub btn_diff_siz: u8,
}

impl OpConfig {
  pub(crate) const MIN_SIZE: usize = 26;

  pub(crate) fn parse(raw: &[u8]) -> Result<Self, SysInfoError> {
    if raw.len() < Self::MIN_SIZE {
      return Err(SysInfoError::ShortBlock);
    }
    let mut tch_rec = [(0u8, 0u8); TCH_NUM_ABS];
    for (i, rec) in tch_rec.iter_mut().enumerate() {
      *rec = (raw[9 + i * 2], raw[10 + i * 2]);
    }
    Ok(Self {
      cmd_ofs: raw[0],
      rep_ofs: raw[1],
      rep_sz: u16::from_be_bytes([raw[2], raw[3]]),
      num_btns: raw[4],
      tt_stat_ofs: raw[5],
      obj_cfg0: raw[6],
      max_tchs: raw[7],
      tch_rec_siz: raw[8],
      tch_rec,
      btn_rec_siz: raw[23],
      btn_diff_ofs: raw[24],
      btn_diff_siz: raw[25],
    })
  }
}

/// Extraction parameters for one touch-record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct TchAbsParams {
  /// Byte offset within the record.
  pub ofs: usize,
  /// Field size in whole bytes.
  pub size: usize,
  /// One past the largest representable value (2^bits).
  pub max: u32,
  /// Right-shift applied while accumulating bytes.
  pub bofs: u8,
}

/// Number of whole bytes holding `nbits`, and the field's max value.
pub(crate) fn bits_to_bytes(nbits: u8) -> (usize, u32) {
  let max = 1u32 << nbits.min(31);
  let mut nbytes = 0;
  let mut rem = nbits;
  while rem > 0 {
    nbytes += 1;
    rem = rem.saturating_sub(8);
  }
  (nbytes, max)
}

/// Fully derived register-map geometry; immutable once computed and
/// recomputed from scratch on every restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SysInfoOffsets {
  pub map_sz: usize,
  pub cydata_ofs: usize,
  pub test_ofs: usize,
  pub pcfg_ofs: usize,
  pub opcfg_ofs: usize,
  pub ddata_ofs: usize,
  pub mdata_ofs: usize,
  pub cmd_ofs: u16,
  pub rep_ofs: usize,
  pub rep_sz: usize,
  pub num_btns: usize,
  pub num_btn_regs: usize,
  pub tt_stat_ofs: u16,
  pub obj_cfg0: u8,
  pub max_tchs: usize,
  pub tch_rec_siz: usize,
  pub mode_size: usize,
  pub data_size: usize,
  pub btn_rec_siz: usize,
  pub btn_diff_ofs: usize,
  pub btn_diff_siz: usize,
  pub tch_abs: [TchAbsParams; TCH_NUM_ABS],
}

impl SysInfoOffsets {
  pub(crate) fn derive(header: &SysInfoHeader, opcfg: &OpConfig) -> Result<Self, SysInfoError> {
    let num_btns = usize::from(opcfg.num_btns);
    if num_btns > MAX_BTNS {
      return Err(SysInfoError::TooManyButtons);
    }
    let num_btn_regs = num_btns.div_ceil(NUM_BTN_PER_REG);

    let max_tchs = usize::from(opcfg.max_tchs & BYTE_OFS_MASK);
    let tch_rec_siz = usize::from(opcfg.tch_rec_siz & BYTE_OFS_MASK);

    let mut tch_abs = [TchAbsParams::default(); TCH_NUM_ABS];
    for (abs, &(loc, bits)) in tch_abs.iter_mut().zip(opcfg.tch_rec.iter()) {
      let (size, max) = bits_to_bytes(bits);
      *abs = TchAbsParams {
        ofs: usize::from(loc & BYTE_OFS_MASK),
        size,
        max,
        bofs: (loc & BOFS_MASK) >> BOFS_SHIFT,
      };
      if abs.ofs + abs.size > tch_rec_siz {
        return Err(SysInfoError::FieldOverflow);
      }
    }

    let mut mode_size = usize::from(opcfg.tt_stat_ofs) + 1;
    if num_btns > 0 {
      mode_size += num_btn_regs;
    }
    let data_size = max_tchs * usize::from(opcfg.tch_rec_siz);
    if mode_size > MODE_CAP || data_size > XY_DATA_CAP || tch_rec_siz > MAX_RECORD_SIZE {
      return Err(SysInfoError::TooLarge);
    }

    Ok(Self {
      map_sz: usize::from(header.map_sz),
      cydata_ofs: usize::from(header.cydata_ofs),
      test_ofs: usize::from(header.test_ofs),
      pcfg_ofs: usize::from(header.pcfg_ofs),
      opcfg_ofs: usize::from(header.opcfg_ofs),
      ddata_ofs: usize::from(header.ddata_ofs),
      mdata_ofs: usize::from(header.mdata_ofs),
      cmd_ofs: u16::from(opcfg.cmd_ofs),
      rep_ofs: usize::from(opcfg.rep_ofs),
      rep_sz: usize::from(opcfg.rep_sz),
      num_btns,
      num_btn_regs,
      tt_stat_ofs: u16::from(opcfg.tt_stat_ofs),
      obj_cfg0: opcfg.obj_cfg0,
      max_tchs,
      tch_rec_siz,
      mode_size,
      data_size,
      btn_rec_siz: usize::from(opcfg.btn_rec_siz),
      btn_diff_ofs: usize::from(opcfg.btn_diff_ofs),
      btn_diff_siz: usize::from(opcfg.btn_diff_siz),
      tch_abs,
    })
  }
}

/// Everything learned from one successful sysinfo read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SysInfo {
  pub offsets: SysInfoOffsets,
  pub cydata: CyData,
  pub pcfg: PanelConfig,
}

impl<'a, B, IRQ, RST> Tma884<'a, B, IRQ, RST>
where
  B: RegisterBus,
  IRQ: Wait + InputPin,
  RST: OutputPin,
{
  /// Read and decode the sysinfo register map.
  ///
  /// On any failure past the header read the flow-control handshake is
  /// still issued; the device gates further traffic on it. The caller owns
  /// the retry decision (a failed decode aborts without partial retries).
  pub(crate) async fn get_sysinfo_regs(&mut self) -> Result<(), Error<B::Error>> {
    self.si = None;

    let mut raw = [0u8; SysInfoHeader::SIZE];
    self.read_block(BusAddr::Touch, REG_BASE, &mut raw).await?;
    let header = SysInfoHeader::parse(&raw);

    let result = self.read_sysinfo_blocks(&header).await;

    // flow control handshake, success or not
    if self.handshake(header.hst_mode).await.is_err() {
      log::error!("handshake fail on sysinfo regs");
    }
    result
  }

  async fn read_sysinfo_blocks(&mut self, header: &SysInfoHeader) -> Result<(), Error<B::Error>> {
    let sizes = header.block_sizes().map_err(|e| {
      log::error!("sysinfo block layout rejected: {e:?}");
      Error::Protocol
    })?;

    let mut block = [0u8; BLOCK_CAP];

    self.read_block(BusAddr::Touch, header.cydata_ofs, &mut block[..sizes.cydata]).await?;
    let cydata = CyData::parse(&block[..sizes.cydata]).map_err(|e| {
      log::error!("cydata rejected: {e:?}");
      Error::Protocol
    })?;
    log::info!(
      "device fw {}.{} ttsp {}.{}",
      cydata.fw_ver_major,
      cydata.fw_ver_minor,
      cydata.ttsp_ver_major,
      cydata.ttsp_ver_minor
    );

    if sizes.test > 0 {
      self.read_block(BusAddr::Touch, header.test_ofs, &mut block[..sizes.test]).await?;
    }

    self.read_block(BusAddr::Touch, header.pcfg_ofs, &mut block[..sizes.pcfg]).await?;
    let pcfg = PanelConfig::parse(&block[..sizes.pcfg]).map_err(|e| {
      log::error!("pcfg rejected: {e:?}");
      Error::Protocol
    })?;

    self.read_block(BusAddr::Touch, header.opcfg_ofs, &mut block[..sizes.opcfg]).await?;
    let opcfg = OpConfig::parse(&block[..sizes.opcfg]).map_err(|e| {
      log::error!("opcfg rejected: {e:?}");
      Error::Protocol
    })?;

    // design and manufacturing blocks are read for flow symmetry; their
    // contents are only ever compared by CRC through the command channel
    if sizes.ddata > 0 {
      self.read_block(BusAddr::Touch, header.ddata_ofs, &mut block[..sizes.ddata]).await?;
    }
    if sizes.mdata > 0 {
      self.read_block(BusAddr::Touch, header.mdata_ofs, &mut block[..sizes.mdata]).await?;
    }

    let offsets = SysInfoOffsets::derive(header, &opcfg).map_err(|e| {
      log::error!("opcfg geometry rejected: {e:?}");
      Error::Protocol
    })?;
    log::debug!(
      "map_sz={} cydata={}+{} test={}+{} pcfg={}+{} opcfg={}+{} ddata={}+{} mdata={}+{}",
      offsets.map_sz,
      offsets.cydata_ofs,
      sizes.cydata,
      offsets.test_ofs,
      sizes.test,
      offsets.pcfg_ofs,
      sizes.pcfg,
      offsets.opcfg_ofs,
      sizes.opcfg,
      offsets.ddata_ofs,
      sizes.ddata,
      offsets.mdata_ofs,
      sizes.mdata
    );
    log::debug!(
      "cmd_ofs={} rep_ofs={} rep_sz={} tt_stat_ofs={} obj_cfg0={:#04x} max_tchs={} \
       tch_rec_siz={} mode_size={} data_size={}",
      offsets.cmd_ofs,
      offsets.rep_ofs,
      offsets.rep_sz,
      offsets.tt_stat_ofs,
      offsets.obj_cfg0,
      offsets.max_tchs,
      offsets.tch_rec_siz,
      offsets.mode_size,
      offsets.data_size
    );
    log::debug!(
      "num_btns={} btn_rec_siz={} btn_diff_ofs={} btn_diff_siz={}",
      offsets.num_btns,
      offsets.btn_rec_siz,
      offsets.btn_diff_ofs,
      offsets.btn_diff_siz
    );

    self.buttons.clear();
    for i in 0..offsets.num_btns {
      let key_code = self.platform.button_keys.get(i).copied().unwrap_or(0);
      // capacity checked in derive
      let _ = self.buttons.push(Button { enabled: true, state: ButtonState::Released, key_code });
    }

    self.xy_mode.clear();
    let _ = self.xy_mode.resize(offsets.mode_size, 0);
    self.xy_data.clear();
    let _ = self.xy_data.resize(offsets.data_size, 0);

    self.si = Some(SysInfo { offsets, cydata, pcfg });
    Ok(())
  }

  /// Geometry of the current register map, available after a successful
  /// sysinfo decode.
  pub(crate) fn offsets(&self) -> Result<SysInfoOffsets, Error<B::Error>> {
    self.si.as_ref().map(|si| si.offsets).ok_or(Error::Invalid)
  }

  /// Device identity block, if sysinfo has been decoded this boot cycle.
  pub fn device_info(&self) -> Option<CyData> {
    self.si.as_ref().map(|si| si.cydata)
  }

  /// Physical panel configuration, if sysinfo has been decoded.
  pub fn panel_config(&self) -> Option<PanelConfig> {
    self.si.as_ref().map(|si| si.pcfg)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn header_bytes() -> [u8; 16] {
    [
      0x10, 0x00, // hst_mode, reserved
      0x01, 0x00, // map size 256
      0x00, 0x10, // cydata at 16
      0x00, 0x40, // test at 64
      0x00, 0x44, // pcfg at 68
      0x00, 0x50, // opcfg at 80
      0x00, 0x80, // ddata at 128
      0x00, 0xA0, // mdata at 160
    ]
  }

  #[test]
  fn header_parse_big_endian() {
    let h = SysInfoHeader::parse(&header_bytes());
    assert_eq!(h.hst_mode, 0x10);
    assert_eq!(h.map_sz, 256);
    assert_eq!(h.cydata_ofs, 16);
    assert_eq!(h.mdata_ofs, 160);
  }

  #[test]
  fn block_sizes_cover_map() {
    let h = SysInfoHeader::parse(&header_bytes());
    let s = h.block_sizes().unwrap();
    assert_eq!(s.cydata, 48);
    assert_eq!(s.test, 4);
    assert_eq!(s.pcfg, 12);
    assert_eq!(s.opcfg, 48);
    assert_eq!(s.ddata, 32);
    assert_eq!(s.mdata, 96);
    let total = 16 + s.cydata + s.test + s.pcfg + s.opcfg + s.ddata + s.mdata;
    assert_eq!(total, usize::from(h.map_sz));
  }

  #[test]
  fn non_monotonic_offsets_rejected() {
    let mut raw = header_bytes();
    // test block placed before cydata
    raw[6] = 0x00;
    raw[7] = 0x08;
    let h = SysInfoHeader::parse(&raw);
    assert_eq!(h.block_sizes(), Err(SysInfoError::NonMonotonic));
  }

  #[test]
  fn bits_to_bytes_rounds_up() {
    assert_eq!(bits_to_bytes(0), (0, 1));
    assert_eq!(bits_to_bytes(5), (1, 32));
    assert_eq!(bits_to_bytes(8), (1, 256));
    assert_eq!(bits_to_bytes(9), (2, 512));
    assert_eq!(bits_to_bytes(16), (2, 65536));
  }

  fn opcfg_raw() -> [u8; 26] {
    let mut raw = [0u8; 26];
    raw[0] = 0x02; // cmd_ofs
    raw[1] = 0x11; // rep_ofs
    raw[2] = 0x00;
    raw[3] = 0xC8; // rep_sz 200
    raw[4] = 4; // num_btns
    raw[5] = 0x14; // tt_stat_ofs
    raw[6] = 0x00;
    raw[7] = 10; // max_tchs
    raw[8] = 10; // tch_rec_siz
    // X at ofs 0, 12 bits; Y at ofs 2, 12 bits; P at 4, 8 bits;
    // T at ofs 5 bofs 3, 5 bits; E at 5, 2 bits; O at 6, 2 bits; W at 7, 8 bits
    let recs = [(0x00, 12), (0x02, 12), (0x04, 8), (0x65, 5), (0x05, 2), (0x06, 2), (0x07, 8)];
    for (i, (loc, bits)) in recs.iter().enumerate() {
      raw[9 + i * 2] = *loc;
      raw[10 + i * 2] = *bits;
    }
    raw[23] = 2; // btn_rec_siz
    raw[24] = 0x16;
    raw[25] = 8;
    raw
  }

  fn opcfg_fixture() -> OpConfig {
    OpConfig::parse(&opcfg_raw()).unwrap()
  }

  #[test]
  fn offsets_derive_geometry() {
    let h = SysInfoHeader::parse(&header_bytes());
    let o = SysInfoOffsets::derive(&h, &opcfg_fixture()).unwrap();
    assert_eq!(o.cmd_ofs, 0x02);
    assert_eq!(o.num_btns, 4);
    assert_eq!(o.num_btn_regs, 1);
    // tt_stat + status byte + one button register
    assert_eq!(o.mode_size, 0x14 + 1 + 1);
    assert_eq!(o.data_size, 100);
    assert_eq!(o.tch_abs[TCH_X], TchAbsParams { ofs: 0, size: 2, max: 4096, bofs: 0 });
    // loc 0x65: byte offset 5, bit offset 3
    assert_eq!(o.tch_abs[TCH_T], TchAbsParams { ofs: 5, size: 1, max: 32, bofs: 3 });
  }

  #[test]
  fn touch_field_past_record_end_rejected() {
    let h = SysInfoHeader::parse(&header_bytes());
    let mut op = opcfg_fixture();
    op.tch_rec[TCH_W] = (0x09, 16); // two bytes starting at the last byte
    assert_eq!(SysInfoOffsets::derive(&h, &op), Err(SysInfoError::FieldOverflow));
  }

  #[test]
  fn cydata_parse_versions() {
    let mut raw = [0u8; CyData::MIN_SIZE];
    raw[0] = 0xAB;
    raw[1] = 0xCD;
    raw[2] = 0x01;
    raw[3] = 0x05;
    for (i, b) in (4..12).enumerate() {
      raw[b] = i as u8 + 1;
    }
    raw[14] = 0xDE;
    raw[15] = 0xAD;
    raw[16] = 0xBE;
    raw[17] = 0xEF;
    let cy = CyData::parse(&raw).unwrap();
    assert_eq!(cy.product_id, 0xABCD);
    assert_eq!(cy.fw_version(), 0x0105);
    assert_eq!(cy.revctrl_high(), 0x01020304);
    assert_eq!(cy.revctrl_low(), 0x05060708);
    assert_eq!(cy.silicon_id, 0xDEADBEEF);
  }

  #[test]
  fn short_cydata_rejected() {
    assert_eq!(CyData::parse(&[0u8; 10]), Err(SysInfoError::ShortBlock));
  }

  mod decode {
    use super::*;
    use crate::rw::BusAddr;
    use crate::testutil::*;
    use embassy_futures::block_on;

    fn queue_map(ts: &mut TestDriver) {
      ts.bus.queue_read(&header_bytes());
      let mut cydata = std::vec![0u8; 48];
      cydata[0] = 0x08;
      cydata[1] = 0x84;
      cydata[2] = 1;
      cydata[3] = 4;
      ts.bus.queue_read(&cydata);
      ts.bus.queue_read(&[0u8; 4]); // test
      ts.bus.queue_read(&[0u8; 12]); // pcfg
      let mut opcfg = std::vec![0u8; 48];
      opcfg[..26].copy_from_slice(&opcfg_raw());
      ts.bus.queue_read(&opcfg);
      ts.bus.queue_read(&std::vec![0u8; 32]); // ddata
      ts.bus.queue_read(&std::vec![0u8; 96]); // mdata
    }

    #[test]
    fn full_decode_populates_geometry_and_handshakes() {
      let mut ts = seeded_driver();
      ts.platform.button_keys = &[139, 158];
      queue_map(&mut ts);

      block_on(ts.get_sysinfo_regs()).unwrap();

      let o = ts.offsets().unwrap();
      assert_eq!(o.cmd_ofs, 0x02);
      assert_eq!(o.mode_size, 0x16);
      assert_eq!(ts.device_info().unwrap().product_id, 0x0884);
      assert_eq!(ts.xy_mode.len(), o.mode_size);
      assert_eq!(ts.xy_data.len(), o.data_size);
      // keycodes from the platform table, reserved beyond it
      assert_eq!(ts.buttons.len(), 4);
      assert_eq!(ts.buttons[0].key_code, 139);
      assert_eq!(ts.buttons[2].key_code, 0);

      // the read edge was acknowledged with the toggled handshake bit
      let writes = ts.bus.writes();
      assert_eq!(writes.len(), 1);
      assert_eq!(writes[0], (BusAddr::Touch, crate::defs::REG_BASE, std::vec![0x90]));
    }

    #[test]
    fn decode_failure_still_handshakes() {
      let mut ts = seeded_driver();
      ts.bus.queue_read(&header_bytes());
      // cydata read fails through both retries
      ts.bus.queue_read_error();
      ts.bus.queue_read_error();

      let r = block_on(ts.get_sysinfo_regs());
      assert!(matches!(r, Err(crate::Error::Bus(()))));
      assert_eq!(ts.bus.writes().len(), 1);
    }

    #[test]
    fn header_read_failure_skips_the_handshake() {
      let mut ts = seeded_driver();
      ts.bus.queue_read_error();
      ts.bus.queue_read_error();

      let r = block_on(ts.get_sysinfo_regs());
      assert!(matches!(r, Err(crate::Error::Bus(()))));
      assert!(ts.bus.writes().is_empty());
    }
  }
}
