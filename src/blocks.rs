//! Configuration memory blocks (EBID): CRC compare and conditional rewrite.
//!
//! The device stores a CRC per configuration block. The platform's copy is
//! padded into the same 126-byte frame (4-byte length header + payload),
//! checksummed, and compared against the device's stored value through the
//! operational command channel; only a mismatch (or an explicit force)
//! triggers the config-mode write. Writes to these blocks only take effect
//! after a restart, which is why the engine reports whether it updated
//! anything.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;

use crate::control::chk_cmd_rdy;
use crate::crc::config_crc;
use crate::defs::*;
use crate::rw::{BusAddr, RegisterBus};
use crate::{Error, Tma884};

/// Electronic block ids addressable through the config commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum Ebid {
  TouchParams,
  DesignData,
  MfgData,
}

impl Ebid {
  pub(crate) const fn id(self) -> u8 {
    match self {
      Self::TouchParams => 0x00,
      Self::DesignData => 0x05,
      Self::MfgData => 0x06,
    }
  }
}

/// Authentication key trailing every config-block write.
const WRITE_KEY: [u8; 8] = [0x45, 0x63, 0x36, 0x6F, 0x34, 0x38, 0x73, 0x77];

/// Fixed length frame: preamble (10) + data (122) + crc (2) + key (8).
const WRITE_FRAME_LEN: usize = 142;

/// CRC over the padded 126-byte block frame the device checks against.
pub(crate) fn calc_block_crc(payload: &[u8]) -> Result<u16, ()> {
  if payload.len() > CFG_BLK_PAYLOAD_MAX {
    return Err(());
  }
  let mut buf = [0u8; CFG_BLK_SIZE];
  buf[0] = 0x00; // num of config bytes + 4, high
  buf[1] = 0x7E; // num of config bytes + 4, low
  buf[2] = 0x00; // max block size w/o crc, high
  buf[3] = 0x7E; // max block size w/o crc, low
  buf[4..4 + payload.len()].copy_from_slice(payload);
  Ok(config_crc(&buf))
}

impl<'a, B, IRQ, RST> Tma884<'a, B, IRQ, RST>
where
  B: RegisterBus,
  IRQ: Wait + InputPin,
  RST: OutputPin,
{
  /// Query the CRC the device stores for a block. Operational mode only.
  pub(crate) async fn get_ic_crc(&mut self, ebid: Ebid) -> Result<u16, Error<B::Error>> {
    let ofs = self.offsets()?.cmd_ofs;

    let mut cmd_dat = [0u8; NUM_CMD_DAT + 1];
    cmd_dat[0] = OP_CMD_GET_CFG_BLK_CRC;
    cmd_dat[1] = ebid.id();

    self
      .put_cmd_wait(ofs, &cmd_dat, ONE_SEC_TMO, Some(chk_cmd_rdy), DriverState::Command)
      .await?;

    let mut readback = [0u8; NUM_CMD_DAT + 1];
    self.read_block(BusAddr::Touch, ofs, &mut readback).await?;

    if readback[1] != 0 {
      log::error!("get crc status={} error", readback[1]);
      return Err(Error::Status(readback[1]));
    }
    Ok(u16::from_be_bytes([readback[2], readback[3]]))
  }

  /// Write one config block through the config-mode command channel.
  ///
  /// Low-power handshaking is suppressed for the duration; the block write
  /// must not race the power gate.
  pub(crate) async fn write_config_block(
    &mut self,
    ebid: Ebid,
    payload: &[u8],
    crc: u16,
  ) -> Result<(), Error<B::Error>> {
    let ofs = self.offsets()?.cmd_ofs;
    if payload.len() > CFG_BLK_PAYLOAD_MAX {
      log::error!("config block too large, n={}", payload.len());
      return Err(Error::Overflow);
    }

    let lpe = self.low_power_enable;
    self.low_power_enable = false;

    let result = self.write_config_block_inner(ofs, ebid, payload, crc).await;

    self.low_power_enable = lpe;
    result
  }

  async fn write_config_block_inner(
    &mut self,
    ofs: u16,
    ebid: Ebid,
    payload: &[u8],
    crc: u16,
  ) -> Result<(), Error<B::Error>> {
    let mut buf = [0u8; WRITE_FRAME_LEN];
    buf[0] = CFG_CMD_WRITE_EBID;
    buf[1] = 0x00; // row offset high
    buf[2] = 0x00; // row offset low
    buf[3] = 0x00; // write block length high
    buf[4] = 0x80; // write block length low
    buf[5] = ebid.id();
    buf[6] = 0x00; // num of config bytes + 4, high
    buf[7] = 0x7E; // num of config bytes + 4, low
    buf[8] = 0x00; // max block size w/o crc, high
    buf[9] = 0x7E; // max block size w/o crc, low
    buf[10..10 + payload.len()].copy_from_slice(payload);
    let [crc_h, crc_l] = crc.to_be_bytes();
    buf[132] = crc_h;
    buf[133] = crc_l;
    buf[134..].copy_from_slice(&WRITE_KEY);

    // stage everything past the command byte, then arm the command itself
    self.write_block(BusAddr::Touch, ofs + 1, &buf[1..]).await?;
    self
      .put_cmd_wait(ofs, &buf[..1], TEN_SEC_TMO, Some(chk_cmd_rdy), DriverState::Command)
      .await?;

    let status = self.read_u8(BusAddr::Touch, ofs + 1).await?;
    if status != 0x00 {
      log::error!("write config status={status} error");
      return Err(Error::Status(status));
    }
    Ok(())
  }

  /// Compare the platform copy of a block against the device and rewrite
  /// it when the CRCs differ (or `force` is set). Returns whether a write
  /// happened, since the caller owes the device a restart if so.
  pub(crate) async fn set_data_block(
    &mut self,
    ebid: Ebid,
    payload: &[u8],
    name: &str,
    force: bool,
  ) -> Result<bool, Error<B::Error>> {
    let data_crc = calc_block_crc(payload).map_err(|()| {
      log::error!("{name} is too large, n={}", payload.len());
      Error::Overflow
    })?;

    self.set_mode(TargetMode::Operational).await?;
    let ic_crc = self.get_ic_crc(ebid).await?;

    log::debug!("{name} calc_crc={data_crc:#06x} ic_crc={ic_crc:#06x}");
    if data_crc == ic_crc && !force {
      return Ok(false);
    }

    self.set_mode(TargetMode::Config).await?;
    self.write_config_block(ebid, payload, data_crc).await?;
    log::debug!("write {name} config block ok");
    Ok(true)
  }

  /// Sync the design- and manufacturing-data blocks from platform data.
  ///
  /// A missing platform table compares as a zero-filled block, so a device
  /// holding stale data still gets scrubbed.
  pub(crate) async fn set_sysinfo_blocks(&mut self) -> Result<bool, Error<B::Error>> {
    let mut block = [0u8; NUM_MDATA];

    block[..NUM_DDATA].fill(0);
    if let Some(ddata) = self.platform.design_data {
      let n = ddata.len().min(NUM_DDATA);
      block[..n].copy_from_slice(&ddata[..n]);
    }
    let ddata = {
      let mut d = [0u8; NUM_DDATA];
      d.copy_from_slice(&block[..NUM_DDATA]);
      d
    };
    let ddata_updated = self.set_data_block(Ebid::DesignData, &ddata, "platform ddata", false).await?;

    block.fill(0);
    if let Some(mdata) = self.platform.mfg_data {
      let n = mdata.len().min(NUM_MDATA);
      block[..n].copy_from_slice(&mdata[..n]);
    }
    let mdata_updated =
      self.set_data_block(Ebid::MfgData, &block[..NUM_MDATA], "platform mdata", false).await?;

    Ok(ddata_updated || mdata_updated)
  }

  /// CRC of the platform touch-parameter table.
  pub(crate) fn calc_settings_crc(&self) -> Result<u16, Error<B::Error>> {
    let params = self.platform.touch_params.ok_or_else(|| {
      log::error!("missing platform touch parameter table");
      Error::Invalid
    })?;
    if params.is_empty() {
      log::error!("empty platform touch parameter table");
      return Err(Error::Invalid);
    }
    calc_block_crc(params).map_err(|()| {
      log::error!("platform touch parameter table too large");
      Error::Overflow
    })
  }

  /// Rewrite the touch-parameter block (config mode) with a
  /// platform-computed CRC.
  pub(crate) async fn set_op_params(&mut self, crc: u16) -> Result<(), Error<B::Error>> {
    let params = self.platform.touch_params.ok_or(Error::Invalid)?;

    self.set_mode(TargetMode::Config).await?;
    self.write_config_block(Ebid::TouchParams, params, crc).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testutil::*;
  use embassy_futures::block_on;

  #[test]
  fn block_crc_pads_to_frame() {
    // the padded frame is fixed-length, so a short payload and the same
    // payload with explicit zero padding agree
    let a = calc_block_crc(&[1, 2, 3]).unwrap();
    let b = calc_block_crc(&[1, 2, 3, 0, 0, 0]).unwrap();
    assert_eq!(a, b);
    assert!(calc_block_crc(&[0u8; 123]).is_err());
  }

  fn queue_mode_switch(ts: &mut TestDriver, mode_bits: u8) {
    ts.bus.queue_read(&[mode_bits]);
  }

  fn queue_ic_crc(ts: &mut TestDriver, crc: u16) {
    // command-ready poll, then the 7-byte command readback
    ts.bus.queue_read(&[CMD_RDY_BIT | OP_CMD_GET_CFG_BLK_CRC]);
    let [h, l] = crc.to_be_bytes();
    ts.bus.queue_read(&[CMD_RDY_BIT | OP_CMD_GET_CFG_BLK_CRC, 0x00, h, l, 0, 0, 0]);
  }

  #[test]
  fn matching_crc_skips_the_write() {
    let mut ts = seeded_driver();
    let payload = [0xAAu8; 8];
    let crc = calc_block_crc(&payload).unwrap();

    queue_mode_switch(&mut ts, HST_OPERATE_MODE);
    queue_ic_crc(&mut ts, crc);

    let updated =
      block_on(ts.set_data_block(Ebid::DesignData, &payload, "ddata", false)).unwrap();
    assert!(!updated);

    // no write-config command went out
    assert!(ts.bus.writes().iter().all(|w| w.2.first() != Some(&CFG_CMD_WRITE_EBID)));
  }

  #[test]
  fn crc_mismatch_rewrites_block() {
    let mut ts = seeded_driver();
    let payload = [0xAAu8; 8];
    let crc = calc_block_crc(&payload).unwrap();

    queue_mode_switch(&mut ts, HST_OPERATE_MODE);
    queue_ic_crc(&mut ts, crc ^ 0xFFFF);
    // config mode switch, then the staged write command-ready + status
    queue_mode_switch(&mut ts, HST_CONFIG_MODE);
    ts.bus.queue_read(&[CMD_RDY_BIT | CFG_CMD_WRITE_EBID]);
    ts.bus.queue_read(&[0x00]); // write status ok

    let updated =
      block_on(ts.set_data_block(Ebid::DesignData, &payload, "ddata", false)).unwrap();
    assert!(updated);

    // the staged frame: 141 bytes at cmd_ofs + 1, key at the tail
    let writes = ts.bus.writes();
    let staged = writes.iter().find(|w| w.2.len() == 141).expect("staged frame");
    assert_eq!(staged.1, 0x02 + 1);
    assert_eq!(staged.2[4], Ebid::DesignData.id());
    assert_eq!(&staged.2[133..], &WRITE_KEY);
    let [crc_h, crc_l] = crc.to_be_bytes();
    assert_eq!(staged.2[131], crc_h);
    assert_eq!(staged.2[132], crc_l);
  }

  #[test]
  fn force_rewrites_even_on_match() {
    let mut ts = seeded_driver();
    let payload = [0x11u8; 4];
    let crc = calc_block_crc(&payload).unwrap();

    queue_mode_switch(&mut ts, HST_OPERATE_MODE);
    queue_ic_crc(&mut ts, crc);
    queue_mode_switch(&mut ts, HST_CONFIG_MODE);
    ts.bus.queue_read(&[CMD_RDY_BIT | CFG_CMD_WRITE_EBID]);
    ts.bus.queue_read(&[0x00]);

    let updated = block_on(ts.set_data_block(Ebid::MfgData, &payload, "mdata", true)).unwrap();
    assert!(updated);
  }

  #[test]
  fn nonzero_write_status_is_an_error() {
    let mut ts = seeded_driver();

    ts.bus.queue_read(&[CMD_RDY_BIT | CFG_CMD_WRITE_EBID]);
    ts.bus.queue_read(&[0x07]); // flash checksum error

    let r = block_on(ts.write_config_block(Ebid::TouchParams, &[1, 2], 0x1234));
    assert!(matches!(r, Err(Error::Status(0x07))));
  }

  #[test]
  fn settings_crc_requires_platform_table() {
    let ts = seeded_driver();
    assert!(matches!(ts.calc_settings_crc(), Err(Error::Invalid)));
  }
}
