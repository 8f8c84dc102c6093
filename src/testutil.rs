//! Shared test fixtures: a scripted register bus, an always-ready
//! interrupt pin, and a driver seeded with a decoded register map.

use core::convert::Infallible;
use std::collections::VecDeque;
use std::vec::Vec;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use embedded_hal_async::digital::Wait;

use crate::config::{Axis, AxisRange, PlatformData};
use crate::defs::*;
use crate::event::TouchEvent;
use crate::rw::{BusAddr, RegisterBus};
use crate::sysinfo::{bits_to_bytes, CyData, PanelConfig, SysInfo, SysInfoOffsets, TchAbsParams};
use crate::Tma884;

/// Register bus replaying scripted read responses and recording writes.
#[derive(Debug, Default)]
pub(crate) struct FakeBus {
  reads: VecDeque<Result<Vec<u8>, ()>>,
  writes: Vec<(BusAddr, u16, Vec<u8>)>,
  write_results: VecDeque<Result<(), ()>>,
}

impl FakeBus {
  pub(crate) fn queue_read(&mut self, data: &[u8]) {
    self.reads.push_back(Ok(data.to_vec()));
  }

  pub(crate) fn queue_read_error(&mut self) {
    self.reads.push_back(Err(()));
  }

  pub(crate) fn queue_write_error(&mut self) {
    self.write_results.push_back(Err(()));
  }

  pub(crate) fn writes(&self) -> Vec<(BusAddr, u16, Vec<u8>)> {
    self.writes.clone()
  }
}

impl RegisterBus for FakeBus {
  type Error = ();

  async fn read(&mut self, _addr: BusAddr, _ofs: u16, buf: &mut [u8]) -> Result<(), ()> {
    match self.reads.pop_front() {
      Some(Ok(data)) => {
        buf.fill(0);
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(())
      }
      Some(Err(())) => Err(()),
      // unscripted reads answer all zeroes
      None => {
        buf.fill(0);
        Ok(())
      }
    }
  }

  async fn write(&mut self, addr: BusAddr, ofs: u16, data: &[u8]) -> Result<(), ()> {
    self.writes.push((addr, ofs, data.to_vec()));
    self.write_results.pop_front().unwrap_or(Ok(()))
  }
}

/// Interrupt/reset stand-in: every wait resolves immediately, the level is
/// settable per test.
#[derive(Debug, Default)]
pub(crate) struct FakeIrq {
  pub level_high: bool,
}

impl ErrorType for FakeIrq {
  type Error = Infallible;
}

impl Wait for FakeIrq {
  async fn wait_for_high(&mut self) -> Result<(), Infallible> {
    Ok(())
  }

  async fn wait_for_low(&mut self) -> Result<(), Infallible> {
    Ok(())
  }

  async fn wait_for_rising_edge(&mut self) -> Result<(), Infallible> {
    Ok(())
  }

  async fn wait_for_falling_edge(&mut self) -> Result<(), Infallible> {
    Ok(())
  }

  async fn wait_for_any_edge(&mut self) -> Result<(), Infallible> {
    Ok(())
  }
}

impl InputPin for FakeIrq {
  fn is_high(&mut self) -> Result<bool, Infallible> {
    Ok(self.level_high)
  }

  fn is_low(&mut self) -> Result<bool, Infallible> {
    Ok(!self.level_high)
  }
}

impl OutputPin for FakeIrq {
  fn set_low(&mut self) -> Result<(), Infallible> {
    Ok(())
  }

  fn set_high(&mut self) -> Result<(), Infallible> {
    Ok(())
  }
}

pub(crate) type TestDriver = Tma884<'static, FakeBus, FakeIrq, FakeIrq>;

fn field(ofs: usize, bits: u8, bofs: u8) -> TchAbsParams {
  let (size, max) = bits_to_bytes(bits);
  TchAbsParams { ofs, size, max, bofs }
}

fn test_offsets() -> SysInfoOffsets {
  SysInfoOffsets {
    map_sz: 256,
    cydata_ofs: 16,
    test_ofs: 64,
    pcfg_ofs: 68,
    opcfg_ofs: 80,
    ddata_ofs: 128,
    mdata_ofs: 160,
    cmd_ofs: 0x02,
    rep_ofs: 17,
    rep_sz: 200,
    num_btns: 0,
    num_btn_regs: 0,
    tt_stat_ofs: 20,
    obj_cfg0: 0,
    max_tchs: 10,
    tch_rec_siz: 10,
    mode_size: 21,
    data_size: 100,
    btn_rec_siz: 0,
    btn_diff_ofs: 0,
    btn_diff_siz: 0,
    tch_abs: [
      field(0, 12, 0), // X
      field(2, 12, 0), // Y
      field(4, 8, 0),  // P
      field(5, 5, 3),  // T
      field(6, 2, 0),  // E
      field(6, 2, 2),  // O
      field(7, 8, 0),  // W
    ],
  }
}

fn test_cydata() -> CyData {
  CyData {
    product_id: 0x0884,
    fw_ver_major: 1,
    fw_ver_minor: 4,
    revctrl: [0; 8],
    bl_ver_major: 1,
    bl_ver_minor: 1,
    silicon_id: 0,
    ttsp_ver_major: 2,
    ttsp_ver_minor: 3,
    device_info: 0,
  }
}

fn test_pcfg() -> PanelConfig {
  PanelConfig {
    electrodes_x: 16,
    electrodes_y: 24,
    len_x: 0,
    len_y: 0,
    res_x: 880,
    res_y: 1280,
    max_z: 255,
  }
}

fn test_platform() -> PlatformData<'static> {
  let mut p = PlatformData::default();
  p.axes[Axis::X as usize] = AxisRange::new(0, 880);
  p.axes[Axis::Y as usize] = AxisRange::new(0, 1280);
  p.axes[Axis::Pressure as usize] = AxisRange::new(0, 255);
  p.axes[Axis::Size as usize] = AxisRange::new(0, 255);
  p.axes[Axis::Id as usize] = AxisRange::new(0, 15);
  p
}

/// Driver in the shape startup leaves it: sysinfo decoded, buffers sized,
/// operational and active.
pub(crate) fn seeded_driver() -> TestDriver {
  let mut ts = Tma884::new(FakeBus::default(), FakeIrq::default(), None, test_platform());
  let offsets = test_offsets();
  ts.si = Some(SysInfo { offsets, cydata: test_cydata(), pcfg: test_pcfg() });
  let _ = ts.xy_mode.resize(offsets.mode_size, 0);
  let _ = ts.xy_data.resize(offsets.data_size, 0);
  ts.driver_state = DriverState::Active;
  ts.current_mode = ControllerMode::Operational;
  ts
}

impl Tma884<'static, FakeBus, FakeIrq, FakeIrq> {
  pub(crate) fn set_cydata(&mut self, cydata: CyData) {
    if let Some(si) = self.si.as_mut() {
      si.cydata = cydata;
    }
  }
}

/// Build one touch record for the fixture layout: X/Y 12-bit big-endian,
/// pressure byte, track id in the top five bits of byte 5, event id in
/// the low bits of byte 6, size byte at 7.
pub(crate) fn record(x: u16, y: u16, p: u8, t: u8, event: TouchEvent) -> [u8; 10] {
  let e = match event {
    TouchEvent::NoEvent => 0,
    TouchEvent::TouchDown => 1,
    TouchEvent::Move => 2,
    TouchEvent::Liftoff => 3,
  };
  [(x >> 8) as u8, x as u8, (y >> 8) as u8, y as u8, p, t << 3, e, 0, 0, 0]
}
