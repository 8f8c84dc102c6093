#![no_std]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Async, `no_std` driver core for the Cypress TrueTouch Gen4
//! (CY8CTMA884) touchscreen controller.
//!
//! The Gen4 parts expose a self-describing register map, a multi-touch
//! report pipeline, CRC-guarded configuration memory and a row-based flash
//! bootloader, all multiplexed over one interrupt line. This crate owns
//! that whole protocol surface:
//!
//! - Startup orchestration: reset, bootloader handshake, sysinfo decode,
//!   optional firmware/configuration update, operational hand-off
//! - Touch and capacitive-button extraction from the bit-packed records
//!   the device describes at run time
//! - CRC-compared configuration block sync (touch parameters, design and
//!   manufacturing data)
//! - In-field firmware reflash over the framed loader protocol
//! - Sleep/wake power transitions and a watchdog reachability probe
//!
//! The driver owns its bus, interrupt pin and optional reset pin; every
//! wait on the device is an awaited edge on the interrupt line with a
//! bounded timeout. `embedded-hal`/`embedded-hal-async` 1.0 traits keep it
//! portable across MCU families, and any transport that can address the
//! two device addresses can replace I²C through [`RegisterBus`].
//!
//! ```no_run
//! use embedded_hal_async::{digital::Wait, i2c::{I2c, SevenBitAddress}};
//! use embedded_hal::digital::{InputPin, OutputPin};
//! use tma884::{EventSink, I2cBus, PlatformData, Tma884};
//!
//! async fn example<I2C, IRQ, RST, E>(
//!   i2c: I2C,
//!   irq: IRQ,
//!   rst: RST,
//!   platform: PlatformData<'_>,
//!   sink: &mut impl EventSink,
//! ) -> Result<(), tma884::Error<E>>
//! where
//!   I2C: I2c<SevenBitAddress, Error = E>,
//!   IRQ: Wait + InputPin,
//!   RST: OutputPin,
//! {
//!   let bus = I2cBus::new(i2c, 0x24, 0x69);
//!   let mut touch = Tma884::new(bus, irq, Some(rst), platform);
//!   touch.startup().await?;
//!   loop {
//!     touch.process(sink).await?;
//!   }
//! }
//! ```

#[cfg(test)]
extern crate std;

mod blocks;
mod config;
mod control;
mod crc;
mod defs;
mod event;
mod init;
mod loader;
mod rw;
mod sysinfo;
#[cfg(test)]
pub(crate) mod testutil;

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;
use heapless::Vec;

pub use config::{Axis, AxisRange, ChargerMode, FirmwareImage, PlatformData, TransformFlags};
pub use crc::{config_crc, loader_crc};
pub use defs::{ControllerMode, DriverState};
pub use event::{Contact, EventSink, ObjectKind, TouchEvent};
pub use loader::DeviceId;
pub use rw::{BusAddr, I2cBus, RegisterBus};
pub use sysinfo::{CyData, PanelConfig};

use defs::*;
use event::Button;
use sysinfo::SysInfo;

/// Errors surfaced by the driver.
///
/// Transport retries happen below this level; `Bus` means the retries are
/// exhausted and the device is unreachable. `Invalid` is terminal: only an
/// external reset or power cycle recovers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
  /// Bus transaction failed after retry exhaustion.
  Bus(E),
  /// No completion within the operation's bounded wait.
  Timeout,
  /// Unexpected status byte, CRC mismatch or mode read-back mismatch.
  Protocol,
  /// The device answered a command with a nonzero status code.
  Status(u8),
  /// Firmware image is misaligned or a row exceeds the flash row size.
  InvalidImage,
  /// A platform-supplied block exceeds the protocol's size bound.
  Overflow,
  /// Reflash required but no platform firmware image is available.
  NoFirmware,
  /// The driver is in a terminal state.
  Invalid,
}

/// Driver core for the CY8CTMA884.
///
/// Single owner of all device state: the operating-mode machine, decoded
/// register-map geometry, touch/button snapshots and the pending power and
/// charger flags. Construct with [`Tma884::new`], run [`Tma884::startup`],
/// then feed interrupt edges through [`Tma884::process`].
pub struct Tma884<'a, B, IRQ, RST> {
  pub(crate) bus: B,
  pub(crate) irq: IRQ,
  pub(crate) rst: Option<RST>,
  pub(crate) platform: PlatformData<'a>,

  pub(crate) driver_state: DriverState,
  pub(crate) current_mode: ControllerMode,
  pub(crate) si: Option<SysInfo>,
  pub(crate) device_id: Option<DeviceId>,

  /// Operational mode/status register snapshot.
  pub(crate) xy_mode: Vec<u8, MODE_CAP>,
  /// Touch record bytes for all current contacts.
  pub(crate) xy_data: Vec<u8, XY_DATA_CAP>,
  pub(crate) buttons: Vec<Button, MAX_BTNS>,
  pub(crate) num_prv_tch: usize,

  pub(crate) low_power_enable: bool,
  pub(crate) was_suspended: bool,
  pub(crate) suspend_blocked: bool,
  pub(crate) charger_mode: ChargerMode,
  pub(crate) charger_update_pending: bool,
}

impl<'a, B, IRQ, RST> Tma884<'a, B, IRQ, RST>
where
  B: RegisterBus,
  IRQ: Wait + InputPin,
  RST: OutputPin,
{
  /// Create a driver instance around its bus and pins.
  ///
  /// Nothing touches the device until [`Tma884::startup`] runs; the
  /// platform data can still be adjusted after construction.
  pub fn new(bus: B, irq: IRQ, rst: Option<RST>, platform: PlatformData<'a>) -> Self {
    Self {
      bus,
      irq,
      rst,
      platform,
      driver_state: DriverState::Idle,
      current_mode: ControllerMode::Bootloader,
      si: None,
      device_id: None,
      xy_mode: Vec::new(),
      xy_data: Vec::new(),
      buttons: Vec::new(),
      num_prv_tch: 0,
      low_power_enable: false,
      was_suspended: false,
      suspend_blocked: false,
      charger_mode: ChargerMode::None,
      charger_update_pending: false,
    }
  }

  /// Current driver-side state.
  pub fn driver_state(&self) -> DriverState {
    self.driver_state
  }

  /// Operating mode the device was last confirmed in.
  pub fn controller_mode(&self) -> ControllerMode {
    self.current_mode
  }

  /// Release the driver and hand the peripherals back.
  pub fn release(self) -> (B, IRQ, Option<RST>) {
    (self.bus, self.irq, self.rst)
  }
}
