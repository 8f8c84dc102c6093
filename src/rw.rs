//! Register transport.
//!
//! The physical bus is an external collaborator: anything that can move
//! bytes to and from a 16-bit command offset at one of the two device
//! addresses can carry the driver. [`I2cBus`] adapts any
//! `embedded-hal-async` I²C peripheral; the bootloader address is accessed
//! raw (the loader protocol frames itself, there is no sub-address).
//!
//! Transient bus errors are retried here with a fixed inter-try delay and
//! are invisible to callers; only retry exhaustion surfaces as
//! [`Error::Bus`].

use embassy_time::{with_timeout, Duration, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;
use embedded_hal_async::i2c::{I2c, SevenBitAddress};

use crate::defs::{READ_RETRIES, RETRY_DELAY_MS, WRITE_RETRIES};
use crate::{Error, Tma884};

/// Which of the two device addresses a transfer targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusAddr {
  /// Touch/operational address; transfers carry a register sub-address.
  Touch,
  /// Bootloader address; raw framed packets, no sub-address.
  Loader,
}

/// Byte transport to the device register map.
#[allow(async_fn_in_trait)]
pub trait RegisterBus {
  type Error: core::fmt::Debug;

  async fn read(&mut self, addr: BusAddr, ofs: u16, buf: &mut [u8]) -> Result<(), Self::Error>;
  async fn write(&mut self, addr: BusAddr, ofs: u16, data: &[u8]) -> Result<(), Self::Error>;
}

/// Largest single write the I²C adapter will frame (sub-address + payload).
const I2C_WRITE_MAX: usize = 255;

/// I²C adapter for the register bus.
///
/// The register map is byte addressed; offsets are truncated to the low
/// byte on the wire, which covers every block the protocol reaches in
/// operational and sysinfo modes.
pub struct I2cBus<I> {
  i2c: I,
  touch_addr: u8,
  loader_addr: u8,
}

impl<I> I2cBus<I> {
  pub fn new(i2c: I, touch_addr: u8, loader_addr: u8) -> Self {
    Self { i2c, touch_addr, loader_addr }
  }
}

impl<I, E> RegisterBus for I2cBus<I>
where
  I: I2c<SevenBitAddress, Error = E>,
  E: core::fmt::Debug,
{
  type Error = E;

  async fn read(&mut self, addr: BusAddr, ofs: u16, buf: &mut [u8]) -> Result<(), E> {
    match addr {
      BusAddr::Touch => self.i2c.write_read(self.touch_addr, &[ofs as u8], buf).await,
      BusAddr::Loader => self.i2c.read(self.loader_addr, buf).await,
    }
  }

  async fn write(&mut self, addr: BusAddr, ofs: u16, data: &[u8]) -> Result<(), E> {
    match addr {
      BusAddr::Touch => {
        debug_assert!(data.len() < I2C_WRITE_MAX);
        let len = data.len().min(I2C_WRITE_MAX);
        let mut frame = [0u8; I2C_WRITE_MAX + 1];
        frame[0] = ofs as u8;
        frame[1..=len].copy_from_slice(&data[..len]);
        self.i2c.write(self.touch_addr, &frame[..=len]).await
      }
      BusAddr::Loader => self.i2c.write(self.loader_addr, data).await,
    }
  }
}

/// Read with bounded retries. Free function so callers can split borrows
/// between the bus and a buffer living in the same driver struct.
pub(crate) async fn read_block<B: RegisterBus>(
  bus: &mut B,
  addr: BusAddr,
  ofs: u16,
  buf: &mut [u8],
) -> Result<(), Error<B::Error>> {
  let mut tries = 0;
  loop {
    match bus.read(addr, ofs, buf).await {
      Ok(()) => return Ok(()),
      Err(e) if tries + 1 >= READ_RETRIES => {
        log::error!("bus read block failed at ofs={ofs:#04x}");
        return Err(Error::Bus(e));
      }
      Err(_) => {
        tries += 1;
        Timer::after_millis(RETRY_DELAY_MS).await;
      }
    }
  }
}

/// Write with bounded retries; see [`read_block`].
pub(crate) async fn write_block<B: RegisterBus>(
  bus: &mut B,
  addr: BusAddr,
  ofs: u16,
  data: &[u8],
) -> Result<(), Error<B::Error>> {
  let mut tries = 0;
  loop {
    match bus.write(addr, ofs, data).await {
      Ok(()) => return Ok(()),
      Err(e) if tries + 1 >= WRITE_RETRIES => {
        log::error!("bus write block failed at ofs={ofs:#04x}");
        return Err(Error::Bus(e));
      }
      Err(_) => {
        tries += 1;
        Timer::after_millis(RETRY_DELAY_MS).await;
      }
    }
  }
}

impl<'a, B, IRQ, RST> Tma884<'a, B, IRQ, RST>
where
  B: RegisterBus,
  IRQ: Wait + InputPin,
  RST: OutputPin,
{
  pub(crate) async fn read_block(
    &mut self,
    addr: BusAddr,
    ofs: u16,
    buf: &mut [u8],
  ) -> Result<(), Error<B::Error>> {
    read_block(&mut self.bus, addr, ofs, buf).await
  }

  pub(crate) async fn write_block(
    &mut self,
    addr: BusAddr,
    ofs: u16,
    data: &[u8],
  ) -> Result<(), Error<B::Error>> {
    write_block(&mut self.bus, addr, ofs, data).await
  }

  pub(crate) async fn read_u8(&mut self, addr: BusAddr, ofs: u16) -> Result<u8, Error<B::Error>> {
    let mut b = [0u8; 1];
    self.read_block(addr, ofs, &mut b).await?;
    Ok(b[0])
  }

  /// Wait for the device to assert the interrupt line, bounded.
  pub(crate) async fn wait_int(&mut self, timeout: Duration) -> Result<(), Error<B::Error>> {
    match with_timeout(timeout, self.irq.wait_for_low()).await {
      Ok(_) => Ok(()),
      Err(_) => {
        log::warn!("timeout waiting for interrupt");
        Err(Error::Timeout)
      }
    }
  }

  /// Like [`Self::wait_int`] but a missed edge is tolerated; the caller
  /// re-synchronizes by reading registers afterwards.
  pub(crate) async fn wait_int_relaxed(&mut self, timeout: Duration) {
    if with_timeout(timeout, self.irq.wait_for_low()).await.is_err() {
      log::debug!("interrupt wait elapsed; continuing on register state");
    }
  }

  pub(crate) fn irq_asserted(&mut self) -> bool {
    matches!(self.irq.is_low(), Ok(true))
  }
}
