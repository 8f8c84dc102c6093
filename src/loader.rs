//! Row-based flash loader.
//!
//! Bootloader traffic is framed: `[0x01 start][cmd][len lo][len hi]
//! [payload..][crc lo][crc hi][0x17 end]`, CRC over everything before it.
//! Each exchange is synchronous with its own status size and timeout; a
//! zero timeout means fire-and-forget (the exit command answers with a
//! reset, not a status).
//!
//! Rows are erased and programmed idempotently, so rerunning the loader on
//! the same image after an abort is safe. A failed row command leaves the
//! device parked in `Bootloader` for the caller to retry or report.

use embassy_time::{Duration, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;
use heapless::Vec;

use crate::crc::loader_crc;
use crate::defs::*;
use crate::rw::{BusAddr, RegisterBus};
use crate::{Error, Tma884};

const START_OF_PACKET: u8 = 0x01;
const END_OF_PACKET: u8 = 0x17;
const STATUS_BYTE: usize = 1;
const COMM_BUSY: u8 = 0xFF;
const CMD_BUSY: u8 = 0xFE;
const MAX_STATUS_SIZE: usize = 32;
const STATUS_READ_TRIES: usize = 2;

/// Flash geometry and segmenting.
pub(crate) const DATA_ROW_SIZE: usize = 288;
const PACKET_DATA_LEN: usize = 96;
const MAX_PACKET_LEN: usize = 512;
/// Erase retries per row on top of the first attempt.
const ERASE_RETRIES: usize = 5;

/* command opcodes and their response sizes */
const CMD_LDR_ENTER: u8 = 0x38;
const CMD_LDR_ENTER_STAT_SIZE: usize = 15;
const CMD_LDR_ERASE_ROW: u8 = 0x34;
const CMD_LDR_ERASE_ROW_STAT_SIZE: usize = 7;
const CMD_LDR_SEND_DATA: u8 = 0x37;
const CMD_LDR_SEND_DATA_STAT_SIZE: usize = 8;
const CMD_LDR_PROG_ROW: u8 = 0x39;
const CMD_LDR_PROG_ROW_STAT_SIZE: usize = 7;
const CMD_LDR_VERIFY_ROW: u8 = 0x3A;
const CMD_LDR_VERIFY_ROW_STAT_SIZE: usize = 8;
const CMD_LDR_VERIFY_CHKSUM: u8 = 0x31;
const CMD_LDR_VERIFY_CHKSUM_STAT_SIZE: usize = 8;
const CMD_LDR_EXIT: u8 = 0x3B;
const CMD_LDR_EXIT_STAT_SIZE: usize = 7;

/// Loader status codes, as named by the protocol.
fn status_name(status: u8) -> &'static str {
  match status {
    0 => "success",
    1 => "command",
    2 => "flash array",
    3 => "packet data",
    4 => "packet length",
    5 => "packet checksum",
    6 => "flash protection",
    7 => "flash checksum",
    8 => "verify image",
    15 => "invalid command",
    _ => "unknown",
  }
}

/// Identity returned by the enter-loader exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceId {
  pub silicon_id: u32,
  pub rev_id: u8,
  pub bl_ver: u32,
}

/// One parsed unit of the firmware image.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HexImageRow {
  pub array_id: u8,
  pub row_num: u16,
  pub row_size: u16,
  pub row_data: [u8; DATA_ROW_SIZE],
}

impl HexImageRow {
  /// `{array_id:u8}{row_num:u16 BE}{row_size:u16 BE}{row_data:288}`.
  pub(crate) const RECORD_SIZE: usize = 1 + 2 + 2 + DATA_ROW_SIZE;

  pub(crate) fn parse(rec: &[u8]) -> Result<Self, ()> {
    if rec.len() < Self::RECORD_SIZE {
      return Err(());
    }
    let row_size = u16::from_be_bytes([rec[3], rec[4]]);
    if usize::from(row_size) > DATA_ROW_SIZE {
      return Err(());
    }
    let mut row_data = [0u8; DATA_ROW_SIZE];
    row_data.copy_from_slice(&rec[5..5 + DATA_ROW_SIZE]);
    Ok(Self {
      array_id: rec[0],
      row_num: u16::from_be_bytes([rec[1], rec[2]]),
      row_size,
      row_data,
    })
  }
}

/// Frame a loader packet; the CRC goes out low byte first.
pub(crate) fn frame_packet(cmd: u8, payload: &[u8]) -> Vec<u8, MAX_PACKET_LEN> {
  let mut pkt = Vec::new();
  let _ = pkt.push(START_OF_PACKET);
  let _ = pkt.push(cmd);
  let _ = pkt.push(payload.len() as u8);
  let _ = pkt.push((payload.len() >> 8) as u8);
  let _ = pkt.extend_from_slice(payload);
  let crc = loader_crc(&pkt);
  let _ = pkt.push(crc as u8);
  let _ = pkt.push((crc >> 8) as u8);
  let _ = pkt.push(END_OF_PACKET);
  pkt
}

impl<'a, B, IRQ, RST> Tma884<'a, B, IRQ, RST>
where
  B: RegisterBus,
  IRQ: Wait + InputPin,
  RST: OutputPin,
{
  /// Wait for the status interrupt and read a status packet, re-reading
  /// while the device reports itself busy.
  async fn ldr_get_status(
    &mut self,
    size: usize,
    timeout: Duration,
  ) -> Result<[u8; MAX_STATUS_SIZE], Error<B::Error>> {
    // a missed edge is recoverable; the busy codes below resynchronize
    self.wait_int_relaxed(timeout).await;

    let mut buf = [0u8; MAX_STATUS_SIZE];
    for _ in 0..STATUS_READ_TRIES {
      self.read_block(BusAddr::Loader, REG_BASE, &mut buf[..size]).await?;
      if buf[STATUS_BYTE] == COMM_BUSY || buf[STATUS_BYTE] == CMD_BUSY {
        Timer::after_millis(RETRY_DELAY_MS).await;
      } else {
        break;
      }
    }
    Ok(buf)
  }

  /// Send one framed command. With a nonzero timeout the status packet is
  /// awaited and verified; `stat_byte` selects which response byte to
  /// return.
  async fn ldr_send_cmd(
    &mut self,
    pkt: &[u8],
    status_size: usize,
    stat_byte: usize,
    timeout: Duration,
  ) -> Result<u8, Error<B::Error>> {
    self.write_block(BusAddr::Loader, REG_BASE, pkt).await?;

    if timeout.as_ticks() == 0 {
      return Ok(0);
    }

    let status_buf = self.ldr_get_status(status_size, timeout).await?;
    if status_buf[0] != START_OF_PACKET {
      log::error!("malformed loader status, start={:#04x}", status_buf[0]);
      return Err(Error::Protocol);
    }
    let status = status_buf[STATUS_BYTE];
    if status != 0 {
      log::error!("loader status={status} ({})", status_name(status));
      return Err(Error::Status(status));
    }
    Ok(if stat_byte < status_size { status_buf[stat_byte] } else { 0 })
  }

  /// Enter the loader; the response carries the device identity.
  async fn ldr_enter(&mut self) -> Result<DeviceId, Error<B::Error>> {
    let pkt = frame_packet(CMD_LDR_ENTER, &[]);

    self.write_block(BusAddr::Loader, REG_BASE, &pkt).await?;
    let status_buf = self.ldr_get_status(CMD_LDR_ENTER_STAT_SIZE, HALF_SEC_TMO).await?;

    if status_buf[0] != START_OF_PACKET || status_buf[STATUS_BYTE] != 0 {
      log::error!(
        "enter loader failed, status={} ({})",
        status_buf[STATUS_BYTE],
        status_name(status_buf[STATUS_BYTE])
      );
      return Err(Error::Status(status_buf[STATUS_BYTE]));
    }

    let id = DeviceId {
      silicon_id: u32::from_le_bytes([status_buf[4], status_buf[5], status_buf[6], status_buf[7]]),
      rev_id: status_buf[8],
      bl_ver: u32::from_le_bytes([status_buf[9], status_buf[10], status_buf[11], 0]),
    };
    log::debug!(
      "loader entered, silicon id={:#010x} rev={:#04x} bl={:#08x}",
      id.silicon_id,
      id.rev_id,
      id.bl_ver
    );
    Ok(id)
  }

  async fn ldr_erase_row(&mut self, row: &HexImageRow) -> Result<(), Error<B::Error>> {
    let payload = [row.array_id, row.row_num as u8, (row.row_num >> 8) as u8];
    let pkt = frame_packet(CMD_LDR_ERASE_ROW, &payload);
    self.ldr_send_cmd(&pkt, CMD_LDR_ERASE_ROW_STAT_SIZE, 0, HALF_SEC_TMO).await?;
    Ok(())
  }

  /// Program one row: the leading segments go out as send-data packets,
  /// the final segment rides the program-row command itself.
  async fn ldr_prog_row(&mut self, row: &HexImageRow) -> Result<(), Error<B::Error>> {
    let mut offset = 0;

    for segment in 0..(DATA_ROW_SIZE / PACKET_DATA_LEN) - 1 {
      let pkt = frame_packet(CMD_LDR_SEND_DATA, &row.row_data[offset..offset + PACKET_DATA_LEN]);
      if let Err(e) = self.ldr_send_cmd(&pkt, CMD_LDR_SEND_DATA_STAT_SIZE, 0, HALF_SEC_TMO).await {
        log::error!("send row={} segment={segment} fail", row.row_num);
        return Err(e);
      }
      offset += PACKET_DATA_LEN;
    }

    let mut payload: Vec<u8, { PACKET_DATA_LEN + 3 }> = Vec::new();
    let _ = payload.push(row.array_id);
    let _ = payload.push(row.row_num as u8);
    let _ = payload.push((row.row_num >> 8) as u8);
    let _ = payload.extend_from_slice(&row.row_data[offset..offset + PACKET_DATA_LEN]);
    let pkt = frame_packet(CMD_LDR_PROG_ROW, &payload);
    self.ldr_send_cmd(&pkt, CMD_LDR_PROG_ROW_STAT_SIZE, 0, HALF_SEC_TMO).await?;
    Ok(())
  }

  /// Verify one row. The per-row checksum byte is returned for logging;
  /// only the success of the exchange itself gates the load.
  async fn ldr_verify_row(&mut self, row: &HexImageRow) -> Result<u8, Error<B::Error>> {
    let payload = [row.array_id, row.row_num as u8, (row.row_num >> 8) as u8];
    let pkt = frame_packet(CMD_LDR_VERIFY_ROW, &payload);
    self.ldr_send_cmd(&pkt, CMD_LDR_VERIFY_ROW_STAT_SIZE, 4, HALF_SEC_TMO).await
  }

  /// Whole-image checksum exchange; advisory in this protocol revision.
  async fn ldr_verify_chksum(&mut self) -> Result<u8, Error<B::Error>> {
    let pkt = frame_packet(CMD_LDR_VERIFY_CHKSUM, &[]);
    self.ldr_send_cmd(&pkt, CMD_LDR_VERIFY_CHKSUM_STAT_SIZE, 4, HALF_SEC_TMO).await
  }

  /// Leave the loader. Fire-and-forget: the device answers by resetting
  /// into the application, not with a status packet.
  pub(crate) async fn ldr_exit(&mut self) -> Result<(), Error<B::Error>> {
    let pkt = frame_packet(CMD_LDR_EXIT, &[]);
    self.ldr_send_cmd(&pkt, CMD_LDR_EXIT_STAT_SIZE, 0, Duration::from_ticks(0)).await?;
    Ok(())
  }

  /// Reflash the whole firmware image.
  ///
  /// Rows are strictly sequential: erase (retried), program, verify. Any
  /// failure beyond the erase retries aborts the load and leaves the
  /// device in `Bootloader`; partial writes are never rolled back.
  pub(crate) async fn load_app(&mut self, fw: &[u8]) -> Result<(), Error<B::Error>> {
    if fw.is_empty() || fw.len() % HexImageRow::RECORD_SIZE != 0 {
      log::error!("firmware image is misaligned, len={}", fw.len());
      return Err(Error::InvalidImage);
    }

    log::info!("start load app, {} rows", fw.len() / HexImageRow::RECORD_SIZE);

    self.reset().await?;
    self.wait_int(TEN_SEC_TMO * 2).await?;
    self.change_state(DriverState::Bootloader);

    let dev_id = self.ldr_enter().await.map_err(|e| {
      log::error!("cannot start loader");
      self.change_state(DriverState::Bootloader);
      e
    })?;
    self.device_id = Some(dev_id);

    let mut row_count = 0;
    for rec in fw.chunks_exact(HexImageRow::RECORD_SIZE) {
      row_count += 1;
      let row = match HexImageRow::parse(rec) {
        Ok(row) => row,
        Err(()) => {
          log::error!("parse row error, row_count={row_count}");
          // a malformed image is not a device fault; leave the loader
          return match self.ldr_exit().await {
            Ok(()) => {
              self.change_state(DriverState::Transfer);
              Err(Error::InvalidImage)
            }
            Err(e) => {
              self.change_state(DriverState::Bootloader);
              Err(e)
            }
          };
        }
      };
      log::debug!(
        "row_count={row_count} array_id={:#04x} row_num={} row_size={}",
        row.array_id,
        row.row_num,
        row.row_size
      );

      let mut tries = 0;
      loop {
        match self.ldr_erase_row(&row).await {
          Ok(()) => break,
          Err(e) => {
            log::error!("erase row={} fail, try={tries}", row.row_num);
            tries += 1;
            if tries > ERASE_RETRIES {
              self.change_state(DriverState::Bootloader);
              return Err(e);
            }
          }
        }
      }

      if let Err(e) = self.ldr_prog_row(&row).await {
        log::error!("program row={} fail", row.row_num);
        self.change_state(DriverState::Bootloader);
        return Err(e);
      }

      match self.ldr_verify_row(&row).await {
        Ok(row_chksum) => log::debug!("row={} checksum={row_chksum:#04x}", row.row_num),
        Err(e) => {
          log::error!("verify row={} fail", row.row_num);
          self.change_state(DriverState::Bootloader);
          return Err(e);
        }
      }
    }

    match self.ldr_verify_chksum().await {
      Ok(app_chksum) => log::debug!("application checksum={app_chksum:#04x}"),
      // advisory only in this protocol revision
      Err(_) => log::error!("verify checksum fail"),
    }

    if let Err(e) = self.ldr_exit().await {
      log::error!("error on exit loader");
      self.change_state(DriverState::Bootloader);
      return Err(e);
    }

    // parking state; the caller always runs startup after a load
    self.change_state(DriverState::Transfer);
    Ok(())
  }

  /// Reflash on demand, e.g. from a host-triggered update. The caller
  /// runs [`Tma884::startup`] afterwards to bring the device back up.
  pub async fn load_firmware(&mut self, image: &[u8]) -> Result<(), Error<B::Error>> {
    self.load_app(image).await
  }

  /// Identity captured by the last loader-enter exchange.
  pub fn device_id(&self) -> Option<DeviceId> {
    self.device_id
  }
}
