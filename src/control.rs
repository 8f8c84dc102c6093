//! Mode and state control.
//!
//! All host/device synchronization runs through here: the mode-change
//! protocol on the host-mode register, the command-ready protocol on the
//! operational command register, the flow-control handshake, and the
//! operational worker that turns an asserted interrupt line into touch and
//! button events.
//!
//! Commands are strictly request/response; the transient driver states
//! (`Transfer`, `Command`, `OpCommand`) mark an outstanding exchange so an
//! interrupt edge is never misread as a touch report.

use embassy_time::{with_timeout, Duration, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;

use crate::config::{Axis, ChargerMode};
use crate::defs::*;
use crate::event::{
  apply_transforms, button_pass, extract_record, ButtonState, Contact, EventSink, ObjectKind,
  TouchEvent,
};
use crate::rw::{self, BusAddr, RegisterBus};
use crate::{Error, Tma884};

pub(crate) fn chk_cmd_rdy(cmd: u8) -> bool {
  cmd & CMD_RDY_BIT != 0
}

pub(crate) fn chk_mode_change(cmd: u8) -> bool {
  cmd & HST_MODE_CHANGE == 0
}

impl<'a, B, IRQ, RST> Tma884<'a, B, IRQ, RST>
where
  B: RegisterBus,
  IRQ: Wait + InputPin,
  RST: OutputPin,
{
  pub(crate) fn change_state(&mut self, new_state: DriverState) {
    self.driver_state = new_state;
    log::debug!("driver state {:?}", self.driver_state);
  }

  /// Acknowledge a host-mode read by writing back the toggled handshake
  /// bit; every read edge must be released this way or the device stalls
  /// on its internal flow-control gate.
  pub(crate) async fn handshake(&mut self, hst_mode: u8) -> Result<(), Error<B::Error>> {
    let mut cmd = if hst_mode & HST_HANDSHAKE_BIT != 0 {
      hst_mode & !HST_HANDSHAKE_BIT
    } else {
      hst_mode | HST_HANDSHAKE_BIT
    };

    if self.low_power_enable {
      cmd |= HST_LOW_POWER;
    } else {
      cmd &= !HST_LOW_POWER;
    }

    self.write_block(BusAddr::Touch, REG_BASE, &[cmd]).await
  }

  /// Read the current host mode and acknowledge it.
  pub(crate) async fn cmd_handshake(&mut self) -> Result<(), Error<B::Error>> {
    let hst_mode = self.read_u8(BusAddr::Touch, REG_BASE).await?;
    self.handshake(hst_mode).await
  }

  /// Switch the device to synchronous level handshaking.
  ///
  /// A read-back mismatch is logged but tolerated; the device falls back
  /// to its own handshake timeout.
  pub(crate) async fn handshake_enable(&mut self) -> Result<(), Error<B::Error>> {
    let ofs = self.offsets()?.cmd_ofs;
    let mut cmd_dat = [0u8; NUM_CMD_DAT + 1];
    cmd_dat[0] = OP_CMD_HANDSHAKE_ENABLE;
    cmd_dat[1] = 0x03; // synchronous level handshake

    self
      .put_cmd_wait(ofs, &cmd_dat, HALF_SEC_TMO, Some(chk_cmd_rdy), DriverState::Command)
      .await?;

    let mut readback = [0u8; NUM_CMD_DAT + 1];
    self.read_block(BusAddr::Touch, ofs, &mut readback).await?;
    if readback[6] != cmd_dat[1] {
      // no error; the driver handshakes anyway
      log::error!("device did not confirm handshake enable");
    }
    Ok(())
  }

  /// Write a command buffer and wait for the device to flag completion.
  ///
  /// The driver state is parked in `cmd_state` for the duration so the
  /// interrupt dispatch knows a response edge is expected, and restored on
  /// every exit path. When the interrupt fires before the ready condition
  /// is visible the status register is re-read up to two extra times; a
  /// plain timeout reports [`Error::Timeout`].
  pub(crate) async fn put_cmd_wait(
    &mut self,
    ofs: u16,
    cmd: &[u8],
    timeout: Duration,
    cond: Option<fn(u8) -> bool>,
    cmd_state: DriverState,
  ) -> Result<u8, Error<B::Error>> {
    let saved_state = self.driver_state;
    if cmd_state != DriverState::OpCommand {
      self.change_state(DriverState::Transfer);
    }
    self.change_state(cmd_state);

    if let Err(e) = self.write_block(BusAddr::Touch, ofs, cmd).await {
      log::error!("failed writing command buffer");
      self.change_state(saved_state);
      return Err(e);
    }

    let mut tries = 0;
    let result = loop {
      let timed_out = with_timeout(timeout, self.irq.wait_for_low()).await.is_err();

      let status = match self.read_u8(BusAddr::Touch, ofs).await {
        Ok(status) => status,
        Err(e) => {
          log::error!("failed reading command status");
          break Err(e);
        }
      };

      match cond {
        Some(ready) if !ready(status) => {
          if timed_out {
            log::error!("timeout waiting for command ready");
            break Err(Error::Timeout);
          }
          if tries < CMD_RDY_RETRIES {
            // interrupt fired but the device needs more time
            tries += 1;
            continue;
          }
          log::error!("command not ready, status={status:#04x}");
          break Err(Error::Protocol);
        }
        _ => break Ok(status),
      }
    };

    self.change_state(saved_state);
    result
  }

  /// Issue a mode change on the host-mode register and verify it took.
  ///
  /// Success requires the mode-change bit to clear and the read-back mode
  /// to equal the request; the mandatory acknowledgment handshake failing
  /// is tolerated (the device has its own handshake timeout).
  async fn set_device_mode(
    &mut self,
    target: TargetMode,
    new_cur_mode: ControllerMode,
  ) -> Result<(), Error<B::Error>> {
    let cmd = target.bits() | HST_MODE_CHANGE;

    let readback = self
      .put_cmd_wait(REG_BASE, &[cmd], TEN_SEC_TMO, Some(chk_mode_change), DriverState::Command)
      .await?;

    if readback != target.bits() {
      log::error!("failed to switch to {target:?} mode, host mode {readback:#04x}");
      return Err(Error::Protocol);
    }

    self.current_mode = new_cur_mode;
    if self.handshake(readback).await.is_err() {
      // continue; rely on handshake timeout
      log::error!("handshake fail after mode change");
    }
    Ok(())
  }

  /// Mode change with the surrounding driver-state bookkeeping. A failed
  /// change is fatal for the session: the state drops to `Idle` and the
  /// caller escalates to a restart.
  pub(crate) async fn set_mode(&mut self, target: TargetMode) -> Result<(), Error<B::Error>> {
    let (new_cur_mode, new_state) = match target {
      TargetMode::Operational => {
        self.change_state(DriverState::Ready);
        (ControllerMode::Operational, DriverState::Active)
      }
      TargetMode::Sysinfo => (ControllerMode::Sysinfo, DriverState::Sysinfo),
      TargetMode::Config => (ControllerMode::Operational, self.driver_state),
    };

    match self.set_device_mode(target, new_cur_mode).await {
      Ok(()) => {
        self.change_state(new_state);
        Ok(())
      }
      Err(e) => {
        self.change_state(DriverState::Idle);
        Err(e)
      }
    }
  }

  pub(crate) async fn soft_reset(&mut self) -> Result<(), Error<B::Error>> {
    self.write_block(BusAddr::Touch, REG_BASE, &[HST_SOFT_RESET]).await
  }

  /// Reset the device into its bootloader, by pin when the platform wired
  /// one, by soft-reset command otherwise.
  pub(crate) async fn reset(&mut self) -> Result<(), Error<B::Error>> {
    let mut hw_ok = false;
    if let Some(rst) = self.rst.as_mut() {
      hw_ok = rst.set_low().is_ok();
      if hw_ok {
        Timer::after_millis(RETRY_DELAY_MS).await;
        hw_ok = rst.set_high().is_ok();
        Timer::after_millis(RETRY_DELAY_MS).await;
      }
    }

    if !hw_ok {
      self.soft_reset().await?;
    }

    self.current_mode = ControllerMode::Bootloader;
    self.change_state(DriverState::Bootloader);
    Ok(())
  }

  /// Refresh the operational mode/status snapshot.
  pub(crate) async fn load_status_regs(&mut self) -> Result<(), Error<B::Error>> {
    let mode_size = self.offsets()?.mode_size;
    rw::read_block(&mut self.bus, BusAddr::Touch, REG_BASE, &mut self.xy_mode[..mode_size]).await
  }

  /// Wait for the interrupt line and service whatever the current state
  /// says the edge means. On `Err` the device needs a restart; run
  /// [`Tma884::startup`].
  pub async fn process(&mut self, sink: &mut impl EventSink) -> Result<(), Error<B::Error>> {
    let _ = self.irq.wait_for_low().await;
    self.dispatch(sink).await
  }

  pub(crate) async fn dispatch(&mut self, sink: &mut impl EventSink) -> Result<(), Error<B::Error>> {
    match self.driver_state {
      DriverState::Active => self.xy_worker(sink).await,
      DriverState::Sleep => {
        log::info!("touch after sleep entry or unexpected wake event");
        // on failure the restart should put the device back to sleep
        if let Err(e) = self.wakeup().await {
          self.was_suspended = true;
          return Err(e);
        }
        if let Err(e) = self.enter_sleep().await {
          self.was_suspended = true;
          return Err(e);
        }
        Ok(())
      }
      DriverState::Idle => {
        if self.si.is_none() {
          // initialization incomplete; nothing to dispatch on
          return Ok(());
        }
        log::info!("interrupt received in idle state");
        self.load_status_regs().await?;
        let rep_ofs = self.offsets()?.rep_ofs;
        let rep_stat = ReportStatus::from_bits(self.xy_mode[rep_ofs + 1]);
        if rep_stat.bootloader() {
          log::info!("bootloader mode found in idle state");
          return Err(Error::Protocol);
        }
        // device is answering; try processing touches
        self.change_state(DriverState::Active);
        self.xy_worker(sink).await
      }
      // command exchanges wait on the line inline; a stray edge in any
      // other state carries no work
      _ => Ok(()),
    }
  }

  /// Read and report all current touches and button edges.
  pub(crate) async fn xy_worker(&mut self, sink: &mut impl EventSink) -> Result<(), Error<B::Error>> {
    let o = self.offsets()?;

    // two reads: mode/status bytes, then touch status + first record; a
    // third read picks up the remaining records
    self.xy_mode[..o.mode_size].fill(0);
    rw::read_block(&mut self.bus, BusAddr::Touch, REG_BASE, &mut self.xy_mode[..o.mode_size])
      .await?;

    let mut touch1 = [0u8; 1 + MAX_RECORD_SIZE];
    self
      .read_block(BusAddr::Touch, o.tt_stat_ofs, &mut touch1[..1 + o.tch_rec_siz])
      .await?;

    let hst_mode = self.xy_mode[usize::from(REG_BASE)];
    let rep_len = self.xy_mode[o.rep_ofs];
    let rep_stat = ReportStatus::from_bits(self.xy_mode[o.rep_ofs + 1]);
    let tt_stat = TouchStatus::from_bits(touch1[0]);
    log::debug!(
      "hst_mode={hst_mode:#04x} rep_len={rep_len} rep_stat={:#04x} tt_stat={:#04x}",
      rep_stat.into_bits(),
      tt_stat.into_bits()
    );

    if rep_len == 0 {
      log::error!("report length error");
      return Ok(());
    }

    let reported = usize::from(tt_stat.count());
    let readable = reported.min(o.max_tchs);
    if readable > 0 {
      self.xy_data[..o.tch_rec_siz].copy_from_slice(&touch1[1..1 + o.tch_rec_siz]);
    }
    if readable > 1 {
      let rest = (readable - 1) * o.tch_rec_siz;
      rw::read_block(
        &mut self.bus,
        BusAddr::Touch,
        o.tt_stat_ofs + 1 + o.tch_rec_siz as u16,
        &mut self.xy_data[o.tch_rec_siz..o.tch_rec_siz + rest],
      )
      .await?;
    }

    // flow control handshake
    if self.handshake(hst_mode).await.is_err() {
      // continue; rely on handshake timeout
      log::error!("handshake fail on operational regs");
    }

    let mut num_cur_tch = reported;
    if self.driver_state == DriverState::Idle {
      log::error!("idle state detected mid-report");
      return Ok(());
    } else if rep_stat.bad_packet() {
      log::error!("invalid buffer detected, tt_stat={:#04x}", tt_stat.into_bits());
      return Ok(());
    } else if rep_stat.bootloader() {
      log::info!("bootloader mode found in active state");
      return Err(Error::Protocol);
    } else if HostMode::from_bits(hst_mode).mode() == HostMode::from_bits(HST_SYSINFO_MODE).mode() {
      // fell back to sysinfo mode; push it to operational
      log::error!("sysinfo mode {hst_mode:#04x} detected in active state");
      match self.set_mode(TargetMode::Operational).await {
        Ok(()) => {
          self.change_state(DriverState::Active);
          if self.handshake_enable().await.is_err() {
            log::error!("fail enable handshake");
          }
        }
        Err(e) => {
          self.change_state(DriverState::Idle);
          log::error!("fail set operational mode");
          return Err(e);
        }
      }
      return Ok(());
    } else if tt_stat.large_area() {
      // terminate all active tracks
      log::debug!("large area detected");
      num_cur_tch = 0;
    } else if num_cur_tch > o.max_tchs {
      if tt_stat.count() == TCH_COUNT_ERR {
        log::error!("touch count error detected");
        num_cur_tch = 0;
      } else {
        log::error!("too many touches, clamping (n={num_cur_tch})");
        num_cur_tch = NUM_TCH_ID;
      }
    }

    if num_cur_tch > 0 {
      if self.num_prv_tch == 0 {
        sink.touch_key(true);
      }
      self.report_touches(num_cur_tch.min(readable), sink);
    } else {
      if self.num_prv_tch != 0 {
        sink.touch_key(false);
        sink.sync_only();
        sink.sync();
      }
      self.num_prv_tch = 0;
    }

    if o.num_btns > 0 {
      for pass in [ButtonState::Released, ButtonState::Pressed] {
        let mut remaining = o.num_btns;
        for reg in 0..o.num_btn_regs {
          let mask = self.xy_mode[o.rep_ofs + 2 + reg];
          let count = remaining.min(NUM_BTN_PER_REG);
          button_pass(&mut self.buttons, reg * NUM_BTN_PER_REG, mask, count, pass, sink);
          remaining -= count;
        }
      }
    }

    Ok(())
  }

  fn report_touches(&mut self, num_cur_tch: usize, sink: &mut impl EventSink) {
    let o = match self.si.as_ref() {
      Some(si) => si.offsets,
      None => return,
    };
    let id_range = *self.platform.axis(Axis::Id);
    let mut emitted = 0;

    for i in 0..num_cur_tch {
      let rec = &self.xy_data[i * o.tch_rec_siz..(i + 1) * o.tch_rec_siz];
      let mut abs = extract_record(rec, &o.tch_abs);

      if abs[TCH_T] < id_range.min || abs[TCH_T] > id_range.max {
        log::error!("touch={i} has bad track_id={} max_id={}", abs[TCH_T], id_range.max);
        sink.sync_only();
        emitted += 1;
        continue;
      }

      apply_transforms(&mut abs, &self.platform);

      let event = TouchEvent::from_bits(abs[TCH_E]);
      if event == TouchEvent::Liftoff {
        // record reports the last position; skip it and let the count
        // transition generate the lift
        log::debug!("t={} liftoff", abs[TCH_T]);
        continue;
      }

      let id = if id_range.enabled { abs[TCH_T] - id_range.min } else { abs[TCH_T] };
      let contact = Contact {
        id,
        x: abs[TCH_X],
        y: abs[TCH_Y],
        pressure: abs[TCH_P],
        size: abs[TCH_W],
        event,
        object: ObjectKind::from_bits(abs[TCH_O]),
      };
      log::debug!("t={} x={} y={} z={}", contact.id, contact.x, contact.y, contact.pressure);
      sink.touch(&contact);
      emitted += 1;
    }

    if emitted > 0 {
      sink.sync();
    }
    self.num_prv_tch = num_cur_tch;
  }

  /// Put the device into deep sleep.
  pub(crate) async fn enter_sleep(&mut self) -> Result<(), Error<B::Error>> {
    self.write_block(BusAddr::Touch, REG_BASE, &[HST_DEEP_SLEEP]).await?;
    self.change_state(DriverState::Sleep);
    Ok(())
  }

  /// Wake the device with bus traffic and re-synchronize.
  ///
  /// The first read may fail while the part is still waking; the bounded
  /// command-ready wait afterwards is what actually gates progress.
  pub(crate) async fn wakeup(&mut self) -> Result<(), Error<B::Error>> {
    self.change_state(DriverState::Command);

    if self.read_u8(BusAddr::Touch, REG_BASE).await.is_err() {
      // not ready to answer yet; wait for the ready edge instead
      log::debug!("wake read ignored; waiting for ready interrupt");
    }

    self.wait_int_relaxed(HALF_SEC_TMO).await;

    let hst_mode = self.read_u8(BusAddr::Touch, REG_BASE).await?;
    if self.handshake(hst_mode).await.is_err() {
      // continue; rely on handshake timeout
      log::error!("fail resume handshake");
    }
    self.change_state(DriverState::Active);
    Ok(())
  }

  /// Suspend the device. Returns `true` when the device is asleep; `false`
  /// when a state transition is in flight and the suspend is deferred.
  pub async fn suspend(&mut self) -> Result<bool, Error<B::Error>> {
    match self.driver_state {
      DriverState::Active => {
        log::debug!("suspending");
        self.enter_sleep().await?;
        self.suspend_blocked = false;
        Ok(true)
      }
      DriverState::Sleep => {
        log::error!("already in sleep state");
        Ok(true)
      }
      // these states are changing, or about to change, the device state;
      // they must complete before a suspend is safe
      DriverState::Bootloader
      | DriverState::Command
      | DriverState::OpCommand
      | DriverState::Sysinfo
      | DriverState::Ready
      | DriverState::Transfer => {
        log::debug!("suspend blocked in {:?} state", self.driver_state);
        self.suspend_blocked = true;
        Ok(false)
      }
      DriverState::ExitBootloader | DriverState::Idle | DriverState::Invalid => {
        log::error!("cannot suspend from {:?} state", self.driver_state);
        Err(Error::Invalid)
      }
    }
  }

  /// Resume from sleep. On wake failure the caller restarts the device.
  pub async fn resume(&mut self) -> Result<(), Error<B::Error>> {
    match self.driver_state {
      DriverState::Sleep => {
        self.wakeup().await?;
        self.change_state(DriverState::Active);
      }
      other => log::error!("resume in {other:?} state"),
    }

    // replay a charger/HDMI change made while the device slept
    if self.charger_update_pending {
      Timer::after_millis(RETRY_DELAY_MS).await;
      self.charger_update_pending = false;
      self.write_charger_config().await?;
    }
    Ok(())
  }

  /// Report the charger/HDMI noise environment to the device.
  ///
  /// While asleep the write is deferred and replayed on resume. The
  /// command runs in the `OpCommand` state so it does not disturb active
  /// touch processing.
  pub async fn set_charger_mode(&mut self, mode: ChargerMode) -> Result<(), Error<B::Error>> {
    if self.charger_mode == mode {
      return Ok(());
    }
    self.charger_mode = mode;

    if self.driver_state == DriverState::Sleep {
      self.charger_update_pending = true;
      return Ok(());
    }
    self.write_charger_config().await
  }

  pub(crate) async fn write_charger_config(&mut self) -> Result<(), Error<B::Error>> {
    let ofs = self.offsets()?.cmd_ofs;
    let lpe = self.low_power_enable;
    self.low_power_enable = false;

    let result = async {
      let mut cmd_dat = [0u8; NUM_CMD_DAT + 1];
      cmd_dat[0] = OP_CMD_SET_CHRGHDMI;
      cmd_dat[1] = self.charger_mode.enabled_bit();

      self
        .put_cmd_wait(ofs, &cmd_dat, HALF_SEC_TMO, Some(chk_cmd_rdy), DriverState::OpCommand)
        .await?;

      let mut readback = [0u8; NUM_CMD_DAT + 1];
      self.read_block(BusAddr::Touch, ofs, &mut readback).await?;
      if readback[1] != 0 {
        log::error!("set charger/hdmi status={} error", readback[1]);
        return Err(Error::Status(readback[1]));
      }

      self.cmd_handshake().await
    }
    .await;

    self.low_power_enable = lpe;

    // a suspend arrived while the command was in flight; honor it now
    if self.suspend_blocked {
      log::debug!("suspending after charger/hdmi update");
      self.enter_sleep().await?;
      self.suspend_blocked = false;
    }
    result
  }

  /// Periodic reachability probe for the host to run (1 s period) while
  /// active. On `Err` the device wandered off (unreachable or back in
  /// bootloader); run [`Tma884::startup`].
  pub async fn watchdog_check(&mut self) -> Result<(), Error<B::Error>> {
    if self.driver_state != DriverState::Active {
      return Ok(());
    }

    if let Err(e) = self.load_status_regs().await {
      log::error!("failed to access device in watchdog poll");
      return Err(e);
    }
    let rep_ofs = self.offsets()?.rep_ofs;
    let rep_stat = ReportStatus::from_bits(self.xy_mode[rep_ofs + 1]);
    if rep_stat.bootloader() {
      log::error!("device found in bootloader mode while operational");
      return Err(Error::Protocol);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event::recording::RecordingSink;
  use crate::testutil::*;
  use embassy_futures::block_on;

  #[test]
  fn mode_change_round_trip_ends_active_operational() {
    let mut ts = seeded_driver();
    // sysinfo: read-back 0x10 after change bit clears; operational: 0x00
    ts.bus.queue_read(&[0x10]);
    ts.bus.queue_read(&[0x00]);

    block_on(async {
      ts.set_mode(TargetMode::Sysinfo).await.unwrap();
      assert_eq!(ts.current_mode, ControllerMode::Sysinfo);
      assert_eq!(ts.driver_state, DriverState::Sysinfo);

      ts.set_mode(TargetMode::Operational).await.unwrap();
    });

    assert_eq!(ts.current_mode, ControllerMode::Operational);
    assert_eq!(ts.driver_state, DriverState::Active);

    let writes = ts.bus.writes();
    // mode command, handshake, mode command, handshake
    assert_eq!(writes[0].2, [HST_SYSINFO_MODE | HST_MODE_CHANGE]);
    assert_eq!(writes[1].2, [0x10 | HST_HANDSHAKE_BIT]);
    assert_eq!(writes[2].2, [HST_MODE_CHANGE]);
    assert_eq!(writes[3].2, [HST_HANDSHAKE_BIT]);
  }

  #[test]
  fn mode_readback_mismatch_goes_idle() {
    let mut ts = seeded_driver();
    // change bit cleared but the wrong mode answered
    ts.bus.queue_read(&[HST_CONFIG_MODE]);

    let r = block_on(ts.set_mode(TargetMode::Sysinfo));
    assert!(matches!(r, Err(Error::Protocol)));
    assert_eq!(ts.driver_state, DriverState::Idle);
  }

  #[test]
  fn put_cmd_wait_retries_until_ready_bit() {
    let mut ts = seeded_driver();
    let before = ts.driver_state;
    // interrupt fires immediately but the ready bit needs two re-reads
    ts.bus.queue_read(&[0x00]);
    ts.bus.queue_read(&[0x00]);
    ts.bus.queue_read(&[CMD_RDY_BIT | 0x05]);

    let status = block_on(ts.put_cmd_wait(
      0x02,
      &[0x05, 0, 0, 0, 0, 0, 0],
      HALF_SEC_TMO,
      Some(chk_cmd_rdy),
      DriverState::Command,
    ))
    .unwrap();

    assert_eq!(status, CMD_RDY_BIT | 0x05);
    assert_eq!(ts.driver_state, before);
  }

  #[test]
  fn put_cmd_wait_gives_up_after_ready_retries() {
    let mut ts = seeded_driver();
    for _ in 0..3 {
      ts.bus.queue_read(&[0x00]);
    }

    let r = block_on(ts.put_cmd_wait(
      0x02,
      &[0x05, 0, 0, 0, 0, 0, 0],
      HALF_SEC_TMO,
      Some(chk_cmd_rdy),
      DriverState::Command,
    ));
    assert!(matches!(r, Err(Error::Protocol)));
  }

  #[test]
  fn two_touches_extracted_with_down_edge() {
    let mut ts = seeded_driver();
    let o = ts.offsets().unwrap();

    // mode regs: hst_mode operational, nonzero report length, clean status
    let mut mode = std::vec![0u8; o.mode_size];
    mode[o.rep_ofs] = 0x0A;
    mode[o.rep_ofs + 1] = 0x00;
    ts.bus.queue_read(&mode);

    // tt_stat reports two touches; first record follows
    let mut first = std::vec![0x02u8];
    first.extend_from_slice(&record(0x123, 0x256, 0x42, 1, TouchEvent::Move));
    ts.bus.queue_read(&first);
    // second record
    ts.bus.queue_read(&record(0x223, 0x156, 0x21, 2, TouchEvent::Move));

    let mut sink = RecordingSink::default();
    block_on(ts.xy_worker(&mut sink)).unwrap();

    assert_eq!(sink.touch_keys, [true]);
    assert_eq!(sink.contacts.len(), 2);
    assert_eq!((sink.contacts[0].x, sink.contacts[0].y), (0x123, 0x256));
    assert_eq!((sink.contacts[1].x, sink.contacts[1].y), (0x223, 0x156));
    assert_eq!(sink.contacts[0].id, 1);
    assert_eq!(sink.syncs, 1);

    // the worker acknowledged the report
    let writes = ts.bus.writes();
    assert_eq!(writes.last().unwrap().2, [HST_HANDSHAKE_BIT]);
  }

  #[test]
  fn out_of_range_track_id_is_sync_only() {
    let mut ts = seeded_driver();
    let o = ts.offsets().unwrap();

    let mut mode = std::vec![0u8; o.mode_size];
    mode[o.rep_ofs] = 0x0A;
    ts.bus.queue_read(&mode);

    let mut first = std::vec![0x01u8];
    // track id 20, beyond the platform maximum of 15
    first.extend_from_slice(&record(0x100, 0x100, 0x10, 20, TouchEvent::Move));
    ts.bus.queue_read(&first);

    let mut sink = RecordingSink::default();
    block_on(ts.xy_worker(&mut sink)).unwrap();

    assert!(sink.contacts.is_empty());
    assert_eq!(sink.sync_only, 1);
    assert_eq!(sink.syncs, 1);
  }

  #[test]
  fn touch_count_sentinel_terminates_tracks() {
    let mut ts = seeded_driver();
    ts.num_prv_tch = 1;
    let o = ts.offsets().unwrap();

    let mut mode = std::vec![0u8; o.mode_size];
    mode[o.rep_ofs] = 0x0A;
    ts.bus.queue_read(&mode);

    let mut first = std::vec![TCH_COUNT_ERR];
    first.extend_from_slice(&[0u8; 10]);
    ts.bus.queue_read(&first);
    // sentinel clamps to the maximum for the bulk read of records 2..=10
    ts.bus.queue_read(&std::vec![0u8; 9 * 10]);

    let mut sink = RecordingSink::default();
    block_on(ts.xy_worker(&mut sink)).unwrap();

    assert_eq!(sink.touch_keys, [false]);
    assert!(sink.contacts.is_empty());
    assert_eq!(ts.num_prv_tch, 0);
  }

  #[test]
  fn bootloader_in_report_status_escalates() {
    let mut ts = seeded_driver();
    let o = ts.offsets().unwrap();

    let mut mode = std::vec![0u8; o.mode_size];
    mode[o.rep_ofs] = 0x0A;
    mode[o.rep_ofs + 1] = 0x01; // bootloader bit
    ts.bus.queue_read(&mode);
    ts.bus.queue_read(&std::vec![0u8; 11]);

    let mut sink = RecordingSink::default();
    let r = block_on(ts.xy_worker(&mut sink));
    assert!(matches!(r, Err(Error::Protocol)));
  }

  #[test]
  fn handshake_toggles_bit_both_ways() {
    let mut ts = seeded_driver();
    block_on(async {
      ts.handshake(0x00).await.unwrap();
      ts.handshake(0x80).await.unwrap();
    });
    let writes = ts.bus.writes();
    assert_eq!(writes[0].2, [0x80]);
    assert_eq!(writes[1].2, [0x00]);
  }

  #[test]
  fn suspend_blocked_during_transfer() {
    let mut ts = seeded_driver();
    ts.change_state(DriverState::Transfer);
    let r = block_on(ts.suspend()).unwrap();
    assert!(!r);
    assert!(ts.suspend_blocked);
  }

  #[test]
  fn suspend_writes_deep_sleep() {
    let mut ts = seeded_driver();
    ts.change_state(DriverState::Active);
    let r = block_on(ts.suspend()).unwrap();
    assert!(r);
    assert_eq!(ts.driver_state, DriverState::Sleep);
    assert_eq!(ts.bus.writes()[0].2, [HST_DEEP_SLEEP]);
  }
}
