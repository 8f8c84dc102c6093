//! Startup orchestration.
//!
//! One boot cycle: reset into the bootloader, synchronize the loader exit
//! with the device's ready edges, decode the sysinfo tables, then bring
//! the configuration in line with platform data, reflashing firmware or
//! rewriting config blocks as needed. Every update that only takes effect
//! after a reset restarts the cycle from the top with a typed cause; the
//! loop is bounded, and exhausting it parks the driver in the terminal
//! `Invalid` state rather than spinning forever.

use embassy_time::{with_timeout, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::digital::Wait;

use crate::blocks::Ebid;
use crate::defs::*;
use crate::rw::{BusAddr, RegisterBus};
use crate::sysinfo::SysInfoHeader;
use crate::{Error, Tma884};

/// Bound on full restart cycles within one `startup` call.
const MAX_STARTUP_ATTEMPTS: usize = 5;

/// IRQ de-assert poll: bounded busy-wait while early firmware lets go of
/// the line after entering sysinfo mode.
const IRQ_DEASSERT_POLLS: usize = 1250;

/// Why a boot cycle must run again from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum RestartCause {
  /// The sysinfo header would not read and the image was reflashed.
  ReflashedAfterSysinfoFail,
  /// Platform firmware was newer than the device's; upgraded.
  FirmwareUpgraded,
  /// Design/manufacturing data blocks were rewritten.
  ConfigUpdated,
  /// The touch parameter block was rewritten.
  TouchParamsUpdated,
}

impl<'a, B, IRQ, RST> Tma884<'a, B, IRQ, RST>
where
  B: RegisterBus,
  IRQ: Wait + InputPin,
  RST: OutputPin,
{
  /// Bring the device from reset to `Active`.
  ///
  /// Restartable: configuration and firmware updates re-enter the sequence
  /// until the device comes up clean or the attempt budget runs out. On
  /// persistent failure the error names the first unrecoverable step and
  /// the state is `Idle` (retryable from outside) or `Invalid` (terminal).
  pub async fn startup(&mut self) -> Result<(), Error<B::Error>> {
    let mut upgraded = false;
    let mut wrote_sysinfo_regs = false;

    let result = async {
      for attempt in 0..MAX_STARTUP_ATTEMPTS {
        match self.startup_cycle(&mut upgraded, &mut wrote_sysinfo_regs).await {
          Ok(None) => return Ok(()),
          Ok(Some(cause)) => {
            log::info!("restarting startup (attempt {}): {cause:?}", attempt + 1)
          }
          Err(e) => return Err(e),
        }
      }
      log::error!("startup attempts exhausted");
      self.change_state(DriverState::Invalid);
      Err(Error::Invalid)
    }
    .await;

    if let Err(e) = &result {
      log::error!("startup failed: {e:?}");
      if self.driver_state != DriverState::Invalid {
        self.change_state(DriverState::Idle);
      }
    }
    self.low_power_enable = true;
    result
  }

  async fn startup_cycle(
    &mut self,
    upgraded: &mut bool,
    wrote_sysinfo_regs: &mut bool,
  ) -> Result<Option<RestartCause>, Error<B::Error>> {
    let mut mddata_updated = false;
    let mut wrote_settings = false;

    self.change_state(DriverState::Bootloader);
    if self.reset().await.is_err() {
      // the device may already sit in the bootloader; keep going
      log::error!("fail reset device");
    }

    // bootloader heartbeat
    self.wait_int(HALF_SEC_TMO).await?;

    // leave the loader, then wait for the sysinfo-mode edge
    self.change_state(DriverState::ExitBootloader);
    if self.ldr_exit().await.is_err() {
      log::error!("fail bootloader exit");
    }
    if with_timeout(TEN_SEC_TMO, self.irq.wait_for_low()).await.is_err() {
      // in case the sync was missed; the header read below decides
      log::error!("fail wait switch to sysinfo");
    }
    self.change_state(DriverState::Sysinfo);

    // wait for the line to de-assert; early firmware holds it through the
    // mode switch
    let mut deasserted = false;
    for _ in 0..IRQ_DEASSERT_POLLS {
      if !self.irq_asserted() {
        deasserted = true;
        break;
      }
      Timer::after_millis(RETRY_DELAY_MS).await;
    }
    if !deasserted {
      log::error!("timeout waiting for irq to de-assert");
      return Err(Error::Timeout);
    }

    // probe: does the application answer in sysinfo mode?
    let mut header = [0u8; SysInfoHeader::SIZE];
    if self.read_block(BusAddr::Touch, REG_BASE, &mut header).await.is_err() {
      log::error!("fail to switch from bootloader to application");
      self.change_state(DriverState::Bootloader);

      if *upgraded {
        log::error!("app failed to launch after firmware upgrade");
        return Err(Error::Protocol);
      }
      let Some(fw) = self.platform.firmware else {
        log::error!("no platform firmware available for reflashing");
        self.change_state(DriverState::Invalid);
        return Err(Error::NoFirmware);
      };
      log::info!("attempting to reflash device");
      if self.load_app(fw.data).await.is_err() {
        log::error!("failed to reflash device");
        self.change_state(DriverState::Invalid);
        return Err(Error::Protocol);
      }
      *upgraded = true;
      return Ok(Some(RestartCause::ReflashedAfterSysinfoFail));
    }

    // decode capability tables; no partial retry, restart owns recovery
    self.get_sysinfo_regs().await?;

    // auto-upgrade when the platform image is newer
    if !*upgraded && self.firmware_upgrade_wanted() {
      if let Some(fw) = self.platform.firmware {
        log::info!("upgrading firmware");
        match self.load_app(fw.data).await {
          Ok(()) => {
            *upgraded = true;
            return Ok(Some(RestartCause::FirmwareUpgraded));
          }
          Err(e) => {
            log::error!("communication fail on firmware load");
            self.change_state(DriverState::Idle);
            return Err(e);
          }
        }
      }
    }

    if !*wrote_sysinfo_regs {
      self.set_mode(TargetMode::Sysinfo).await?;
      mddata_updated = self.set_sysinfo_blocks().await?;
      *wrote_sysinfo_regs = true;
    }

    self.set_mode(TargetMode::Operational).await?;

    if self.platform.touch_params.is_some() {
      let pdata_crc = self.calc_settings_crc()?;
      let ic_crc = self.get_ic_crc(Ebid::TouchParams).await?;
      log::debug!("pdata crc={pdata_crc:#06x}, ic crc={ic_crc:#06x}");

      if pdata_crc != ic_crc {
        if wrote_settings {
          log::error!("already updated device settings");
        } else {
          log::info!("updating device settings");
          self.set_op_params(pdata_crc).await?;
          wrote_settings = true;
        }
      }
    }

    if mddata_updated || wrote_settings {
      log::info!("resetting device after writing settings");
      let cause = if wrote_settings {
        RestartCause::TouchParamsUpdated
      } else {
        RestartCause::ConfigUpdated
      };
      return Ok(Some(cause));
    }

    if self.handshake_enable().await.is_err() {
      log::error!("fail enable handshake");
    }

    self.change_state(DriverState::Active);

    if self.was_suspended {
      self.was_suspended = false;
      if self.enter_sleep().await.is_err() {
        log::error!("fail resume sleep");
      }
    }

    Ok(None)
  }

  /// Decide whether the platform image should replace the device firmware:
  /// newer version number, or newer revision-control words at an equal
  /// version.
  fn firmware_upgrade_wanted(&self) -> bool {
    let Some(fw) = self.platform.firmware else {
      return false;
    };
    if !fw.version_ok() {
      log::error!("bad firmware version record size={}", fw.version.len());
      return false;
    }
    let Some(cydata) = self.device_info() else {
      return false;
    };

    let vers_platform = u16::from_be_bytes([fw.version[2], fw.version[3]]);
    let vers_img = cydata.fw_version();
    let new_fw_vers = vers_platform > vers_img;

    let revctrl_platform_h =
      u32::from_be_bytes([fw.version[4], fw.version[5], fw.version[6], fw.version[7]]);
    let revctrl_platform_l =
      u32::from_be_bytes([fw.version[8], fw.version[9], fw.version[10], fw.version[11]]);
    let new_fw_revctrl = revctrl_platform_h > cydata.revctrl_high()
      || (revctrl_platform_h == cydata.revctrl_high()
        && revctrl_platform_l > cydata.revctrl_low());

    log::debug!(
      "fw vers platform={vers_platform:#06x} img={vers_img:#06x}, \
       new_vers={new_fw_vers} new_revctrl={new_fw_revctrl}"
    );
    new_fw_vers || new_fw_revctrl
  }
}
