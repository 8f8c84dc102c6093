//! Register-level definitions for the TrueTouch Gen4 host interface.
//!
//! The Gen4 register map is self-describing: everything past the host-mode
//! byte is located through the system-information tables decoded in
//! [`crate::sysinfo`]. Only the base register and the bit assignments of the
//! fixed status bytes are hard-wired here.

use bitfield_struct::bitfield;
use embassy_time::Duration;

/// Base register; host mode in operational/sysinfo modes, packet start in
/// bootloader mode.
pub(crate) const REG_BASE: u16 = 0x00;

/// Bus retry policy. Reads are cheap to repeat, writes get a longer leash
/// because a failed config write forces a whole restart cycle.
pub(crate) const READ_RETRIES: usize = 2;
pub(crate) const WRITE_RETRIES: usize = 5;
pub(crate) const RETRY_DELAY_MS: u64 = 20;

pub(crate) const HALF_SEC_TMO: Duration = Duration::from_millis(500);
pub(crate) const ONE_SEC_TMO: Duration = Duration::from_secs(1);
pub(crate) const TEN_SEC_TMO: Duration = Duration::from_secs(10);

/// Extra wait-for-ready retries in `put_cmd_wait` when the interrupt fired
/// but the ready bit was not yet set.
pub(crate) const CMD_RDY_RETRIES: usize = 2;

/* host mode register bits (rd/wr at REG_BASE) */
pub(crate) const HST_SOFT_RESET: u8 = 0x01;
pub(crate) const HST_DEEP_SLEEP: u8 = 0x02;
pub(crate) const HST_LOW_POWER: u8 = 0x04;
pub(crate) const HST_MODE_CHANGE: u8 = 0x08;
pub(crate) const HST_OPERATE_MODE: u8 = 0x00;
pub(crate) const HST_SYSINFO_MODE: u8 = 0x10;
pub(crate) const HST_CONFIG_MODE: u8 = 0x20;
pub(crate) const HST_HANDSHAKE_BIT: u8 = 0x80;

/// Command-complete bit in the operational command register.
pub(crate) const CMD_RDY_BIT: u8 = 0x40;

/// Operational-mode command opcodes.
pub(crate) const OP_CMD_GET_CFG_BLK_CRC: u8 = 0x05;
pub(crate) const OP_CMD_HANDSHAKE_ENABLE: u8 = 0x26;
pub(crate) const OP_CMD_SET_CHRGHDMI: u8 = 0x28;
/// Config-mode command opcode for writing an EBID block.
pub(crate) const CFG_CMD_WRITE_EBID: u8 = 0x04;

/// Command payload bytes following the opcode in the command register.
pub(crate) const NUM_CMD_DAT: usize = 6;

/* touch record bookkeeping */
/// Maximum number of concurrently tracked contacts.
pub(crate) const NUM_TCH_ID: usize = 10;
/// Touch count value reserved as an error sentinel in `tt_stat`.
pub(crate) const TCH_COUNT_ERR: u8 = 0x1F;
/// `max_tchs`/`tch_rec_siz` opcfg fields carry flags in their top bits.
pub(crate) const BYTE_OFS_MASK: u8 = 0x1F;
/// Touch field location byte: top three bits are the intra-byte bit offset.
pub(crate) const BOFS_MASK: u8 = 0xE0;
pub(crate) const BOFS_SHIFT: u8 = 5;

/* button records */
pub(crate) const NUM_BTN_PER_REG: usize = 4;
pub(crate) const BITS_PER_BTN: usize = 2;
pub(crate) const BTN_STATE_MASK: u8 = 0x03;
pub(crate) const MAX_BTNS: usize = 16;

/* configuration memory blocks */
pub(crate) const NUM_DDATA: usize = 32;
pub(crate) const NUM_MDATA: usize = 64;
/// Padded block the config CRC runs over: 4-byte length header plus payload.
pub(crate) const CFG_BLK_SIZE: usize = 126;
pub(crate) const CFG_BLK_PAYLOAD_MAX: usize = 122;
/// Firmware version record length in platform data.
pub(crate) const BL_VERS_SIZE: usize = 12;

/* buffer capacities; protocol bounds, checked during sysinfo decode */
pub(crate) const MODE_CAP: usize = 64;
pub(crate) const MAX_RECORD_SIZE: usize = 32;
pub(crate) const XY_DATA_CAP: usize = NUM_TCH_ID * MAX_RECORD_SIZE;
pub(crate) const BLOCK_CAP: usize = 256;

/// Touch-record field order inside the extracted axis array.
pub(crate) const TCH_X: usize = 0;
pub(crate) const TCH_Y: usize = 1;
pub(crate) const TCH_P: usize = 2;
pub(crate) const TCH_T: usize = 3;
pub(crate) const TCH_E: usize = 4;
pub(crate) const TCH_O: usize = 5;
pub(crate) const TCH_W: usize = 6;
pub(crate) const TCH_NUM_ABS: usize = 7;

/// Host mode byte as read back from [`REG_BASE`].
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct HostMode {
  pub soft_reset: bool,
  pub deep_sleep: bool,
  pub low_power: bool,
  pub mode_change: bool,
  #[bits(3)]
  pub mode: u8,
  pub handshake: bool,
}

/// Touch status byte (`tt_stat`) leading the touch records.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct TouchStatus {
  #[bits(5)]
  pub count: u8,
  pub large_area: bool,
  #[bits(2)]
  __: u8,
}

/// Report status byte following the report-length register.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct ReportStatus {
  pub bootloader: bool,
  #[bits(4)]
  __: u8,
  pub bad_packet: bool,
  #[bits(2)]
  pub record_count: u8,
}

/// Driver-side view of where the device and the protocol currently are.
///
/// Transitions are serialized by exclusive ownership of the driver value;
/// the transient states (`Transfer`, `Command`, `OpCommand`) exist so the
/// interrupt dispatch does not mistake a command-response edge for a touch
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverState {
  /// Device cannot be reached.
  Idle,
  /// Pre-operational; about to go `Active`.
  Ready,
  /// Application firmware is running and scanning.
  Active,
  /// Application firmware is running, device is idle.
  Sleep,
  /// Bootloader is resident.
  Bootloader,
  /// Switching to system-information mode.
  Sysinfo,
  /// A command/response exchange is outstanding.
  Command,
  /// Synchronizing the bootloader exit with the application-ready edge.
  ExitBootloader,
  /// Generic "state is changing" marker while issuing mode commands.
  Transfer,
  /// Run-time command issued without disturbing `Active` processing.
  OpCommand,
  /// Terminal; an external reset or power cycle is required.
  Invalid,
}

/// Operating mode the controller itself reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerMode {
  Bootloader,
  Sysinfo,
  Operational,
  Config,
}

/// Mode-change targets accepted by the host-mode register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum TargetMode {
  Operational,
  Sysinfo,
  Config,
}

impl TargetMode {
  pub(crate) const fn bits(self) -> u8 {
    match self {
      Self::Operational => HST_OPERATE_MODE,
      Self::Sysinfo => HST_SYSINFO_MODE,
      Self::Config => HST_CONFIG_MODE,
    }
  }
}
