//! Touch-record extraction and host-facing events.
//!
//! Touch records are bit-packed: each field is described by a byte offset,
//! an intra-byte bit offset and a size in bits, all taken from the decoded
//! operational config. Extraction accumulates whole bytes big-endian,
//! shifting each by the bit offset, then masks to the field range,
//! unsigned, modulo 2^bits.

use crate::config::{Axis, PlatformData};
use crate::defs::*;
use crate::sysinfo::TchAbsParams;

/// Touch-record event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TouchEvent {
  NoEvent,
  TouchDown,
  /// Significant displacement (beyond the active distance).
  Move,
  /// The record reports the last position.
  Liftoff,
}

impl TouchEvent {
  pub(crate) fn from_bits(bits: u32) -> Self {
    match bits & 0x03 {
      0 => Self::NoEvent,
      1 => Self::TouchDown,
      2 => Self::Move,
      _ => Self::Liftoff,
    }
  }
}

/// Object classification reported per contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ObjectKind {
  StandardFinger,
  LargeObject,
  Stylus,
  Hover,
}

impl ObjectKind {
  pub(crate) fn from_bits(bits: u32) -> Self {
    match bits & 0x03 {
      0 => Self::StandardFinger,
      1 => Self::LargeObject,
      2 => Self::Stylus,
      _ => Self::Hover,
    }
  }
}

/// One extracted contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Contact {
  /// Zero-based track id (platform minimum already subtracted).
  pub id: u32,
  pub x: u32,
  pub y: u32,
  pub pressure: u32,
  pub size: u32,
  pub event: TouchEvent,
  pub object: ObjectKind,
}

/// Capacitive button bookkeeping; mutated only by edge detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Button {
  pub enabled: bool,
  pub state: ButtonState,
  pub key_code: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ButtonState {
  Released,
  Pressed,
}

/// Host input-delivery collaborator.
///
/// The driver translates register state into this call sequence the way a
/// kernel driver feeds an input device: per-contact reports, sync-only
/// slots for tolerated glitches, edge-triggered key events, and a frame
/// commit after each processed report.
pub trait EventSink {
  /// A contact with valid position data.
  fn touch(&mut self, contact: &Contact);
  /// A contact slot with no positional data (out-of-range track id).
  fn sync_only(&mut self);
  /// Overall touch-down / lift-off key edge.
  fn touch_key(&mut self, pressed: bool);
  /// Button press/release edge.
  fn button(&mut self, key_code: u16, pressed: bool);
  /// Frame commit.
  fn sync(&mut self);
}

/// Pull one field out of a record. `xy` starts at the record base.
pub(crate) fn extract_axis(xy: &[u8], p: &TchAbsParams) -> u32 {
  let mut axis: u32 = 0;
  for i in 0..p.size {
    axis = (axis << 8) + u32::from(xy[p.ofs + i] >> p.bofs);
  }
  axis & p.max.wrapping_sub(1)
}

/// Extract all seven fields of one record.
pub(crate) fn extract_record(xy: &[u8], tch_abs: &[TchAbsParams; TCH_NUM_ABS]) -> [u32; TCH_NUM_ABS] {
  let mut abs = [0u32; TCH_NUM_ABS];
  for (value, params) in abs.iter_mut().zip(tch_abs.iter()) {
    *value = extract_axis(xy, params);
  }
  abs
}

/// Apply the platform's swap/invert transforms in place.
///
/// Inversion mirrors against the reporting maximum; after a swap the
/// opposite axis supplies that maximum.
pub(crate) fn apply_transforms(abs: &mut [u32; TCH_NUM_ABS], platform: &PlatformData<'_>) {
  let t = platform.transform;
  let mut flipped = false;
  if t.swap_xy {
    abs.swap(TCH_X, TCH_Y);
    flipped = true;
  }
  if t.invert_x {
    let max = if flipped { platform.axis(Axis::Y).max } else { platform.axis(Axis::X).max };
    abs[TCH_X] = max.saturating_sub(abs[TCH_X]);
  }
  if t.invert_y {
    let max = if flipped { platform.axis(Axis::X).max } else { platform.axis(Axis::Y).max };
    abs[TCH_Y] = max.saturating_sub(abs[TCH_Y]);
  }
}

/// Edge-detect one register worth of 2-bit button fields for one pass.
///
/// The worker runs a release pass over every register before the press
/// pass so a slot changing hands within one report orders sanely.
pub(crate) fn button_pass(
  buttons: &mut [Button],
  first: usize,
  mask: u8,
  count: usize,
  pass: ButtonState,
  sink: &mut impl EventSink,
) {
  for i in 0..count {
    let btn = &mut buttons[first + i];
    if !btn.enabled {
      continue;
    }
    let bits = (mask >> (i * BITS_PER_BTN)) & BTN_STATE_MASK;
    match pass {
      ButtonState::Released => {
        if bits == ButtonState::Released as u8 && btn.state == ButtonState::Pressed {
          btn.state = ButtonState::Released;
          sink.button(btn.key_code, false);
          log::debug!("btn={} key={} released", first + i, btn.key_code);
        }
      }
      ButtonState::Pressed => {
        if bits == ButtonState::Pressed as u8 && btn.state == ButtonState::Released {
          btn.state = ButtonState::Pressed;
          sink.button(btn.key_code, true);
          log::debug!("btn={} key={} pressed", first + i, btn.key_code);
        }
      }
    }
  }
}
