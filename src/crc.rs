//! Checksum engines for the two wire protocols.
//!
//! Both polynomials are fixed by the device: configuration blocks are
//! guarded by a CCITT CRC (poly 0x1021, init 0xFFFF, MSB first) and
//! bootloader packets by the reflected variant (poly 0x8408, init 0xFFFF,
//! complemented and byte-swapped before going on the wire). Wire
//! compatibility, not an internal choice; do not "modernize" either.

use ::crc::{Crc, CRC_16_IBM_3740, CRC_16_IBM_SDLC};

const CONFIG: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const LOADER: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// CRC over a padded 126-byte configuration block.
pub fn config_crc(data: &[u8]) -> u16 {
  CONFIG.checksum(data)
}

/// CRC for bootloader packet framing.
///
/// The value is returned already byte-swapped: appending the low byte then
/// the high byte yields the order the loader expects.
pub fn loader_crc(data: &[u8]) -> u16 {
  LOADER.checksum(data).swap_bytes()
}

#[cfg(test)]
mod tests {
  use super::*;

  // Standard check inputs; 0x29B1 and 0x906E are the published check
  // values for CRC-16/IBM-3740 and CRC-16/IBM-SDLC.
  #[test]
  fn config_crc_check_value() {
    assert_eq!(config_crc(b"123456789"), 0x29B1);
  }

  #[test]
  fn loader_crc_check_value_is_byte_swapped() {
    assert_eq!(loader_crc(b"123456789"), 0x6E90);
  }

  #[test]
  fn empty_input() {
    assert_eq!(config_crc(&[]), 0xFFFF);
    assert_eq!(loader_crc(&[]), 0x0000);
  }

  #[test]
  fn deterministic_and_sensitive() {
    let a = [0x00u8; 126];
    let mut b = a;
    b[125] = 0x01;
    assert_eq!(config_crc(&a), config_crc(&a));
    assert_ne!(config_crc(&a), config_crc(&b));
    assert_eq!(loader_crc(&a), loader_crc(&a));
    assert_ne!(loader_crc(&a), loader_crc(&b));
  }
}
