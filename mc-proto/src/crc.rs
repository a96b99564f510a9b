//! # CHECKSUM
//!
//! [SEMI E5]-style codebases lean on a presentation layer with no checksum of
//! its own (TCP supplies that); the SPI link has no such luxury, so every
//! [Transfer Header] and packet body carries an explicit CRC16.
//!
//! The polynomial is the CCITT polynomial (0x1021) with an initial value of
//! zero, which the `crc` crate catalogs as [`CRC_16_XMODEM`].
//!
//! [Transfer Header]: crate::header::TransferHeader

use crc::{Crc, CRC_16_XMODEM};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Computes the CRC16-CCITT (initial value zero) of `data`.
pub fn checksum(data: &[u8]) -> u16 {
  CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_input_is_zero() {
    assert_eq!(checksum(&[]), 0);
  }

  #[test]
  fn known_vector() {
    // "123456789" is the standard check string for CRC16/XMODEM; the
    // documented check value is 0x31C3.
    assert_eq!(checksum(b"123456789"), 0x31C3);
  }

  #[test]
  fn single_bit_flip_changes_checksum() {
    let mut data = [0u8; 32];
    for (i, b) in data.iter_mut().enumerate() {
      *b = i as u8;
    }
    let original = checksum(&data);
    data[5] ^= 0x01;
    assert_ne!(checksum(&data), original);
  }
}
