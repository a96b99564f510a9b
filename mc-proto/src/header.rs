//! # TRANSFER & PACKET HEADERS
//!
//! The SPI link is little-endian throughout, unlike the teacher's big-endian
//! TCP header; field layout otherwise follows the same manual
//! `From<[u8; N]>` / `Into<[u8; N]>` convention rather than a zero-copy cast,
//! so a short or corrupted read never produces an invalid enum discriminant
//! by transmutation.

use crate::crc;

/// Size in bytes of a [`TransferHeader`] on the wire.
pub const TRANSFER_HEADER_LEN: usize = 16;

/// Size in bytes of a [`PacketHeader`] on the wire.
pub const PACKET_HEADER_LEN: usize = 8;

/// Packet bodies are padded to a multiple of this many bytes; `length` in
/// [`PacketHeader`] excludes the padding.
pub const PACKET_ALIGNMENT: usize = 4;

/// Default per-direction body size cap for one transfer cycle.
pub const DEFAULT_BODY_CAP: usize = 8 * 1024;

/// Rounds `len` up to the next multiple of [`PACKET_ALIGNMENT`].
pub fn padded_len(len: usize) -> usize {
  (len + PACKET_ALIGNMENT - 1) / PACKET_ALIGNMENT * PACKET_ALIGNMENT
}

/// ## TRANSFER HEADER
///
/// The fixed 16-byte header that opens every SPI transfer cycle. Two
/// checksums are carried: one over the header itself (all fields up to but
/// excluding `checksum_header`), one over the transfer body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferHeader {
  pub format_version: u16,
  pub protocol_version: u16,
  pub sequence_number: u16,
  pub data_length: u16,
  pub checksum_data: u16,
  pub checksum_header: u16,
}

impl TransferHeader {
  /// Builds a header for `data`, computing both checksums.
  pub fn new(format_version: u16, protocol_version: u16, sequence_number: u16, data: &[u8]) -> Self {
    let mut header = Self {
      format_version,
      protocol_version,
      sequence_number,
      data_length: data.len() as u16,
      checksum_data: crc::checksum(data),
      checksum_header: 0,
    };
    header.checksum_header = crc::checksum(&header.to_bytes_unchecked());
    header
  }

  /// Serializes everything but `checksum_header`, which is what the header
  /// checksum itself is computed over.
  fn to_bytes_unchecked(self) -> [u8; TRANSFER_HEADER_LEN - 2] {
    let mut bytes = [0u8; TRANSFER_HEADER_LEN - 2];
    bytes[0..2].copy_from_slice(&self.format_version.to_le_bytes());
    bytes[2..4].copy_from_slice(&self.protocol_version.to_le_bytes());
    bytes[4..6].copy_from_slice(&self.sequence_number.to_le_bytes());
    bytes[6..8].copy_from_slice(&self.data_length.to_le_bytes());
    bytes[8..10].copy_from_slice(&self.checksum_data.to_le_bytes());
    bytes
  }

  /// Returns whether this header's own checksum is internally consistent.
  pub fn header_checksum_valid(&self) -> bool {
    crc::checksum(&self.to_bytes_unchecked()) == self.checksum_header
  }

  /// Returns whether `body`'s checksum matches `checksum_data`.
  pub fn body_checksum_valid(&self, body: &[u8]) -> bool {
    crc::checksum(body) == self.checksum_data
  }
}

impl From<TransferHeader> for [u8; TRANSFER_HEADER_LEN] {
  fn from(val: TransferHeader) -> Self {
    let mut bytes = [0u8; TRANSFER_HEADER_LEN];
    bytes[0..10].copy_from_slice(&val.to_bytes_unchecked());
    bytes[10..12].copy_from_slice(&val.checksum_header.to_le_bytes());
    // bytes[12..16] reserved, left zero.
    bytes
  }
}

impl From<[u8; TRANSFER_HEADER_LEN]> for TransferHeader {
  fn from(bytes: [u8; TRANSFER_HEADER_LEN]) -> Self {
    Self {
      format_version: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
      protocol_version: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
      sequence_number: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
      data_length: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
      checksum_data: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
      checksum_header: u16::from_le_bytes(bytes[10..12].try_into().unwrap()),
    }
  }
}

/// ## PACKET HEADER
///
/// The fixed 8-byte header that opens every packet within a transfer body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
  pub request_type: u16,
  pub id: u16,
  /// Length of the packet body, excluding any alignment padding.
  pub length: u16,
  /// Non-zero when this packet is a firmware-requested re-emission of a
  /// previously sent packet; zero otherwise.
  pub resend_packet_id: u16,
}

impl From<PacketHeader> for [u8; PACKET_HEADER_LEN] {
  fn from(val: PacketHeader) -> Self {
    let mut bytes = [0u8; PACKET_HEADER_LEN];
    bytes[0..2].copy_from_slice(&val.request_type.to_le_bytes());
    bytes[2..4].copy_from_slice(&val.id.to_le_bytes());
    bytes[4..6].copy_from_slice(&val.length.to_le_bytes());
    bytes[6..8].copy_from_slice(&val.resend_packet_id.to_le_bytes());
    bytes
  }
}

impl From<[u8; PACKET_HEADER_LEN]> for PacketHeader {
  fn from(bytes: [u8; PACKET_HEADER_LEN]) -> Self {
    Self {
      request_type: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
      id: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
      length: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
      resend_packet_id: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transfer_header_round_trips() {
    let data = b"hello firmware";
    let header = TransferHeader::new(1, 1, 42, data);
    let bytes: [u8; TRANSFER_HEADER_LEN] = header.into();
    let back: TransferHeader = bytes.into();
    assert_eq!(header, back);
    assert!(back.header_checksum_valid());
    assert!(back.body_checksum_valid(data));
  }

  #[test]
  fn corrupted_body_fails_checksum() {
    let data = b"hello firmware";
    let header = TransferHeader::new(1, 1, 42, data);
    let mut corrupted = data.to_vec();
    corrupted[0] ^= 0xFF;
    assert!(!header.body_checksum_valid(&corrupted));
  }

  #[test]
  fn corrupted_header_fails_checksum() {
    let header = TransferHeader::new(1, 1, 42, b"x");
    let mut bytes: [u8; TRANSFER_HEADER_LEN] = header.into();
    bytes[4] ^= 0x01; // flip a sequence-number bit
    let back: TransferHeader = bytes.into();
    assert!(!back.header_checksum_valid());
  }

  #[test]
  fn packet_header_round_trips() {
    let header = PacketHeader {
      request_type: 7,
      id: 99,
      length: 12,
      resend_packet_id: 0,
    };
    let bytes: [u8; PACKET_HEADER_LEN] = header.into();
    let back: PacketHeader = bytes.into();
    assert_eq!(header, back);
  }

  #[test]
  fn padded_len_rounds_up_to_alignment() {
    assert_eq!(padded_len(0), 0);
    assert_eq!(padded_len(1), 4);
    assert_eq!(padded_len(4), 4);
    assert_eq!(padded_len(5), 8);
  }
}
