//! # SPI TRANSFER PROTOCOL
//!
//! Wire-level definitions for the full-duplex, framed, CRC-checked packet
//! exchange between the SBC daemon and the motion-control firmware.
//!
//! For ease of reuse, the functionality is divided the way the teacher
//! family divides a wire-protocol crate: [`header`] defines the fixed-size
//! headers and their checksums, [`crc`] the checksum primitive itself, and
//! [`request`] the closed set of packet request-type ids. None of this
//! module decides *when* to send a packet — that is [`crate::engine`] in
//! the sibling `mc-transfer` crate.

pub mod crc;
pub mod header;
pub mod request;

pub use header::{PacketHeader, TransferHeader, PACKET_ALIGNMENT, PACKET_HEADER_LEN, TRANSFER_HEADER_LEN};
pub use request::RequestType;

/// Maximum number of packets allowed to share a single transfer body in
/// either direction.
pub const MAX_PACKETS_PER_TRANSFER: usize = 255;

/// A single packet: its header plus a body, already stripped of alignment
/// padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
  pub header: PacketHeader,
  pub body: Vec<u8>,
}

impl Packet {
  pub fn new(request_type: RequestType, id: u16, body: Vec<u8>) -> Self {
    Self {
      header: PacketHeader {
        request_type: request_type.into(),
        id,
        length: body.len() as u16,
        resend_packet_id: 0,
      },
      body,
    }
  }

  /// Marks this packet as a firmware-requested re-emission of `original_id`.
  pub fn as_resend_of(mut self, original_id: u16) -> Self {
    self.header.resend_packet_id = original_id;
    self
  }

  /// Encoded length on the wire, including alignment padding, of the
  /// header plus body.
  pub fn wire_len(&self) -> usize {
    PACKET_HEADER_LEN + header::padded_len(self.body.len())
  }

  pub fn append_to(&self, out: &mut Vec<u8>) {
    let header_bytes: [u8; PACKET_HEADER_LEN] = self.header.into();
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&self.body);
    let pad = header::padded_len(self.body.len()) - self.body.len();
    out.resize(out.len() + pad, 0);
  }
}

/// Decodes as many packets as fit in `buf`, stopping at the first short or
/// malformed header. Malformed trailing bytes are silently ignored here —
/// the caller (the Packet Router) treats an empty decode of a non-empty
/// buffer as a protocol violation, per the spec's framing rules.
pub fn decode_packets(buf: &[u8]) -> Vec<Packet> {
  let mut packets = Vec::new();
  let mut offset = 0;
  while offset + PACKET_HEADER_LEN <= buf.len() {
    let header_bytes: [u8; PACKET_HEADER_LEN] = buf[offset..offset + PACKET_HEADER_LEN].try_into().unwrap();
    let header = PacketHeader::from(header_bytes);
    let body_start = offset + PACKET_HEADER_LEN;
    let body_len = header.length as usize;
    let padded = header::padded_len(body_len);
    if body_start + padded > buf.len() {
      break;
    }
    let body = buf[body_start..body_start + body_len].to_vec();
    packets.push(Packet { header, body });
    offset = body_start + padded;
  }
  packets
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn encode_decode_single_packet() {
    let packet = Packet::new(RequestType::Code, 5, vec![1, 2, 3]);
    let mut buf = Vec::new();
    packet.append_to(&mut buf);
    assert_eq!(buf.len(), packet.wire_len());
    let decoded = decode_packets(&buf);
    assert_eq!(decoded, vec![packet]);
  }

  #[test]
  fn encode_decode_multiple_packets() {
    let a = Packet::new(RequestType::Code, 1, vec![9]);
    let b = Packet::new(RequestType::Flush, 2, vec![]);
    let mut buf = Vec::new();
    a.append_to(&mut buf);
    b.append_to(&mut buf);
    assert_eq!(decode_packets(&buf), vec![a, b]);
  }

  #[test]
  fn truncated_trailing_packet_is_dropped() {
    let a = Packet::new(RequestType::Code, 1, vec![1, 2, 3, 4, 5]);
    let mut buf = Vec::new();
    a.append_to(&mut buf);
    buf.truncate(buf.len() - 2);
    let decoded = decode_packets(&buf);
    assert!(decoded.is_empty());
  }
}
