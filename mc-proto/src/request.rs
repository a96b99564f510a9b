//! # REQUEST TYPES
//!
//! The numeric request-type ids are fixed by the firmware and shared across
//! both directions of the link; unrecognised values must not panic the
//! router, so the enum round-trips through [`TryFromPrimitive`] rather than
//! a bare transmute.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// ## REQUEST TYPE
///
/// Closed enumeration of packet request types. SBC-to-firmware and
/// firmware-to-SBC directions share one id space; a given value is only
/// ever sent in one direction, enforced by the router rather than the type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum RequestType {
  /// SBC -> firmware: one or more [`Code`](crate) packets for a channel.
  Code = 0x0001,
  /// SBC -> firmware: request the current object model.
  GetObjectModel = 0x0002,
  /// SBC -> firmware: set a firmware variable directly.
  SetVariable = 0x0003,
  /// SBC -> firmware: select a file for a channel's macro stack to open.
  FileChunk = 0x0004,
  /// SBC -> firmware: acknowledge/flush a channel.
  Flush = 0x0005,
  /// Firmware -> SBC: JSON Merge Patch against the object model.
  ObjectModel = 0x1001,
  /// Firmware -> SBC: reply to one previously sent code.
  CodeReply = 0x1002,
  /// Firmware -> SBC: request to open a macro file on a channel.
  MacroRequest = 0x1003,
  /// Firmware -> SBC: abort the current code (optionally the whole file).
  AbortFile = 0x1004,
  /// Firmware -> SBC: firmware-side macro stack depth changed.
  StackEvent = 0x1005,
  /// Firmware -> SBC: the running print/job has been paused.
  PrintPaused = 0x1006,
  /// Firmware -> SBC: a free-form diagnostic message.
  Message = 0x1007,
  /// Firmware -> SBC: result of an evaluated expression.
  EvaluationResult = 0x1008,
  /// Firmware -> SBC: request re-emission of a previously sent packet.
  ResendPacket = 0x1009,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_trips_through_primitive() {
    let raw: u16 = RequestType::ObjectModel.into();
    assert_eq!(RequestType::try_from(raw).unwrap(), RequestType::ObjectModel);
  }

  #[test]
  fn unknown_value_is_an_error_not_a_panic() {
    assert!(RequestType::try_from(0xBEEFu16).is_err());
  }
}
