//! # ERROR KINDS
//!
//! A closed set, matching the propagation rules: every variant except
//! [`CoreError::LinkFailure`] attaches to a [`crate::code::CodeResult`] or is
//! logged and dropped; `LinkFailure` is the only one that unwinds the
//! daemon.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
  /// SPI resync budget exhausted. Fatal; the process exits.
  #[error("SPI link lost: resync budget exhausted")]
  LinkFailure,

  /// Malformed packet from firmware after a successful CRC check.
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),

  /// The channel was invalidated, or the owning job was cancelled/aborted.
  #[error("code cancelled")]
  CodeCancelled,

  /// No `Final` reply arrived within the deadline.
  #[error("code timed out waiting for a reply")]
  CodeTimeout,

  /// Job or macro file missing, unreadable, or parse-failed mid-stream.
  #[error("file error: {0}")]
  FileError(String),

  /// The channel has too many codes queued for its firmware buffer.
  #[error("channel busy")]
  Busy,

  /// A client request was rejected prior to dispatch.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
