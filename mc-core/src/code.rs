//! # CODE DATA MODEL
//!
//! A [`Code`] is a single command unit handed to a [`crate::channel::ChannelProcessor`].
//! Once queued, a `Code` is immutable until its completion is signalled — so
//! unlike the teacher's [`Message`], which is consumed by value on send,
//! `Code` is cloned freely and its fields never mutate after construction.

use crate::cancel::CancelToken;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// ## CHANNEL
///
/// A logical command-source identifier shared with firmware. The numeric
/// value is fixed and baked into the wire protocol, so — as with the
/// teacher's `RequestType` — it round-trips through [`TryFromPrimitive`]
/// rather than a transmute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Channel {
  Http = 0,
  Telnet = 1,
  File = 2,
  Usb = 3,
  Aux = 4,
  Trigger = 5,
  Queue = 6,
  Lcd = 7,
  Sbc = 8,
  Daemon = 9,
  AutoPause = 10,
}

impl Channel {
  /// All channels, in a fixed but otherwise arbitrary order. Egress
  /// priority is a *separate* ordering (see `mc-core::router::EGRESS_PRIORITY`);
  /// this one exists purely for enumeration (diagnostics, per-channel state
  /// tables).
  pub const ALL: [Channel; 11] = [
    Channel::Http,
    Channel::Telnet,
    Channel::File,
    Channel::Usb,
    Channel::Aux,
    Channel::Trigger,
    Channel::Queue,
    Channel::Lcd,
    Channel::Sbc,
    Channel::Daemon,
    Channel::AutoPause,
  ];
}

/// ## CODE KIND
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
  G,
  M,
  T,
  Comment,
  Empty,
}

/// ## PARAMETER VALUE
///
/// The value half of one `letter -> value` pair in a [`Code`]'s parameter
/// list. Lexing text into one of these is the job of the (out-of-scope)
/// G-code parser; this crate only carries the already-lexed result.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
  Int(i64),
  Float(f64),
  Str(String),
  /// A bare letter with no trailing value, e.g. the `X` in `G28 X`.
  Flag,
}

/// ## CODE
///
/// A single command unit: one G/M/T command plus parameters, or a comment,
/// or an empty line. Invariant: once handed to a [`crate::channel::ChannelProcessor`],
/// a `Code` is immutable until its completion is signalled.
#[derive(Clone, Debug)]
pub struct Code {
  pub kind: CodeKind,
  pub major: u32,
  pub minor: Option<u32>,
  pub params: Vec<(char, ParamValue)>,
  pub channel: Channel,
  /// Byte offset of this code within its source file. Present for codes
  /// read directly from the selected job file; absent for codes sourced
  /// from a macro file, which has no bearing on the job's file position.
  pub source_offset: Option<u64>,
  /// Encoded length in bytes, used for firmware buffer-space accounting.
  pub length: u32,
  pub cancel: CancelToken,
}

impl Code {
  pub fn simple(channel: Channel, kind: CodeKind, major: u32) -> Self {
    Self {
      kind,
      major,
      minor: None,
      params: Vec::new(),
      channel,
      source_offset: None,
      length: 0,
      cancel: CancelToken::root(),
    }
  }

  /// Builds a code straight from one line of text, via [`parse_line`].
  /// Used by the `SimpleCode` IPC path, where a code arrives as raw text
  /// with no owning file.
  pub fn from_line(channel: Channel, text: &str) -> Self {
    let (kind, major, minor, params) = parse_line(text);
    Self {
      kind,
      major,
      minor,
      params,
      channel,
      source_offset: None,
      length: text.len() as u32,
      cancel: CancelToken::root(),
    }
  }

  /// File offset one past the end of this code, used to advance
  /// `nextFilePosition` in the Job Executor.
  pub fn end_offset(&self) -> Option<u64> {
    self.source_offset.map(|o| o + self.length as u64)
  }
}

/// A deliberately small line parser: one letter of kind (`G`/`M`/`T`),
/// a major/minor number, and whitespace-separated `letter[value]`
/// parameters. Full grammar (inline expressions, checksums, line numbers)
/// is the out-of-scope lexer's job; this exists only so real files and
/// `SimpleCode` text have *something* to turn into a [`Code`].
pub fn parse_line(text: &str) -> (CodeKind, u32, Option<u32>, Vec<(char, ParamValue)>) {
  let trimmed = text.trim();
  if trimmed.is_empty() {
    return (CodeKind::Empty, 0, None, Vec::new());
  }
  if let Some(comment) = trimmed.strip_prefix(';') {
    return (CodeKind::Comment, 0, None, vec![('C', ParamValue::Str(comment.trim().to_string()))]);
  }
  let mut chars = trimmed.chars();
  let kind = match chars.next() {
    Some('G') | Some('g') => CodeKind::G,
    Some('M') | Some('m') => CodeKind::M,
    Some('T') | Some('t') => CodeKind::T,
    _ => return (CodeKind::Comment, 0, None, vec![('C', ParamValue::Str(trimmed.to_string()))]),
  };
  let mut tokens = chars.as_str().split_whitespace();
  let (major, minor) = match tokens.next() {
    Some(token) => {
      let mut parts = token.splitn(2, '.');
      let major = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
      let minor = parts.next().and_then(|s| s.parse().ok());
      (major, minor)
    }
    None => (0, None),
  };
  let params = tokens.filter_map(parse_param).collect();
  (kind, major, minor, params)
}

fn parse_param(token: &str) -> Option<(char, ParamValue)> {
  let mut chars = token.chars();
  let letter = chars.next()?.to_ascii_uppercase();
  let value_text = chars.as_str();
  let value = if value_text.is_empty() {
    ParamValue::Flag
  } else if let Ok(i) = value_text.parse::<i64>() {
    ParamValue::Int(i)
  } else if let Ok(f) = value_text.parse::<f64>() {
    ParamValue::Float(f)
  } else {
    ParamValue::Str(value_text.trim_matches('"').to_string())
  };
  Some((letter, value))
}

/// Opens a named macro or job file, producing a [`CodeSource`] over its
/// contents. The concrete implementation (real file access, plus the
/// minimal parsing in [`parse_line`]) lives above this crate; see
/// `mcd::codesource::FsFileOpener`.
pub trait FileOpener: Send + Sync {
  fn open(&self, filename: &str) -> crate::error::CoreResult<Box<dyn CodeSource>>;
}

/// A [`FileOpener`] that always reports the file missing. The default for
/// any [`crate::supervisor::Supervisor`] that hasn't been wired to real
/// file access, and for tests.
#[derive(Default)]
pub struct MissingFileOpener;

impl FileOpener for MissingFileOpener {
  fn open(&self, filename: &str) -> crate::error::CoreResult<Box<dyn CodeSource>> {
    Err(crate::error::CoreError::FileError(format!("{filename} not found")))
  }
}

/// ## SEVERITY
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
  Info,
  Warning,
  Error,
}

/// ## CODE RESULT ENTRY
#[derive(Clone, Debug, PartialEq)]
pub struct CodeResultEntry {
  pub severity: Severity,
  pub text: String,
}

/// ## CODE RESULT
///
/// An empty vector means "success, no output".
pub type CodeResult = Vec<CodeResultEntry>;

pub fn success() -> CodeResult {
  Vec::new()
}

pub fn single(severity: Severity, text: impl Into<String>) -> CodeResult {
  vec![CodeResultEntry { severity, text: text.into() }]
}

/// ## CODE SOURCE
///
/// Feeds codes to the Job Executor or a Macro Stack frame. The concrete
/// implementation (a real file reader plus the out-of-scope lexer) lives
/// above this crate; tests use [`VecCodeSource`].
pub trait CodeSource: Send {
  fn next_code(&mut self) -> crate::error::CoreResult<Option<Code>>;
  /// Current byte offset into the underlying file, if any.
  fn position(&self) -> u64;
}

/// An in-memory [`CodeSource`] for tests and for the Daemon/SBC channels'
/// `SimpleCode` path, where a single code never came from a file at all.
pub struct VecCodeSource {
  codes: std::collections::VecDeque<Code>,
}

impl VecCodeSource {
  pub fn new(codes: Vec<Code>) -> Self {
    Self { codes: codes.into() }
  }
}

impl CodeSource for VecCodeSource {
  fn next_code(&mut self) -> crate::error::CoreResult<Option<Code>> {
    Ok(self.codes.pop_front())
  }

  fn position(&self) -> u64 {
    0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn channel_round_trips_through_primitive() {
    for channel in Channel::ALL {
      let raw: u8 = channel.into();
      assert_eq!(Channel::try_from(raw).unwrap(), channel);
    }
  }

  #[test]
  fn end_offset_is_none_without_source_offset() {
    let code = Code::simple(Channel::File, CodeKind::G, 28);
    assert_eq!(code.end_offset(), None);
  }

  #[test]
  fn end_offset_adds_length_to_source_offset() {
    let mut code = Code::simple(Channel::File, CodeKind::G, 1);
    code.source_offset = Some(100);
    code.length = 8;
    assert_eq!(code.end_offset(), Some(108));
  }

  #[test]
  fn from_line_parses_kind_major_and_params() {
    let code = Code::from_line(Channel::File, "G1 X10 Y-5.2 F3000");
    assert_eq!(code.kind, CodeKind::G);
    assert_eq!(code.major, 1);
    assert_eq!(code.params[0], ('X', ParamValue::Int(10)));
    assert_eq!(code.params[1], ('Y', ParamValue::Float(-5.2)));
    assert_eq!(code.params[2], ('F', ParamValue::Int(3000)));
  }

  #[test]
  fn from_line_parses_dotted_minor_number() {
    let code = Code::from_line(Channel::File, "G92.1");
    assert_eq!(code.major, 92);
    assert_eq!(code.minor, Some(1));
  }

  #[test]
  fn from_line_treats_semicolon_lines_as_comments() {
    let code = Code::from_line(Channel::File, "; layer 3");
    assert_eq!(code.kind, CodeKind::Comment);
    assert_eq!(code.params, vec![('C', ParamValue::Str("layer 3".into()))]);
  }

  #[test]
  fn from_line_treats_blank_lines_as_empty() {
    let code = Code::from_line(Channel::File, "   ");
    assert_eq!(code.kind, CodeKind::Empty);
  }

  #[test]
  fn missing_file_opener_always_fails() {
    assert!(MissingFileOpener.open("anything.g").is_err());
  }
}
