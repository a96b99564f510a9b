//! # MACRO STACK
//!
//! Per-channel stack of open macro files (component C5). A registry rather
//! than a per-`ChannelProcessor` field, per spec: several channels may each
//! have their own open macros concurrently, but a given channel's stack is
//! never touched from outside its own [`crate::channel::ChannelProcessor`].
//!
//! File opening is out of scope for this crate (same boundary as
//! [`crate::code::CodeSource`]): callers pass an already-constructed source,
//! or the `Err` they got trying to build one.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::code::{Channel, Code, CodeSource};
use crate::error::{CoreError, CoreResult};

/// What triggered this macro to open: a specific in-flight code on the
/// channel (whose completion is deferred until the macro closes and its
/// own reply arrives), or the firmware itself with no originating code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacroOrigin {
  System,
  Code(u16),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MacroFlags {
  pub is_config: bool,
  pub is_config_override: bool,
  pub is_nested: bool,
}

struct MacroFrame {
  filename: String,
  started_by: MacroOrigin,
  flags: MacroFlags,
  source: Box<dyn CodeSource>,
}

#[derive(Default)]
pub struct MacroStack {
  channels: Mutex<HashMap<Channel, Vec<MacroFrame>>>,
}

impl MacroStack {
  pub fn new() -> Self {
    Self::default()
  }

  /// Pushes a new frame onto `channel`'s stack. `source` is the result of
  /// an already-attempted file open; `Err` is passed straight back to the
  /// caller, which decides whether to fail `started_by`'s code or merely
  /// log it, per §4.5.
  pub fn push(&self, channel: Channel, filename: impl Into<String>, source: CoreResult<Box<dyn CodeSource>>, started_by: MacroOrigin, flags: MacroFlags) -> CoreResult<()> {
    let source = source?;
    let mut channels = self.channels.lock().unwrap();
    channels.entry(channel).or_default().push(MacroFrame {
      filename: filename.into(),
      started_by,
      flags,
      source,
    });
    Ok(())
  }

  /// Returns the next code from the innermost open frame on `channel`,
  /// popping exhausted frames and retrying until a code is produced or no
  /// frames remain.
  pub fn read_next(&self, channel: Channel) -> CoreResult<Option<Code>> {
    let mut channels = self.channels.lock().unwrap();
    let Some(frames) = channels.get_mut(&channel) else {
      return Ok(None);
    };
    loop {
      let Some(frame) = frames.last_mut() else {
        return Ok(None);
      };
      match frame.source.next_code()? {
        Some(code) => return Ok(Some(code)),
        None => {
          frames.pop();
        }
      }
    }
  }

  /// Closes and pops every frame on `channel`. Returns `true` if any frame
  /// was present.
  pub fn abort_all(&self, channel: Channel) -> bool {
    let mut channels = self.channels.lock().unwrap();
    match channels.get_mut(&channel) {
      Some(frames) if !frames.is_empty() => {
        frames.clear();
        true
      }
      _ => false,
    }
  }

  /// Closes and pops only the innermost frame on `channel`. Returns the
  /// popped frame's origin, if one existed.
  pub fn abort_last(&self, channel: Channel) -> Option<MacroOrigin> {
    let mut channels = self.channels.lock().unwrap();
    channels.get_mut(&channel).and_then(|frames| frames.pop()).map(|frame| frame.started_by)
  }

  /// Number of open frames on `channel`. Zero means no macro is active.
  pub fn depth(&self, channel: Channel) -> usize {
    self.channels.lock().unwrap().get(&channel).map_or(0, Vec::len)
  }

  /// Diagnostic dump: `(channel, depth index from the bottom, filename)`
  /// for every open frame across every channel.
  pub fn dump(&self) -> Vec<(Channel, usize, String)> {
    let channels = self.channels.lock().unwrap();
    let mut out = Vec::new();
    for (channel, frames) in channels.iter() {
      for (depth, frame) in frames.iter().enumerate() {
        out.push((*channel, depth, frame.filename.clone()));
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::code::{CodeKind, VecCodeSource};

  fn source(codes: Vec<Code>) -> CoreResult<Box<dyn CodeSource>> {
    Ok(Box::new(VecCodeSource::new(codes)))
  }

  #[test]
  fn push_then_read_next_drains_in_order() {
    let stack = MacroStack::new();
    let codes = vec![Code::simple(Channel::File, CodeKind::G, 1), Code::simple(Channel::File, CodeKind::G, 2)];
    stack.push(Channel::File, "foo.g", source(codes), MacroOrigin::Code(7), MacroFlags::default()).unwrap();
    assert_eq!(stack.read_next(Channel::File).unwrap().unwrap().major, 1);
    assert_eq!(stack.read_next(Channel::File).unwrap().unwrap().major, 2);
  }

  #[test]
  fn exhausted_frame_pops_and_falls_through_to_none() {
    let stack = MacroStack::new();
    stack.push(Channel::File, "foo.g", source(vec![]), MacroOrigin::System, MacroFlags::default()).unwrap();
    assert_eq!(stack.read_next(Channel::File).unwrap(), None);
    assert_eq!(stack.depth(Channel::File), 0);
  }

  #[test]
  fn nested_frame_is_drained_before_the_outer_one() {
    let stack = MacroStack::new();
    let outer = vec![Code::simple(Channel::File, CodeKind::G, 1)];
    let inner = vec![Code::simple(Channel::File, CodeKind::G, 99)];
    stack.push(Channel::File, "outer.g", source(outer), MacroOrigin::System, MacroFlags::default()).unwrap();
    stack.push(Channel::File, "inner.g", source(inner), MacroOrigin::System, MacroFlags { is_nested: true, ..Default::default() }).unwrap();
    assert_eq!(stack.read_next(Channel::File).unwrap().unwrap().major, 99);
    assert_eq!(stack.depth(Channel::File), 1);
    assert_eq!(stack.read_next(Channel::File).unwrap().unwrap().major, 1);
    assert_eq!(stack.depth(Channel::File), 0);
  }

  #[test]
  fn push_propagates_open_error_to_caller() {
    let stack = MacroStack::new();
    let result = stack.push(Channel::File, "missing.g", Err(CoreError::FileError("not found".into())), MacroOrigin::Code(7), MacroFlags::default());
    assert_eq!(result, Err(CoreError::FileError("not found".into())));
    assert_eq!(stack.depth(Channel::File), 0);
  }

  #[test]
  fn abort_all_clears_every_frame() {
    let stack = MacroStack::new();
    stack.push(Channel::File, "a.g", source(vec![]), MacroOrigin::System, MacroFlags::default()).unwrap();
    stack.channels.lock().unwrap().get_mut(&Channel::File).unwrap().push(MacroFrame {
      filename: "b.g".into(),
      started_by: MacroOrigin::System,
      flags: MacroFlags::default(),
      source: Box::new(VecCodeSource::new(vec![])),
    });
    assert!(stack.abort_all(Channel::File));
    assert_eq!(stack.depth(Channel::File), 0);
    assert!(!stack.abort_all(Channel::File));
  }

  #[test]
  fn abort_last_pops_only_the_innermost_frame() {
    let stack = MacroStack::new();
    stack.push(Channel::File, "a.g", source(vec![]), MacroOrigin::Code(1), MacroFlags::default()).unwrap();
    stack.push(Channel::File, "b.g", source(vec![]), MacroOrigin::Code(2), MacroFlags::default()).unwrap();
    let popped = stack.abort_last(Channel::File);
    assert_eq!(popped, Some(MacroOrigin::Code(2)));
    assert_eq!(stack.depth(Channel::File), 1);
  }

  #[test]
  fn dump_reports_depth_and_filename() {
    let stack = MacroStack::new();
    stack.push(Channel::File, "a.g", source(vec![]), MacroOrigin::System, MacroFlags::default()).unwrap();
    let dump = stack.dump();
    assert_eq!(dump, vec![(Channel::File, 0, "a.g".to_string())]);
  }
}
