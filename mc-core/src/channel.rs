//! # CHANNEL PROCESSOR
//!
//! One instance per logical [`Channel`] (component C3). Owns the local
//! FIFO of not-yet-sent codes, the map of codes currently in flight with
//! firmware, and the firmware buffer-space mirror that throttles egress.
//!
//! Wire ids are allocated from the [`CodeCorrelator`] at `queue()` time
//! rather than at the moment a packet is actually handed to the Transfer
//! Engine — a deliberate simplification over the literal "id assigned when
//! committed to the transfer" reading (see DESIGN.md): it lets a single
//! structure, the correlator, hold every completion regardless of whether
//! the code is still `Queued` or already `In flight`, so `invalidate()`
//! reduces to one call instead of two separate drains.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use mc_proto::request::RequestType;
use mc_proto::Packet;

use crate::code::{Channel, Code, CodeResultEntry, ParamValue};
use crate::correlator::{CodeCorrelator, PendingCode};
use crate::error::{CoreError, CoreResult};
use crate::macros::{MacroFlags, MacroOrigin, MacroStack};

struct InFlightEntry {
  accumulated: Vec<CodeResultEntry>,
  /// Set while this code opened a macro that firmware has not yet closed;
  /// its `Final` reply, once it arrives, is held in `deferred_final`
  /// rather than completed immediately.
  macro_pending: bool,
}

pub struct ChannelProcessor {
  channel: Channel,
  correlator: Arc<CodeCorrelator>,
  macro_stack: Arc<MacroStack>,
  pending: VecDeque<(u16, Code)>,
  in_flight: HashMap<u16, InFlightEntry>,
  /// A code already popped off the macro stack via `read_next` but not yet
  /// emitted because it didn't fit the last `emit` attempt's budget —
  /// held here instead of being silently dropped, since `read_next` has no
  /// peek/push-back of its own.
  held_macro_code: Option<Code>,
  buffer_space: u32,
  /// The single in-flight id currently awaiting its macro's EOF, per the
  /// "single-slot macro-pending field" rule in §4.3 — a channel can only
  /// have one macro open at a time regardless of nesting depth.
  macro_pending_id: Option<u16>,
  deferred_final: Option<(u16, Vec<CodeResultEntry>)>,
}

impl ChannelProcessor {
  pub fn new(channel: Channel, correlator: Arc<CodeCorrelator>, macro_stack: Arc<MacroStack>) -> Self {
    Self {
      channel,
      correlator,
      macro_stack,
      pending: VecDeque::new(),
      in_flight: HashMap::new(),
      held_macro_code: None,
      buffer_space: u32::MAX,
      macro_pending_id: None,
      deferred_final: None,
    }
  }

  pub fn channel(&self) -> Channel {
    self.channel
  }

  /// Queues `code`, returning its completion handle. The wire id is
  /// allocated immediately so `invalidate()` can reach it whether or not
  /// it has been sent yet.
  pub fn queue(&mut self, code: Code) -> PendingCode {
    let pending = self.correlator.submit(self.channel);
    self.pending.push_back((pending.id, code));
    pending
  }

  /// Refreshes the local mirror of firmware-advertised free buffer bytes
  /// for this channel. Called on every Object Model Store update.
  pub fn update_buffer_space(&mut self, bytes: u32) {
    self.buffer_space = bytes;
  }

  /// Pulls the next outbound packet, if one fits within both `byte_budget`
  /// and the current buffer-space mirror. Macro-sourced codes take
  /// priority over the local FIFO, per §4.3's "macro codes precede plain
  /// codes" rule.
  pub fn next_packet(&mut self, byte_budget: u32) -> CoreResult<Option<Packet>> {
    if let Some(code) = self.held_macro_code.take() {
      return Ok(self.emit_or_hold_macro_code(code, byte_budget));
    }
    if self.macro_stack.depth(self.channel) > 0 {
      if let Some(code) = self.macro_stack.read_next(self.channel)? {
        return Ok(self.emit_or_hold_macro_code(code, byte_budget));
      }
      self.check_macro_eof();
    }
    let Some((id, code)) = self.pending.front() else {
      return Ok(None);
    };
    let body_len = encode_code(code).len() as u32;
    if body_len > self.buffer_space || body_len > byte_budget {
      return Ok(None);
    }
    let (id, code) = self.pending.pop_front().unwrap();
    Ok(self.emit(&code, Some(id), byte_budget))
  }

  /// Emits a code already popped off the macro stack, or holds onto it in
  /// `held_macro_code` if it doesn't fit this attempt's budget so the next
  /// `next_packet` call retries the same code instead of losing it.
  fn emit_or_hold_macro_code(&mut self, code: Code, byte_budget: u32) -> Option<Packet> {
    match self.emit(&code, None, byte_budget) {
      Some(packet) => Some(packet),
      None => {
        self.held_macro_code = Some(code);
        None
      }
    }
  }

  fn emit(&mut self, code: &Code, existing_id: Option<u16>, byte_budget: u32) -> Option<Packet> {
    let body = encode_code(code);
    let body_len = body.len() as u32;
    if body_len > self.buffer_space || body_len > byte_budget {
      return None;
    }
    let id = match existing_id {
      Some(id) => id,
      None => self.correlator.submit(self.channel).id,
    };
    self.buffer_space = self.buffer_space.saturating_sub(body_len);
    self.in_flight.insert(
      id,
      InFlightEntry {
        accumulated: Vec::new(),
        macro_pending: false,
      },
    );
    Some(Packet::new(RequestType::Code, id, body))
  }

  /// Marks `opening_id` as having opened a macro, and pushes the frame.
  /// If the open fails and `opening_id` is still in flight, its
  /// completion fails immediately with the open error; otherwise the
  /// error is returned for the caller to log.
  pub fn open_macro(&mut self, filename: &str, opening_id: u16, source: CoreResult<Box<dyn crate::code::CodeSource>>, flags: MacroFlags) -> CoreResult<()> {
    let result = self.macro_stack.push(self.channel, filename, source, MacroOrigin::Code(opening_id), flags);
    if let Err(ref err) = result {
      if self.in_flight.remove(&opening_id).is_some() {
        self.correlator.complete(self.channel, opening_id, Err(err.clone()));
      }
      return result;
    }
    if let Some(entry) = self.in_flight.get_mut(&opening_id) {
      entry.macro_pending = true;
    }
    self.macro_pending_id = Some(opening_id);
    Ok(())
  }

  /// Routes a `CodeReply` for `id`: accumulates `entry` if present,
  /// completes on `is_final`, deferring completion if this id is the
  /// current macro's opening code and the macro has not yet closed.
  pub fn on_reply(&mut self, id: u16, entry: Option<CodeResultEntry>, is_final: bool) {
    let Some(in_flight) = self.in_flight.get_mut(&id) else {
      return;
    };
    if let Some(entry) = entry {
      in_flight.accumulated.push(entry);
    }
    if !is_final {
      return;
    }
    if in_flight.macro_pending {
      let accumulated = std::mem::take(&mut in_flight.accumulated);
      self.deferred_final = Some((id, accumulated));
      return;
    }
    let accumulated = self.in_flight.remove(&id).unwrap().accumulated;
    self.correlator.complete(self.channel, id, Ok(accumulated));
  }

  /// Checks whether the channel's macro stack has fully closed, and if
  /// so, releases any completion that was deferred waiting for that
  /// closure.
  pub fn check_macro_eof(&mut self) {
    if self.macro_stack.depth(self.channel) > 0 {
      return;
    }
    self.macro_pending_id = None;
    if let Some((id, accumulated)) = self.deferred_final.take() {
      self.in_flight.remove(&id);
      self.correlator.complete(self.channel, id, Ok(accumulated));
    }
  }

  /// Drops every not-yet-sent code, completing each with
  /// [`CoreError::CodeCancelled`]. In-flight codes are left untouched.
  /// Returns the number of codes dropped.
  pub fn flush(&mut self) -> usize {
    let dropped = self.pending.len();
    for (id, _) in self.pending.drain(..) {
      self.correlator.complete(self.channel, id, Err(CoreError::CodeCancelled));
    }
    dropped
  }

  /// Channel-wide invalidation: every queued and in-flight code fails
  /// with [`CoreError::CodeCancelled`], and the channel's macro stack is
  /// torn down.
  pub fn invalidate(&mut self) {
    self.pending.clear();
    self.in_flight.clear();
    self.held_macro_code = None;
    self.macro_pending_id = None;
    self.deferred_final = None;
    self.macro_stack.abort_all(self.channel);
    self.correlator.invalidate(self.channel);
  }

  pub fn pending_len(&self) -> usize {
    self.pending.len()
  }

  pub fn in_flight_len(&self) -> usize {
    self.in_flight.len()
  }
}

/// Binary-encodes a code's parameter list for the wire. Inline expression
/// resolution is the lexer's job (out of scope here); this sees only
/// already-resolved values.
fn encode_code(code: &Code) -> Vec<u8> {
  let mut out = Vec::new();
  out.push(kind_tag(code.kind));
  out.extend_from_slice(&code.major.to_le_bytes());
  match code.minor {
    Some(minor) => {
      out.push(1);
      out.extend_from_slice(&minor.to_le_bytes());
    }
    None => out.push(0),
  }
  out.push(code.params.len() as u8);
  for (letter, value) in &code.params {
    out.push(*letter as u8);
    match value {
      ParamValue::Int(v) => {
        out.push(0);
        out.extend_from_slice(&v.to_le_bytes());
      }
      ParamValue::Float(v) => {
        out.push(1);
        out.extend_from_slice(&v.to_le_bytes());
      }
      ParamValue::Str(s) => {
        out.push(2);
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
      }
      ParamValue::Flag => out.push(3),
    }
  }
  out
}

fn kind_tag(kind: crate::code::CodeKind) -> u8 {
  use crate::code::CodeKind::*;
  match kind {
    G => 0,
    M => 1,
    T => 2,
    Comment => 3,
    Empty => 4,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::code::{success, CodeKind, Severity, VecCodeSource};

  fn processor() -> ChannelProcessor {
    ChannelProcessor::new(Channel::File, Arc::new(CodeCorrelator::new()), Arc::new(MacroStack::new()))
  }

  #[test]
  fn queued_code_is_not_in_flight_until_next_packet() {
    let mut proc = processor();
    proc.update_buffer_space(1024);
    let code = Code::simple(Channel::File, CodeKind::G, 1);
    let _handle = proc.queue(code);
    assert_eq!(proc.pending_len(), 1);
    assert_eq!(proc.in_flight_len(), 0);
    let packet = proc.next_packet(1024).unwrap();
    assert!(packet.is_some());
    assert_eq!(proc.pending_len(), 0);
    assert_eq!(proc.in_flight_len(), 1);
  }

  #[test]
  fn oversized_code_is_not_emitted_until_buffer_space_frees() {
    let mut proc = processor();
    proc.update_buffer_space(3);
    let code = Code::simple(Channel::File, CodeKind::G, 1);
    let _handle = proc.queue(code);
    assert_eq!(proc.next_packet(1024).unwrap(), None);
    proc.update_buffer_space(1024);
    assert!(proc.next_packet(1024).unwrap().is_some());
  }

  #[test]
  fn final_reply_completes_the_handle() {
    let mut proc = processor();
    proc.update_buffer_space(1024);
    let code = Code::simple(Channel::File, CodeKind::G, 1);
    let handle = proc.queue(code);
    proc.next_packet(1024).unwrap();
    proc.on_reply(handle.id, None, true);
    assert_eq!(handle.receiver.recv().unwrap(), Ok(success()));
    assert_eq!(proc.in_flight_len(), 0);
  }

  #[test]
  fn macro_pending_code_defers_completion_until_macro_closes() {
    let mut proc = processor();
    proc.update_buffer_space(1024);
    let opening = Code::simple(Channel::File, CodeKind::M, 98);
    let handle = proc.queue(opening);
    proc.next_packet(1024).unwrap();
    let macro_codes = vec![Code::simple(Channel::File, CodeKind::G, 1)];
    proc
      .open_macro("foo.g", handle.id, Ok(Box::new(VecCodeSource::new(macro_codes))), MacroFlags::default())
      .unwrap();
    proc.on_reply(handle.id, Some(CodeResultEntry { severity: Severity::Info, text: "ack".into() }), true);
    assert!(handle.receiver.try_recv().is_err());
    let macro_packet = proc.next_packet(1024).unwrap();
    assert!(macro_packet.is_some());
    assert!(handle.receiver.try_recv().is_err());
    assert_eq!(proc.next_packet(1024).unwrap(), None);
    assert!(handle.receiver.recv().is_ok());
  }

  #[test]
  fn macro_code_that_does_not_fit_buffer_is_held_not_lost() {
    let mut proc = processor();
    proc.update_buffer_space(1024);
    let opening = Code::simple(Channel::File, CodeKind::M, 98);
    let handle = proc.queue(opening);
    proc.next_packet(1024).unwrap();
    let macro_codes = vec![Code::simple(Channel::File, CodeKind::G, 55)];
    proc
      .open_macro("foo.g", handle.id, Ok(Box::new(VecCodeSource::new(macro_codes))), MacroFlags::default())
      .unwrap();
    proc.update_buffer_space(3);
    assert_eq!(proc.next_packet(1024).unwrap(), None);
    proc.update_buffer_space(1024);
    let packet = proc.next_packet(1024).unwrap();
    assert!(packet.is_some());
    assert_eq!(proc.in_flight_len(), 2);
  }

  #[test]
  fn invalidate_cancels_both_queued_and_in_flight_codes() {
    let mut proc = processor();
    proc.update_buffer_space(1024);
    let queued_handle = proc.queue(Code::simple(Channel::File, CodeKind::G, 1));
    let sent_handle = proc.queue(Code::simple(Channel::File, CodeKind::G, 2));
    proc.next_packet(1024).unwrap();
    proc.invalidate();
    assert_eq!(queued_handle.receiver.recv().unwrap(), Err(CoreError::CodeCancelled));
    assert_eq!(sent_handle.receiver.recv().unwrap(), Err(CoreError::CodeCancelled));
  }

  #[test]
  fn flush_cancels_only_unsent_codes() {
    let mut proc = processor();
    proc.update_buffer_space(1024);
    let sent_handle = proc.queue(Code::simple(Channel::File, CodeKind::G, 1));
    proc.next_packet(1024).unwrap();
    let unsent_handle = proc.queue(Code::simple(Channel::File, CodeKind::G, 2));
    assert_eq!(proc.flush(), 1);
    assert_eq!(unsent_handle.receiver.recv().unwrap(), Err(CoreError::CodeCancelled));
    assert!(sent_handle.receiver.try_recv().is_err());
  }
}
