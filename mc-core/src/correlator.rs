//! # CODE CORRELATOR
//!
//! A bounded bidirectional map from (channel, wire id) to a completion
//! handle, grounded directly on the teacher's `outbox: Mutex<HashMap<MessageID,
//! SendOnce<Option<Message>>>>` in `semi_e37::generic::Client` — same
//! one-shot-per-transaction shape, same `Mutex<HashMap<_, _>>` guard, same
//! "remove on timeout if the receive side didn't already" cleanup rule.
//!
//! The id space here is per-channel rather than global, and ids are
//! deliberately reused once their slot frees (the teacher's `MessageID`
//! space is wide enough that it never needs to, since TCP serializes access
//! to any one session).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::code::{Channel, CodeResult};
use crate::error::CoreError;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

struct PendingEntry {
  sender: oneshot::Sender<Result<CodeResult, CoreError>>,
  deadline: Instant,
}

#[derive(Default)]
struct ChannelSlots {
  next_id: u16,
  pending: HashMap<u16, PendingEntry>,
}

impl ChannelSlots {
  fn allocate_id(&mut self) -> u16 {
    loop {
      let candidate = self.next_id;
      self.next_id = self.next_id.wrapping_add(1);
      if !self.pending.contains_key(&candidate) {
        return candidate;
      }
    }
  }
}

/// A handle returned by [`CodeCorrelator::submit`]: the wire id to embed in
/// the outbound packet, and the receiver that resolves once the matching
/// reply, a timeout, or an invalidation fires.
pub struct PendingCode {
  pub id: u16,
  pub receiver: oneshot::Receiver<Result<CodeResult, CoreError>>,
}

pub struct CodeCorrelator {
  channels: Mutex<HashMap<Channel, ChannelSlots>>,
}

impl Default for CodeCorrelator {
  fn default() -> Self {
    Self::new()
  }
}

impl CodeCorrelator {
  pub fn new() -> Self {
    Self {
      channels: Mutex::new(HashMap::new()),
    }
  }

  /// Registers a new pending completion for `channel`, with the default
  /// 30s deadline.
  pub fn submit(&self, channel: Channel) -> PendingCode {
    self.submit_with_deadline(channel, DEFAULT_DEADLINE)
  }

  pub fn submit_with_deadline(&self, channel: Channel, deadline: Duration) -> PendingCode {
    let (sender, receiver) = oneshot::channel();
    let mut channels = self.channels.lock().unwrap();
    let slots = channels.entry(channel).or_default();
    let id = slots.allocate_id();
    slots.pending.insert(
      id,
      PendingEntry {
        sender,
        deadline: Instant::now() + deadline,
      },
    );
    PendingCode { id, receiver }
  }

  /// Fulfils the pending completion for `(channel, id)`, if still present.
  /// Returns `false` if no such entry existed (already completed, timed
  /// out, or invalidated) — the caller logs this as a protocol oddity but
  /// does not treat it as fatal.
  pub fn complete(&self, channel: Channel, id: u16, result: Result<CodeResult, CoreError>) -> bool {
    let entry = {
      let mut channels = self.channels.lock().unwrap();
      channels.get_mut(&channel).and_then(|slots| slots.pending.remove(&id))
    };
    match entry {
      Some(entry) => {
        let _ = entry.sender.send(result);
        true
      }
      None => false,
    }
  }

  /// Fulfils every outstanding handle on `channel` with [`CoreError::CodeCancelled`],
  /// in no particular order, and clears the channel's table.
  pub fn invalidate(&self, channel: Channel) {
    let drained: Vec<PendingEntry> = {
      let mut channels = self.channels.lock().unwrap();
      match channels.get_mut(&channel) {
        Some(slots) => slots.pending.drain().map(|(_, entry)| entry).collect(),
        None => Vec::new(),
      }
    };
    for entry in drained {
      let _ = entry.sender.send(Err(CoreError::CodeCancelled));
    }
  }

  /// Scans every channel for entries past their deadline, fulfilling them
  /// with [`CoreError::CodeTimeout`] and reclaiming the slot. Intended to be
  /// called once per Packet Router egress cycle.
  pub fn reap_expired(&self) {
    let now = Instant::now();
    let expired: Vec<PendingEntry> = {
      let mut channels = self.channels.lock().unwrap();
      let mut expired = Vec::new();
      for slots in channels.values_mut() {
        let timed_out_ids: Vec<u16> = slots.pending.iter().filter(|(_, entry)| entry.deadline <= now).map(|(id, _)| *id).collect();
        for id in timed_out_ids {
          if let Some(entry) = slots.pending.remove(&id) {
            expired.push(entry);
          }
        }
      }
      expired
    };
    for entry in expired {
      let _ = entry.sender.send(Err(CoreError::CodeTimeout));
    }
  }

  /// Number of entries currently pending on `channel`, used by diagnostics.
  pub fn pending_count(&self, channel: Channel) -> usize {
    self.channels.lock().unwrap().get(&channel).map_or(0, |slots| slots.pending.len())
  }
}
