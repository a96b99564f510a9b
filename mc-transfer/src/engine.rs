//! # TRANSFER ENGINE
//!
//! Owns the SPI device and performs one full-duplex packet exchange per
//! cycle: handshake, header exchange, body exchange, commit-or-rollback,
//! and resync on repeated corruption.
//!
//! The [`TransferEngine`] itself holds no opinion about *when* a cycle
//! should run — that decision belongs to whatever drives [`TransferEngine::exchange`]
//! in a loop on its own thread ([`spawn_cycle_thread`] provides that loop).
//! This mirrors the teacher's split between `primitive::Client` (owns the
//! transport, exposes a blocking procedure) and the thread spawned in
//! `primitive::Client::connect` that drives it continuously.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mc_proto::header::{PACKET_HEADER_LEN, TRANSFER_HEADER_LEN};
use mc_proto::{decode_packets, Packet, RequestType, TransferHeader};

use crate::bus::SpiBus;
use crate::lines::LinkLines;

/// Parameters for one [`TransferEngine`] instance.
#[derive(Clone, Copy, Debug)]
pub struct TransferConfig {
  pub format_version: u16,
  pub protocol_version: u16,
  pub handshake_timeout: Duration,
  pub resync_hold: Duration,
  pub body_cap: usize,
  /// Consecutive CRC/version failures before a resync is attempted.
  pub crc_failure_resync_threshold: u32,
  /// Consecutive resync failures before the link is declared lost.
  pub resync_failure_fatal_threshold: u32,
}

impl Default for TransferConfig {
  fn default() -> Self {
    Self {
      format_version: 1,
      protocol_version: 1,
      handshake_timeout: Duration::from_secs(4),
      resync_hold: Duration::from_secs(1),
      body_cap: mc_proto::header::DEFAULT_BODY_CAP,
      crc_failure_resync_threshold: 3,
      resync_failure_fatal_threshold: 10,
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
  #[error("handshake with firmware timed out")]
  HandshakeTimeout,
  #[error("header or body checksum/version mismatch")]
  FrameCorrupt,
  #[error("resync budget exhausted, link is lost")]
  LinkLost,
}

/// Result of a failed [`TransferEngine::exchange`]: the packets that must be
/// resubmitted unchanged, per the rollback guarantee in §4.1.
pub struct ExchangeFailure {
  pub error: LinkError,
  pub rolled_back: Vec<Packet>,
}

/// Result of a successful [`TransferEngine::exchange`].
pub struct ExchangeOutcome {
  pub inbound: Vec<Packet>,
  /// Outbound packets that did not fit this cycle's byte budget and must be
  /// resubmitted by the caller on the next cycle.
  pub deferred: Vec<Packet>,
}

pub struct TransferEngine<L, S> {
  lines: L,
  spi: S,
  config: TransferConfig,
  sequence_number: u16,
  consecutive_crc_failures: u32,
  consecutive_resync_failures: u32,
  last_sent: Vec<Packet>,
  pending_resend: VecDeque<Packet>,
}

impl<L: LinkLines, S: SpiBus> TransferEngine<L, S> {
  pub fn new(lines: L, spi: S, config: TransferConfig) -> Self {
    Self {
      lines,
      spi,
      config,
      sequence_number: 0,
      consecutive_crc_failures: 0,
      consecutive_resync_failures: 0,
      last_sent: Vec::new(),
      pending_resend: VecDeque::new(),
    }
  }

  /// Performs one full transfer cycle: handshake, header exchange, body
  /// exchange. Firmware-requested resends take priority over `outbound`;
  /// packets that don't fit the body cap come back as `deferred`.
  pub fn exchange(&mut self, outbound: Vec<Packet>) -> Result<ExchangeOutcome, ExchangeFailure> {
    let mut to_send: Vec<Packet> = self.pending_resend.drain(..).collect();
    let budget = self.config.body_cap.saturating_sub(packets_wire_len(&to_send));
    let (fits, deferred) = fit_to_budget(outbound, budget);
    to_send.extend(fits);

    if let Err(error) = self.handshake() {
      return Err(ExchangeFailure {
        error,
        rolled_back: restore(to_send, deferred),
      });
    }

    let mut body = Vec::new();
    for packet in &to_send {
      packet.append_to(&mut body);
    }

    let header = TransferHeader::new(self.config.format_version, self.config.protocol_version, self.sequence_number, &body);
    let header_bytes: [u8; TRANSFER_HEADER_LEN] = header.into();
    let mut inbound_header_bytes = [0u8; TRANSFER_HEADER_LEN];
    if self.spi.transfer(&header_bytes, &mut inbound_header_bytes).is_err() {
      return self.fail_crc(to_send, deferred);
    }
    let inbound_header = TransferHeader::from(inbound_header_bytes);
    if inbound_header.format_version != self.config.format_version || !inbound_header.header_checksum_valid() {
      return self.fail_crc(to_send, deferred);
    }

    let exchange_len = body.len().max(inbound_header.data_length as usize);
    let mut outbound_body = body.clone();
    outbound_body.resize(exchange_len, 0);
    let mut inbound_body_buf = vec![0u8; exchange_len];
    if self.spi.transfer(&outbound_body, &mut inbound_body_buf).is_err() {
      return self.fail_crc(to_send, deferred);
    }
    inbound_body_buf.truncate(inbound_header.data_length as usize);
    if !inbound_header.body_checksum_valid(&inbound_body_buf) {
      return self.fail_crc(to_send, deferred);
    }

    // COMMIT
    self.consecutive_crc_failures = 0;
    self.sequence_number = self.sequence_number.wrapping_add(1);
    let inbound = decode_packets(&inbound_body_buf);
    let previously_sent = std::mem::take(&mut self.last_sent);
    self.queue_requested_resends(&inbound, &previously_sent);
    self.last_sent = to_send;

    Ok(ExchangeOutcome { inbound, deferred })
  }

  /// Holds SBC-ready low for at least twice the firmware's expected cycle
  /// time, then restarts the handshake. Returns `Err(LinkLost)` once the
  /// resync budget (§4.1) is exhausted.
  pub fn resync(&mut self) -> Result<(), LinkError> {
    self.lines.hold_sbc_ready_low(self.config.resync_hold * 2);
    match self.handshake() {
      Ok(()) => {
        self.consecutive_resync_failures = 0;
        Ok(())
      }
      Err(_) => {
        self.consecutive_resync_failures += 1;
        if self.consecutive_resync_failures >= self.config.resync_failure_fatal_threshold {
          Err(LinkError::LinkLost)
        } else {
          Err(LinkError::HandshakeTimeout)
        }
      }
    }
  }

  fn handshake(&mut self) -> Result<(), LinkError> {
    self.lines.assert_sbc_ready();
    if self.lines.wait_firmware_ready(self.config.handshake_timeout) {
      Ok(())
    } else {
      self.lines.toggle_transfer_direction();
      Err(LinkError::HandshakeTimeout)
    }
  }

  fn fail_crc(&mut self, to_send: Vec<Packet>, deferred: Vec<Packet>) -> Result<ExchangeOutcome, ExchangeFailure> {
    self.consecutive_crc_failures += 1;
    let rolled_back = restore(to_send, deferred);
    if self.consecutive_crc_failures >= self.config.crc_failure_resync_threshold {
      self.consecutive_crc_failures = 0;
      if let Err(LinkError::LinkLost) = self.resync() {
        return Err(ExchangeFailure {
          error: LinkError::LinkLost,
          rolled_back,
        });
      }
    }
    Err(ExchangeFailure {
      error: LinkError::FrameCorrupt,
      rolled_back,
    })
  }

  fn queue_requested_resends(&mut self, inbound: &[Packet], last_sent: &[Packet]) {
    for packet in inbound {
      if RequestType::try_from(packet.header.request_type) == Ok(RequestType::ResendPacket) {
        let wanted_id = packet.header.resend_packet_id;
        if let Some(original) = last_sent.iter().find(|p| p.header.id == wanted_id) {
          self.pending_resend.push_back(original.clone());
        }
      }
    }
  }
}

fn packets_wire_len(packets: &[Packet]) -> usize {
  packets.iter().map(Packet::wire_len).sum()
}

/// Splits `packets` into (fits within `budget`, does not fit), preserving
/// order within each half.
fn fit_to_budget(packets: Vec<Packet>, budget: usize) -> (Vec<Packet>, Vec<Packet>) {
  let mut used = 0usize;
  let mut fits = Vec::new();
  let mut overflow = Vec::new();
  for packet in packets {
    let len = packet.wire_len();
    if used + len <= budget && overflow.is_empty() {
      used += len;
      fits.push(packet);
    } else {
      overflow.push(packet);
    }
  }
  (fits, overflow)
}

fn restore(mut to_send: Vec<Packet>, mut deferred: Vec<Packet>) -> Vec<Packet> {
  to_send.append(&mut deferred);
  to_send
}

/// Drives [`TransferEngine::exchange`] continuously on a dedicated thread.
/// `outbound_rx` supplies freshly queued packets from the Packet Router;
/// `inbound_tx` carries decoded inbound packets back to it. A `LinkLost`
/// error is reported on `fatal_tx` and ends the loop — the only condition
/// under which this thread stops on its own.
pub fn spawn_cycle_thread<L, S>(
  mut engine: TransferEngine<L, S>,
  outbound_rx: Receiver<Vec<Packet>>,
  inbound_tx: Sender<Vec<Packet>>,
  fatal_tx: Sender<LinkError>,
  idle_poll: Duration,
) -> JoinHandle<()>
where
  L: LinkLines + 'static,
  S: SpiBus + 'static,
{
  thread::spawn(move || {
    let mut carryover: Vec<Packet> = Vec::new();
    loop {
      let mut outbound = carryover;
      carryover = Vec::new();
      match outbound_rx.recv_timeout(idle_poll) {
        Ok(mut fresh) => outbound.append(&mut fresh),
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
      }
      match engine.exchange(outbound) {
        Ok(outcome) => {
          carryover = outcome.deferred;
          if inbound_tx.send(outcome.inbound).is_err() {
            break;
          }
        }
        Err(failure) => {
          carryover = failure.rolled_back;
          if failure.error == LinkError::LinkLost {
            let _ = fatal_tx.send(failure.error);
            break;
          }
          tracing::warn!(error = %failure.error, "transfer cycle failed, retrying");
        }
      }
    }
  })
}
