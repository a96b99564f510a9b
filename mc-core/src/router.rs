//! # PACKET ROUTER
//!
//! Demultiplexes inbound packets by [`RequestType`] and channel, and
//! serialises outbound packets from the per-channel queues under a
//! byte budget (component C2).
//!
//! Inbound message bodies beyond the framing layer (`mc-proto`) have no
//! bit-exact wire format in the governing specification — only the
//! transfer/packet headers do — so the encodings below are this crate's
//! own, chosen to be simple and stable rather than to match any external
//! reference.

use std::collections::HashMap;
use std::sync::Arc;

use mc_proto::request::RequestType;
use mc_proto::Packet;

use crate::cancel::CancelToken;
use crate::channel::ChannelProcessor;
use crate::code::{Channel, CodeResultEntry, FileOpener, MissingFileOpener, Severity};
use crate::correlator::CodeCorrelator;
use crate::error::{CoreError, CoreResult};
use crate::job::{JobExecutor, PauseReason};
use crate::macros::{MacroFlags, MacroStack};
use crate::object_model::ObjectModelStore;

/// Egress priority order. Channels not named explicitly in §4.2 follow in
/// [`Channel::ALL`]'s order, after the ones the spec does name.
pub const EGRESS_PRIORITY: [Channel; 11] = [
  Channel::Trigger,
  Channel::AutoPause,
  Channel::Http,
  Channel::Telnet,
  Channel::File,
  Channel::Usb,
  Channel::Aux,
  Channel::Queue,
  Channel::Lcd,
  Channel::Sbc,
  Channel::Daemon,
];

pub struct PacketRouter {
  channels: HashMap<Channel, ChannelProcessor>,
  object_model: Arc<ObjectModelStore>,
  job: Arc<JobExecutor>,
  correlator: Arc<CodeCorrelator>,
  file_opener: Arc<dyn FileOpener>,
}

impl PacketRouter {
  pub fn new(correlator: Arc<CodeCorrelator>, macro_stack: Arc<MacroStack>, object_model: Arc<ObjectModelStore>, job: Arc<JobExecutor>) -> Self {
    Self::with_file_opener(correlator, macro_stack, object_model, job, Arc::new(MissingFileOpener))
  }

  /// As [`Self::new`], but with real macro/job file access wired in —
  /// used by the daemon binary; tests and the no-file-access default use
  /// [`Self::new`] instead.
  pub fn with_file_opener(correlator: Arc<CodeCorrelator>, macro_stack: Arc<MacroStack>, object_model: Arc<ObjectModelStore>, job: Arc<JobExecutor>, file_opener: Arc<dyn FileOpener>) -> Self {
    let channels = Channel::ALL
      .into_iter()
      .map(|channel| (channel, ChannelProcessor::new(channel, Arc::clone(&correlator), Arc::clone(&macro_stack))))
      .collect();
    Self {
      channels,
      object_model,
      job,
      correlator,
      file_opener,
    }
  }

  pub fn channel_mut(&mut self, channel: Channel) -> &mut ChannelProcessor {
    self.channels.get_mut(&channel).expect("ChannelProcessor exists for every Channel variant")
  }

  pub fn object_model(&self) -> &Arc<ObjectModelStore> {
    &self.object_model
  }

  /// Routes one decoded inbound packet. Malformed bodies are reported as
  /// [`CoreError::ProtocolViolation`]; the caller logs and drops the
  /// packet rather than propagating the error further, per §7.
  pub fn dispatch_inbound(&mut self, packet: &Packet) -> CoreResult<()> {
    let request_type = RequestType::try_from(packet.header.request_type).map_err(|_| CoreError::ProtocolViolation(format!("unrecognised request type 0x{:04x}", packet.header.request_type)))?;
    match request_type {
      RequestType::ObjectModel => self.handle_object_model(&packet.body),
      RequestType::CodeReply => self.handle_code_reply(&packet.body),
      RequestType::MacroRequest => self.handle_macro_request(&packet.body),
      RequestType::AbortFile => self.handle_abort_file(&packet.body),
      RequestType::PrintPaused => self.handle_print_paused(&packet.body),
      RequestType::StackEvent => self.handle_stack_event(&packet.body),
      RequestType::Message => self.handle_message(&packet.body),
      RequestType::EvaluationResult => self.handle_evaluation_result(&packet.body),
      other => Err(CoreError::ProtocolViolation(format!("{other:?} is not a valid inbound request"))),
    }
  }

  fn handle_object_model(&mut self, body: &[u8]) -> CoreResult<()> {
    let envelope: ObjectModelEnvelope = serde_json::from_slice(body).map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
    if let Some(channel) = parse_buffer_space_channel(&envelope.path) {
      if let Some(bytes) = envelope.value.as_u64() {
        if let Some(processor) = self.channels.get_mut(&channel) {
          processor.update_buffer_space(bytes as u32);
        }
      }
    }
    self.object_model.apply_patch(&envelope.path, envelope.value);
    Ok(())
  }

  fn handle_code_reply(&mut self, body: &[u8]) -> CoreResult<()> {
    let reply = CodeReplyBody::decode(body)?;
    let processor = self.channels.get_mut(&reply.channel).ok_or_else(|| CoreError::ProtocolViolation("reply for unknown channel".into()))?;
    let entry = if reply.text.is_empty() {
      None
    } else {
      Some(CodeResultEntry {
        severity: reply.severity,
        text: reply.text,
      })
    };
    processor.on_reply(reply.id, entry, reply.is_final);
    Ok(())
  }

  fn handle_macro_request(&mut self, body: &[u8]) -> CoreResult<()> {
    let request = MacroRequestBody::decode(body)?;
    let source = self.file_opener.open(&request.filename);
    if let Err(ref err) = source {
      tracing::warn!(filename = %request.filename, error = %err, "macro file could not be opened");
    }
    let processor = self.channels.get_mut(&request.channel).ok_or_else(|| CoreError::ProtocolViolation("macro request for unknown channel".into()))?;
    processor.open_macro(&request.filename, request.opening_id, source, MacroFlags::default())
  }

  fn handle_abort_file(&mut self, body: &[u8]) -> CoreResult<()> {
    let request = AbortFileBody::decode(body)?;
    let processor = self.channels.get_mut(&request.channel).ok_or_else(|| CoreError::ProtocolViolation("abort for unknown channel".into()))?;
    processor.invalidate();
    if request.abort_all && request.channel == Channel::File {
      self.job.abort()?;
    }
    Ok(())
  }

  fn handle_print_paused(&mut self, body: &[u8]) -> CoreResult<()> {
    let request = PrintPausedBody::decode(body)?;
    self.job.pause(Some(request.offset), PauseReason::FirmwareRequested)
  }

  fn handle_stack_event(&mut self, body: &[u8]) -> CoreResult<()> {
    let request = StackEventBody::decode(body)?;
    let processor = self.channels.get_mut(&request.channel).ok_or_else(|| CoreError::ProtocolViolation("stack event for unknown channel".into()))?;
    processor.check_macro_eof();
    Ok(())
  }

  /// Free-form diagnostic text from firmware. Logged and mirrored into the
  /// object model under `/lastMessage` so an IPC client can read it without
  /// its own packet subscription.
  fn handle_message(&mut self, body: &[u8]) -> CoreResult<()> {
    let text = String::from_utf8_lossy(body).into_owned();
    tracing::info!(message = %text, "message from firmware");
    self.object_model.apply_patch("/lastMessage", serde_json::Value::String(text));
    Ok(())
  }

  /// Result of a previously requested expression evaluation, stored under
  /// `/evaluationResults/<requestId>` for the caller that issued it to poll.
  fn handle_evaluation_result(&mut self, body: &[u8]) -> CoreResult<()> {
    let result = EvaluationResultBody::decode(body)?;
    tracing::debug!(request_id = result.request_id, value = %result.text, "evaluation result from firmware");
    self.object_model.apply_patch(&format!("/evaluationResults/{}", result.request_id), serde_json::Value::String(result.text));
    Ok(())
  }

  /// Queues `code` for dispatch on `channel`, using a fresh root
  /// cancellation token. Used by the `SimpleCode` IPC path, where a code
  /// has no owning job.
  pub fn queue_simple_code(&mut self, channel: Channel, mut code: crate::code::Code) -> crate::correlator::PendingCode {
    code.channel = channel;
    code.cancel = CancelToken::root();
    self.channel_mut(channel).queue(code)
  }

  /// Pulls outbound packets across every channel in priority order,
  /// stopping once `byte_budget` is exhausted, also reaping any
  /// code-reply deadlines that have expired this cycle.
  pub fn pull_egress(&mut self, byte_budget: u32) -> Vec<Packet> {
    self.correlator.reap_expired();
    let mut packets = Vec::new();
    let mut remaining = byte_budget;
    for channel in EGRESS_PRIORITY {
      while remaining > 0 {
        match self.channels.get_mut(&channel).unwrap().next_packet(remaining) {
          Ok(Some(packet)) => {
            remaining = remaining.saturating_sub(packet.wire_len() as u32);
            packets.push(packet);
          }
          _ => break,
        }
      }
    }
    packets
  }
}

#[derive(serde::Deserialize)]
struct ObjectModelEnvelope {
  path: String,
  value: serde_json::Value,
}

/// Recognises the reserved `/channels/<id>/bufferSpace` path used by
/// firmware to advertise free buffer bytes for a channel, refreshing the
/// Channel Processor's local mirror per §4.3.
fn parse_buffer_space_channel(path: &str) -> Option<Channel> {
  let rest = path.strip_prefix("/channels/")?;
  let (id, rest) = rest.split_once('/')?;
  if rest != "bufferSpace" {
    return None;
  }
  let id: u8 = id.parse().ok()?;
  Channel::try_from(id).ok()
}

struct CodeReplyBody {
  channel: Channel,
  id: u16,
  severity: Severity,
  is_final: bool,
  text: String,
}

impl CodeReplyBody {
  fn decode(body: &[u8]) -> CoreResult<Self> {
    if body.len() < 6 {
      return Err(CoreError::ProtocolViolation("CodeReply body too short".into()));
    }
    let channel = Channel::try_from(body[0]).map_err(|_| CoreError::ProtocolViolation("bad channel in CodeReply".into()))?;
    let severity = match body[1] {
      0 => Severity::Info,
      1 => Severity::Warning,
      _ => Severity::Error,
    };
    let is_final = body[2] != 0;
    let id = u16::from_le_bytes([body[3], body[4]]);
    let text_len = body[5] as usize;
    let text = String::from_utf8_lossy(body.get(6..6 + text_len).unwrap_or(&[])).into_owned();
    Ok(Self { channel, id, severity, is_final, text })
  }
}

struct MacroRequestBody {
  channel: Channel,
  opening_id: u16,
  filename: String,
}

impl MacroRequestBody {
  fn decode(body: &[u8]) -> CoreResult<Self> {
    if body.len() < 4 {
      return Err(CoreError::ProtocolViolation("MacroRequest body too short".into()));
    }
    let channel = Channel::try_from(body[0]).map_err(|_| CoreError::ProtocolViolation("bad channel in MacroRequest".into()))?;
    let opening_id = u16::from_le_bytes([body[1], body[2]]);
    let name_len = body[3] as usize;
    let filename = String::from_utf8_lossy(body.get(4..4 + name_len).unwrap_or(&[])).into_owned();
    Ok(Self { channel, opening_id, filename })
  }
}

struct AbortFileBody {
  channel: Channel,
  abort_all: bool,
}

impl AbortFileBody {
  fn decode(body: &[u8]) -> CoreResult<Self> {
    if body.len() < 2 {
      return Err(CoreError::ProtocolViolation("AbortFile body too short".into()));
    }
    let channel = Channel::try_from(body[0]).map_err(|_| CoreError::ProtocolViolation("bad channel in AbortFile".into()))?;
    Ok(Self {
      channel,
      abort_all: body[1] != 0,
    })
  }
}

struct PrintPausedBody {
  offset: u64,
}

impl PrintPausedBody {
  fn decode(body: &[u8]) -> CoreResult<Self> {
    let offset = body.get(0..8).ok_or_else(|| CoreError::ProtocolViolation("PrintPaused body too short".into()))?;
    Ok(Self {
      offset: u64::from_le_bytes(offset.try_into().unwrap()),
    })
  }
}

struct EvaluationResultBody {
  request_id: u16,
  text: String,
}

impl EvaluationResultBody {
  fn decode(body: &[u8]) -> CoreResult<Self> {
    if body.len() < 3 {
      return Err(CoreError::ProtocolViolation("EvaluationResult body too short".into()));
    }
    let request_id = u16::from_le_bytes([body[0], body[1]]);
    let text_len = body[2] as usize;
    let text = String::from_utf8_lossy(body.get(3..3 + text_len).unwrap_or(&[])).into_owned();
    Ok(Self { request_id, text })
  }
}

struct StackEventBody {
  channel: Channel,
}

impl StackEventBody {
  fn decode(body: &[u8]) -> CoreResult<Self> {
    let channel = body.first().copied().ok_or_else(|| CoreError::ProtocolViolation("StackEvent body too short".into()))?;
    let channel = Channel::try_from(channel).map_err(|_| CoreError::ProtocolViolation("bad channel in StackEvent".into()))?;
    Ok(Self { channel })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::code::{Code, CodeKind};

  fn router() -> PacketRouter {
    PacketRouter::new(
      Arc::new(CodeCorrelator::new()),
      Arc::new(MacroStack::new()),
      Arc::new(ObjectModelStore::new()),
      Arc::new(JobExecutor::new()),
    )
  }

  /// A [`FileOpener`] stub standing in for `mcd`'s real file access, so
  /// router tests can exercise the success path without touching a
  /// filesystem.
  struct StubFileOpener {
    codes: Vec<Code>,
  }

  impl crate::code::FileOpener for StubFileOpener {
    fn open(&self, filename: &str) -> CoreResult<Box<dyn crate::code::CodeSource>> {
      if filename == "missing.g" {
        return Err(CoreError::FileError(format!("{filename} not found")));
      }
      Ok(Box::new(crate::code::VecCodeSource::new(self.codes.clone())))
    }
  }

  fn router_with_file(codes: Vec<Code>) -> PacketRouter {
    PacketRouter::with_file_opener(
      Arc::new(CodeCorrelator::new()),
      Arc::new(MacroStack::new()),
      Arc::new(ObjectModelStore::new()),
      Arc::new(JobExecutor::new()),
      Arc::new(StubFileOpener { codes }),
    )
  }

  fn macro_request_body(channel: Channel, opening_id: u16, filename: &str) -> Vec<u8> {
    let mut body = vec![channel.into()];
    body.extend_from_slice(&opening_id.to_le_bytes());
    body.push(filename.len() as u8);
    body.extend_from_slice(filename.as_bytes());
    body
  }

  fn code_reply_body(channel: Channel, id: u16, is_final: bool, text: &str) -> Vec<u8> {
    let mut body = vec![channel.into(), 0, is_final as u8];
    body.extend_from_slice(&id.to_le_bytes());
    body.push(text.len() as u8);
    body.extend_from_slice(text.as_bytes());
    body
  }

  #[test]
  fn unrecognised_request_type_is_a_protocol_violation_not_a_panic() {
    let mut r = router();
    let packet = Packet {
      header: mc_proto::PacketHeader {
        request_type: 0xBEEF,
        id: 0,
        length: 0,
        resend_packet_id: 0,
      },
      body: Vec::new(),
    };
    assert!(matches!(r.dispatch_inbound(&packet), Err(CoreError::ProtocolViolation(_))));
  }

  #[test]
  fn object_model_patch_is_applied_to_the_store() {
    let mut r = router();
    let body = serde_json::to_vec(&serde_json::json!({ "path": "", "value": { "state": "idle" } })).unwrap();
    let packet = Packet::new(RequestType::ObjectModel, 0, body);
    r.dispatch_inbound(&packet).unwrap();
    assert_eq!(r.object_model().read_path("/state"), Some(serde_json::json!("idle")));
  }

  #[test]
  fn code_reply_completes_the_matching_handle() {
    let mut r = router();
    let handle = r.queue_simple_code(Channel::Http, Code::simple(Channel::Http, CodeKind::M, 105));
    let packet = r.pull_egress(1024);
    assert_eq!(packet.len(), 1);
    let body = code_reply_body(Channel::Http, handle.id, true, "");
    r.dispatch_inbound(&Packet::new(RequestType::CodeReply, 0, body)).unwrap();
    assert_eq!(handle.receiver.recv().unwrap(), Ok(crate::code::success()));
  }

  #[test]
  fn egress_respects_priority_order_and_budget() {
    let mut r = router();
    let _ = r.queue_simple_code(Channel::File, Code::simple(Channel::File, CodeKind::G, 1));
    let _ = r.queue_simple_code(Channel::Trigger, Code::simple(Channel::Trigger, CodeKind::G, 2));
    let packets = r.pull_egress(1024);
    assert_eq!(packets.len(), 2);
  }

  #[test]
  fn macro_request_opens_the_file_via_the_injected_opener() {
    let mut r = router_with_file(vec![Code::simple(Channel::File, CodeKind::G, 1)]);
    let body = macro_request_body(Channel::File, 0, "start.g");
    r.dispatch_inbound(&Packet::new(RequestType::MacroRequest, 0, body)).unwrap();
    let packet = r.pull_egress(1024);
    assert_eq!(packet.len(), 1);
  }

  #[test]
  fn macro_request_for_a_missing_file_is_reported_not_silently_stubbed() {
    let mut r = router_with_file(vec![]);
    let body = macro_request_body(Channel::File, 0, "missing.g");
    assert!(matches!(r.dispatch_inbound(&Packet::new(RequestType::MacroRequest, 0, body)), Err(CoreError::FileError(_))));
  }

  #[test]
  fn message_is_stored_under_last_message() {
    let mut r = router();
    let packet = Packet::new(RequestType::Message, 0, b"bed heater disconnected".to_vec());
    r.dispatch_inbound(&packet).unwrap();
    assert_eq!(r.object_model().read_path("/lastMessage"), Some(serde_json::json!("bed heater disconnected")));
  }

  #[test]
  fn evaluation_result_is_stored_under_its_request_id() {
    let mut r = router();
    let mut body = 7u16.to_le_bytes().to_vec();
    body.push(3);
    body.extend_from_slice(b"256");
    let packet = Packet::new(RequestType::EvaluationResult, 0, body);
    r.dispatch_inbound(&packet).unwrap();
    assert_eq!(r.object_model().read_path("/evaluationResults/7"), Some(serde_json::json!("256")));
  }
}
