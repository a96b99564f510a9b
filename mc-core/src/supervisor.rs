//! # SUPERVISOR
//!
//! Owns the long-lived services that the source kept as process-wide
//! singletons — the Job Executor and the Object Model Store — as
//! explicit fields with explicit construction, per §9's design note, so
//! a test (or a second daemon instance in the same process) can spin up
//! an isolated copy rather than sharing global state.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::code::{Code, FileOpener, MissingFileOpener};
use crate::correlator::{CodeCorrelator, PendingCode};
use crate::error::CoreError;
use crate::job::JobExecutor;
use crate::macros::MacroStack;
use crate::object_model::ObjectModelStore;
use crate::router::PacketRouter;
use crate::{Command, Response};

pub struct Supervisor {
  pub job: Arc<JobExecutor>,
  pub object_model: Arc<ObjectModelStore>,
  pub correlator: Arc<CodeCorrelator>,
  pub macro_stack: Arc<MacroStack>,
  pub router: PacketRouter,
  root_cancel: CancelToken,
}

impl Default for Supervisor {
  fn default() -> Self {
    Self::new()
  }
}

impl Supervisor {
  pub fn new() -> Self {
    Self::with_file_opener(Arc::new(MissingFileOpener))
  }

  /// As [`Self::new`], but wired to real macro/job file access. This is
  /// what the daemon binary constructs; `new()` (no file access) is for
  /// tests and anything that only needs the non-file parts.
  pub fn with_file_opener(file_opener: Arc<dyn FileOpener>) -> Self {
    let job = Arc::new(JobExecutor::new());
    let object_model = Arc::new(ObjectModelStore::new());
    let correlator = Arc::new(CodeCorrelator::new());
    let macro_stack = Arc::new(MacroStack::new());
    let router = PacketRouter::with_file_opener(Arc::clone(&correlator), Arc::clone(&macro_stack), Arc::clone(&object_model), Arc::clone(&job), file_opener);
    Self {
      job,
      object_model,
      correlator,
      macro_stack,
      router,
      root_cancel: CancelToken::root(),
    }
  }

  /// Cancels every in-flight operation across every channel, as part of
  /// an orderly shutdown.
  pub fn shutdown(&mut self) {
    self.root_cancel.cancel();
    for channel in crate::code::Channel::ALL {
      self.router.channel_mut(channel).invalidate();
    }
  }

  /// Turns one IPC [`Command`] into real calls against the Job Executor,
  /// the Packet Router, or the Object Model Store, per §6. `SimpleCode`
  /// is the one variant that cannot complete synchronously — its result
  /// depends on a firmware reply the link hasn't sent yet — so it returns
  /// the queued [`crate::correlator::PendingCode`] instead of a
  /// [`Response`], leaving the caller to await it without blocking this
  /// call (and, in turn, the packet-pump loop that drives the link).
  pub fn dispatch(&mut self, command: Command) -> DispatchOutcome {
    let response = match command {
      Command::SelectFile { name, simulating } => ok_or_response(self.job.select(name, 0, simulating)),
      Command::StartPrint => ok_or_response(self.job.start()),
      Command::Pause { offset, reason } => ok_or_response(self.job.pause(offset, reason)),
      Command::Resume => ok_or_response(self.job.resume()),
      Command::Cancel => ok_or_response(self.job.cancel()),
      Command::Abort => ok_or_response(self.job.abort()),
      Command::GetFilePosition => Response::FilePosition(self.job.state().next_file_position),
      Command::SetFilePosition(position) => ok_or_response(self.job.set_file_position(position)),
      Command::FlushChannel(channel) => {
        self.router.channel_mut(channel).flush();
        Response::Ok
      }
      Command::ReadObjectModel { path } => Response::ObjectModel(self.object_model.read_path(&path).unwrap_or(serde_json::Value::Null)),
      Command::SubscribeObjectModel { .. } => Response::ObjectModel(self.object_model.read()),
      Command::SimpleCode { channel, code_text } => {
        let code = Code::from_line(channel, &code_text);
        return DispatchOutcome::Deferred(self.router.queue_simple_code(channel, code));
      }
    };
    DispatchOutcome::Ready(response)
  }
}

fn ok_or_response(result: crate::error::CoreResult<()>) -> Response {
  match result {
    Ok(()) => Response::Ok,
    Err(err) => err.into(),
  }
}

/// What [`Supervisor::dispatch`] produced: an answer ready right away, or
/// a code still awaiting its firmware reply.
pub enum DispatchOutcome {
  Ready(Response),
  Deferred(PendingCode),
}

/// Non-blocking poll of a [`DispatchOutcome::Deferred`] handle, for a
/// caller re-checking it on each pump-loop tick instead of blocking —
/// blocking here would stall the same thread that has to keep pulling
/// egress and dispatching inbound packets for the reply to ever arrive.
/// Returns `None` while still awaiting a reply.
pub fn poll_deferred(pending: &PendingCode) -> Option<Response> {
  match pending.receiver.try_recv() {
    Ok(Ok(result)) => Some(Response::CodeResult(result)),
    Ok(Err(err)) => Some(err.into()),
    Err(oneshot::TryRecvError::Empty) => None,
    Err(oneshot::TryRecvError::Disconnected) => Some(Response::Error {
      kind: CoreError::CodeCancelled,
      message: "completion channel closed".into(),
    }),
  }
}
