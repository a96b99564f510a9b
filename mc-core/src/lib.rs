//! # MC-CORE
//!
//! The code-channel scheduler, job/macro executor, and object-model store
//! that sit above the wire protocol (`mc-proto`) and the transfer engine
//! (`mc-transfer`). Layout follows the teacher family's one-module-per-layer
//! convention: each component from the system overview gets its own file.

pub mod cancel;
pub mod channel;
pub mod code;
pub mod correlator;
pub mod error;
pub mod job;
pub mod macros;
pub mod object_model;
pub mod router;
pub mod supervisor;

pub use cancel::CancelToken;
pub use code::{Channel, Code, CodeKind, CodeResult, CodeResultEntry, CodeSource, FileOpener, MissingFileOpener, ParamValue, Severity};
pub use correlator::{CodeCorrelator, PendingCode};
pub use error::{CoreError, CoreResult};
pub use job::{JobExecutor, JobState, PauseReason, Phase};
pub use macros::{MacroFlags, MacroOrigin, MacroStack};
pub use object_model::{ObjectModelStore, Revision, Update};
pub use router::PacketRouter;
pub use supervisor::{poll_deferred, DispatchOutcome, Supervisor};

/// Commands recognised from the (out-of-scope) IPC transport, per §6.
#[derive(Clone, Debug)]
pub enum Command {
  SelectFile { name: String, simulating: bool },
  StartPrint,
  Pause { offset: Option<u64>, reason: PauseReason },
  Resume,
  Cancel,
  Abort,
  GetFilePosition,
  SetFilePosition(u64),
  FlushChannel(Channel),
  SimpleCode { channel: Channel, code_text: String },
  ReadObjectModel { path: String },
  SubscribeObjectModel { filter: Option<String> },
}

/// Result envelope returned to an IPC client.
#[derive(Clone, Debug)]
pub enum Response {
  Ok,
  FilePosition(u64),
  ObjectModel(serde_json::Value),
  CodeResult(CodeResult),
  Error { kind: CoreError, message: String },
}

impl From<CoreError> for Response {
  fn from(err: CoreError) -> Self {
    let message = err.to_string();
    Response::Error { kind: err, message }
  }
}
