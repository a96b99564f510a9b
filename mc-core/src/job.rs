//! # JOB EXECUTOR
//!
//! Owns the currently selected job file and its state machine (component
//! C4). Transitions are atomic under a single mutex; `resume` and
//! `finished` waiters are condition variables guarded by that same mutex,
//! mirroring the teacher's pattern of pairing a `Mutex<T>` with
//! `Condvar`-style waiters rather than reaching for an async notify.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::channel::ChannelProcessor;
use crate::code::{Channel, Code, CodeResult, CodeSource};
use crate::correlator::PendingCode;
use crate::error::{CoreError, CoreResult};

pub const BUFFERED_PRINT_CODES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
  Idle,
  Selected,
  Running,
  Paused,
  Cancelling,
  Aborting,
  Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseReason {
  User,
  FirmwareRequested,
  FilamentRunout,
}

#[derive(Clone, Debug, Default)]
pub struct JobState {
  pub filename: Option<String>,
  pub next_file_position: u64,
  pub total_length: u64,
  pub phase: Option<Phase>,
  pub pause_reason: Option<PauseReason>,
  pub pause_position: Option<u64>,
  pub is_simulating: bool,
  pub last_file_aborted: bool,
  pub last_file_cancelled: bool,
}

impl JobState {
  fn phase_or_idle(&self) -> Phase {
    self.phase.unwrap_or(Phase::Idle)
  }
}

struct Shared {
  state: Mutex<JobState>,
  resume_cv: Condvar,
  finished_cv: Condvar,
}

/// The Job Executor. Generic over the code source so tests can drive it
/// with an in-memory file instead of a real filesystem reader.
pub struct JobExecutor {
  shared: Arc<Shared>,
  cancel_root: crate::cancel::CancelToken,
  run_cancel: Mutex<crate::cancel::CancelToken>,
}

impl Default for JobExecutor {
  fn default() -> Self {
    Self::new()
  }
}

impl JobExecutor {
  pub fn new() -> Self {
    let root = crate::cancel::CancelToken::root();
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(JobState::default()),
        resume_cv: Condvar::new(),
        finished_cv: Condvar::new(),
      }),
      run_cancel: Mutex::new(root.child()),
      cancel_root: root,
    }
  }

  pub fn state(&self) -> JobState {
    self.shared.state.lock().unwrap().clone()
  }

  /// Selects a new job file. If one is currently running, it is
  /// cancelled and the caller blocks until it reaches `Finished` before
  /// the new file becomes `Selected`, per §4.4. Rejects with `Busy` if a
  /// `Cancel` is already draining (resolves the "second `SelectFile`
  /// during `Cancelling`" open question from §9 as a rejection, not a
  /// queued request).
  pub fn select(&self, filename: impl Into<String>, total_length: u64, is_simulating: bool) -> CoreResult<()> {
    {
      let state = self.shared.state.lock().unwrap();
      if state.phase_or_idle() == Phase::Cancelling {
        return Err(CoreError::Busy);
      }
    }
    if matches!(self.state().phase_or_idle(), Phase::Running | Phase::Paused) {
      self.cancel()?;
      self.wait_finished();
    }
    let mut state = self.shared.state.lock().unwrap();
    *state = JobState {
      filename: Some(filename.into()),
      next_file_position: 0,
      total_length,
      phase: Some(Phase::Selected),
      pause_reason: None,
      pause_position: None,
      is_simulating,
      last_file_aborted: false,
      last_file_cancelled: false,
    };
    *self.run_cancel.lock().unwrap() = self.cancel_root.child();
    Ok(())
  }

  pub fn start(&self) -> CoreResult<()> {
    let mut state = self.shared.state.lock().unwrap();
    if state.phase_or_idle() != Phase::Selected {
      return Err(CoreError::InvalidArgument("no file selected".into()));
    }
    state.phase = Some(Phase::Running);
    Ok(())
  }

  /// Enters `Paused`, honouring the §9 precedence rule: a `PrintPaused`
  /// that arrives while already `Paused` overrides the stored offset only
  /// if its own offset is ≤ the current one.
  pub fn pause(&self, offset: Option<u64>, reason: PauseReason) -> CoreResult<()> {
    let mut state = self.shared.state.lock().unwrap();
    match state.phase_or_idle() {
      Phase::Running => {
        state.pause_position = offset;
        state.pause_reason = Some(reason);
        state.phase = Some(Phase::Paused);
      }
      Phase::Paused => {
        if let Some(new_offset) = offset {
          let overrides = match state.pause_position {
            Some(current) => new_offset <= current,
            None => true,
          };
          if overrides {
            state.pause_position = Some(new_offset);
            state.pause_reason = Some(reason);
          }
        }
      }
      _ => return Err(CoreError::InvalidArgument("not running".into())),
    }
    Ok(())
  }

  pub fn resume(&self) -> CoreResult<()> {
    let mut state = self.shared.state.lock().unwrap();
    if state.phase_or_idle() != Phase::Paused {
      return Ok(());
    }
    if let Some(pos) = state.pause_position.take() {
      state.next_file_position = pos;
    }
    state.pause_reason = None;
    state.phase = Some(Phase::Running);
    self.shared.resume_cv.notify_all();
    Ok(())
  }

  /// Directly sets the next read position, e.g. after a client-issued
  /// seek. Only valid while no read loop is in progress.
  pub fn set_file_position(&self, position: u64) -> CoreResult<()> {
    let mut state = self.shared.state.lock().unwrap();
    match state.phase_or_idle() {
      Phase::Selected | Phase::Paused => {
        state.next_file_position = position;
        Ok(())
      }
      _ => Err(CoreError::InvalidArgument("file position can only be set while selected or paused".into())),
    }
  }

  pub fn cancel(&self) -> CoreResult<()> {
    self.transition_to_draining(Phase::Cancelling)
  }

  pub fn abort(&self) -> CoreResult<()> {
    self.transition_to_draining(Phase::Aborting)
  }

  fn transition_to_draining(&self, target: Phase) -> CoreResult<()> {
    {
      let mut state = self.shared.state.lock().unwrap();
      match state.phase_or_idle() {
        Phase::Running | Phase::Paused => state.phase = Some(target),
        Phase::Finished | Phase::Idle => return Ok(()),
        _ => return Err(CoreError::InvalidArgument("no job running".into())),
      }
    }
    self.run_cancel.lock().unwrap().cancel();
    self.shared.resume_cv.notify_all();
    Ok(())
  }

  fn wait_finished(&self) {
    let state = self.shared.state.lock().unwrap();
    let _unused = self.shared.finished_cv.wait_while(state, |s| !matches!(s.phase, Some(Phase::Finished) | None));
  }

  /// Runs the read-dispatch-advance loop against `source` until the file
  /// is exhausted, cancelled, or aborted, dispatching each code to
  /// `channel` and draining completions in submission order.
  ///
  /// Blocks the calling thread; callers run this on a dedicated worker,
  /// matching the Transfer Engine's own dedicated-thread design.
  pub fn run(&self, source: &mut dyn CodeSource, channel: &mut ChannelProcessor) -> CoreResult<()> {
    let mut code_tasks: VecDeque<(PendingCode, Option<u64>)> = VecDeque::new();
    let mut eof = false;
    loop {
      if self.run_cancel.lock().unwrap().is_cancelled() {
        break;
      }
      if matches!(self.state().phase_or_idle(), Phase::Paused) {
        self.block_until_resume_or_drain();
        continue;
      }
      while !eof && code_tasks.len() < BUFFERED_PRINT_CODES && !matches!(self.state().phase_or_idle(), Phase::Paused) {
        let cancel = self.run_cancel.lock().unwrap().clone();
        if cancel.is_cancelled() {
          break;
        }
        match source.next_code()? {
          Some(mut code) => {
            code.channel = channel.channel();
            let end_offset = code.end_offset();
            code.cancel = cancel;
            code_tasks.push_back((channel.queue(code), end_offset));
          }
          None => eof = true,
        }
      }
      match code_tasks.pop_front() {
        Some((task, end_offset)) => {
          let result = self.await_completion(&task);
          if let Err(err) = &result {
            tracing::debug!(error = %err, "code completed with an error");
          }
          if let Some(offset) = end_offset {
            self.shared.state.lock().unwrap().next_file_position = offset;
          }
        }
        None if eof => break,
        None => {}
      }
      if self.run_cancel.lock().unwrap().is_cancelled() {
        break;
      }
    }
    self.finish(channel, code_tasks.into_iter().map(|(task, _)| task))
  }

  /// Blocks on `task`'s completion, polling the cancellation flag between
  /// short waits so a concurrent `cancel()`/`abort()` is noticed even
  /// though the matching channel invalidation hasn't reached the
  /// correlator yet — that invalidation runs later, from `finish()`.
  fn await_completion(&self, task: &PendingCode) -> CoreResult<CodeResult> {
    loop {
      if self.run_cancel.lock().unwrap().is_cancelled() {
        return Err(CoreError::CodeCancelled);
      }
      match task.receiver.recv_timeout(std::time::Duration::from_millis(20)) {
        Ok(result) => return result,
        Err(oneshot::RecvTimeoutError::Timeout) => continue,
        Err(oneshot::RecvTimeoutError::Disconnected) => return Err(CoreError::CodeCancelled),
      }
    }
  }

  fn block_until_resume_or_drain(&self) {
    let state = self.shared.state.lock().unwrap();
    let _unused = self.shared.resume_cv.wait_while(state, |s| matches!(s.phase, Some(Phase::Paused)));
  }

  fn finish(&self, channel: &mut ChannelProcessor, code_tasks: impl Iterator<Item = PendingCode>) -> CoreResult<()> {
    let mut state = self.shared.state.lock().unwrap();
    let final_phase = match state.phase_or_idle() {
      Phase::Cancelling => {
        channel.invalidate();
        state.last_file_cancelled = true;
        Phase::Finished
      }
      Phase::Aborting => {
        channel.invalidate();
        state.last_file_aborted = true;
        Phase::Finished
      }
      _ => Phase::Finished,
    };
    state.phase = Some(final_phase);
    drop(state);
    // Any entries still outstanding were fulfilled by `channel.invalidate()`
    // above (or were never sent in the first place); this only reclaims
    // the receivers so their senders' results aren't reported as dropped.
    for task in code_tasks {
      let _ = task.receiver.recv();
    }
    self.shared.finished_cv.notify_all();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cancel::CancelToken;
  use crate::channel::ChannelProcessor;
  use crate::code::{Code, CodeKind, VecCodeSource};
  use crate::correlator::CodeCorrelator;
  use crate::macros::MacroStack;
  use std::thread;
  use std::time::Duration;

  fn make_channel() -> (ChannelProcessor, Arc<CodeCorrelator>) {
    let correlator = Arc::new(CodeCorrelator::new());
    let proc = ChannelProcessor::new(Channel::File, Arc::clone(&correlator), Arc::new(MacroStack::new()));
    (proc, correlator)
  }

  #[test]
  fn select_requires_no_active_job_running() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    assert_eq!(job.state().phase, Some(Phase::Selected));
  }

  #[test]
  fn start_without_select_is_rejected() {
    let job = JobExecutor::new();
    assert!(job.start().is_err());
  }

  #[test]
  fn pause_then_resume_restores_firmware_reported_offset() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    job.start().unwrap();
    job.pause(Some(412), PauseReason::User).unwrap();
    assert_eq!(job.state().phase, Some(Phase::Paused));
    job.resume().unwrap();
    assert_eq!(job.state().next_file_position, 412);
    assert_eq!(job.state().phase, Some(Phase::Running));
  }

  #[test]
  fn resume_when_not_paused_is_idempotent() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    job.start().unwrap();
    job.resume().unwrap();
    assert_eq!(job.state().phase, Some(Phase::Running));
  }

  #[test]
  fn second_pause_overrides_only_if_offset_is_less_or_equal() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    job.start().unwrap();
    job.pause(Some(500), PauseReason::User).unwrap();
    job.pause(Some(600), PauseReason::FirmwareRequested).unwrap();
    assert_eq!(job.state().pause_position, Some(500));
    job.pause(Some(400), PauseReason::FirmwareRequested).unwrap();
    assert_eq!(job.state().pause_position, Some(400));
  }

  #[test]
  fn set_file_position_is_rejected_while_running() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    job.start().unwrap();
    assert!(job.set_file_position(5).is_err());
  }

  #[test]
  fn set_file_position_succeeds_while_selected() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    job.set_file_position(5).unwrap();
    assert_eq!(job.state().next_file_position, 5);
  }

  #[test]
  fn select_during_cancelling_is_rejected_with_busy() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    job.start().unwrap();
    job.cancel().unwrap();
    {
      let mut state = job.shared.state.lock().unwrap();
      state.phase = Some(Phase::Cancelling);
    }
    assert_eq!(job.select("b.g", 1, false), Err(CoreError::Busy));
  }

  #[test]
  fn cancel_before_run_finishes_immediately_as_cancelled() {
    let job = JobExecutor::new();
    job.select("a.g", 10, false).unwrap();
    job.start().unwrap();
    job.cancel().unwrap();
    let (mut channel_proc, _correlator) = make_channel();
    let codes = vec![Code::simple(Channel::File, CodeKind::G, 1)];
    let mut source = VecCodeSource::new(codes);
    job.run(&mut source, &mut channel_proc).unwrap();
    assert!(job.state().last_file_cancelled);
    assert_eq!(job.state().phase, Some(Phase::Finished));
  }

  #[test]
  fn cancel_during_run_drains_in_flight_codes_and_marks_cancelled() {
    let job = Arc::new(JobExecutor::new());
    job.select("a.g", 10, false).unwrap();
    job.start().unwrap();
    let (mut channel_proc, _correlator) = make_channel();
    let codes: Vec<Code> = (0..20).map(|n| Code::simple(Channel::File, CodeKind::G, n)).collect();
    let mut source = VecCodeSource::new(codes);

    let canceller_job = Arc::clone(&job);
    let canceller = thread::spawn(move || {
      thread::sleep(Duration::from_millis(30));
      canceller_job.cancel().unwrap();
    });

    job.run(&mut source, &mut channel_proc).unwrap();
    canceller.join().unwrap();

    assert!(job.state().last_file_cancelled);
    assert_eq!(job.state().phase, Some(Phase::Finished));
  }

  #[test]
  fn root_and_run_token_independence() {
    let token = CancelToken::root();
    let child = token.child();
    assert!(!child.is_cancelled());
  }
}
