//! # CANCELLATION TOKEN HIERARCHY
//!
//! Per §9's design note: every long-running operation accepts a
//! cancellation handle derived from a process-wide root, and the Job
//! Executor owns a child recycled on every pause transition so that
//! cancelling the run-in-progress child never reaches the Transfer Engine
//! or any other channel's in-flight codes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
  cancelled: AtomicBool,
  parent: Option<CancelToken>,
}

/// A cheaply cloneable cancellation flag, optionally chained to a parent.
/// `is_cancelled` is true if this token or any ancestor has been cancelled.
#[derive(Clone)]
pub struct CancelToken {
  inner: Arc<Inner>,
}

impl CancelToken {
  pub fn root() -> Self {
    Self {
      inner: Arc::new(Inner {
        cancelled: AtomicBool::new(false),
        parent: None,
      }),
    }
  }

  /// Derives a child token. Cancelling the child never cancels `self`;
  /// cancelling `self` (or any of its ancestors) is observed by the child.
  pub fn child(&self) -> Self {
    Self {
      inner: Arc::new(Inner {
        cancelled: AtomicBool::new(false),
        parent: Some(self.clone()),
      }),
    }
  }

  pub fn cancel(&self) {
    self.inner.cancelled.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::Acquire) || self.inner.parent.as_ref().is_some_and(CancelToken::is_cancelled)
  }
}

impl std::fmt::Debug for CancelToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CancelToken").field("cancelled", &self.is_cancelled()).finish()
  }
}
