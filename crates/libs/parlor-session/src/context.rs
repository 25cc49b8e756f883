use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::AccessError;

/// The session's designated execution context.
///
/// All mutating engine operations must run on the thread the session was
/// created on; I/O callbacks are dispatched back onto it (in practice: a
/// current-thread Tokio runtime). A violation is a programming error and
/// surfaces as [`AccessError`], never as a data race resolved internally.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    owner: ThreadId,
    destroyed: AtomicBool,
}

impl SessionContext {
    /// Captures the calling thread as the owner context.
    pub fn capture() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                owner: thread::current().id(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn check_access(&self) -> Result<(), AccessError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(AccessError::Destroyed);
        }
        if thread::current().id() != self.inner.owner {
            return Err(AccessError::WrongContext);
        }
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// One-way, idempotent teardown.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
    }
}
