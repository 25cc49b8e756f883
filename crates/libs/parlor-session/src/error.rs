use parlor_history::{HistoryStoreError, RemoteHistoryError};
use thiserror::Error;

/// Access violations: wrong execution context or a torn-down session.
/// Always synchronous, never retried internally.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    #[error("operation invoked outside the session's owner thread")]
    WrongContext,

    #[error("session has been destroyed")]
    Destroyed,
}

/// Errors surfaced by [`MessageTracker`](crate::MessageTracker) operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("message tracker has been destroyed")]
    Destroyed,

    #[error("a page request is already in flight for this tracker")]
    RepeatedRequest,

    #[error("message page limit must be greater than zero")]
    InvalidLimit,

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("history store: {0}")]
    Store(#[from] HistoryStoreError),

    #[error("remote history: {0}")]
    Remote(#[from] RemoteHistoryError),
}

/// Errors surfaced by session and holder operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("history store: {0}")]
    Store(#[from] HistoryStoreError),

    #[error("remote history: {0}")]
    Remote(#[from] RemoteHistoryError),

    #[error("no message with id '{0}'")]
    UnknownMessage(String),
}
