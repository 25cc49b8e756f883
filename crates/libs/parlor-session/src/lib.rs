//! Session layer of the parlor live-chat SDK.
//!
//! A [`ChatSession`] merges two message sources into one timeline: the
//! live current chat pushed by the delta stream, and persisted history
//! pulled incrementally by a [`HistoryPoller`]. Consumers observe the
//! timeline through [`MessageTracker`] cursors, which paginate from
//! newest to oldest and relay added/changed/removed events to their
//! listener.
//!
//! A session is owned by the thread that built it. Calls from any other
//! thread fail with [`AccessError::WrongContext`] instead of racing.

mod context;
mod error;
mod holder;
mod poller;
mod session;
mod tracker;

pub use context::SessionContext;
pub use error::{AccessError, SessionError, TrackerError};
pub use holder::{ChatInfo, MessageHolder};
pub use poller::HistoryPoller;
pub use session::{ChatSession, SessionBuilder, SessionConfig};
pub use tracker::MessageTracker;
