//! History-side collaborators for the parlor live-chat SDK.
//!
//! The merge engine in `parlor-session` only ever talks to the narrow
//! seams defined here: a key-ordered [`HistoryStore`] for the local cache,
//! a [`RemoteHistoryProvider`] for server pages, and a
//! [`HistoryMetaStorage`] for the revision cursor. Two store
//! implementations ship with the crate: an in-memory ordered map and a
//! rusqlite-backed store mirroring the service's on-device cache.

mod error;
mod memory;
mod meta;
mod remote;
mod sqlite;
mod store;

pub use error::{HistoryStoreError, RemoteHistoryError};
pub use memory::MemoryHistoryStore;
pub use meta::{HistoryMetaStorage, MemoryHistoryMeta};
pub use remote::{HistorySinceResponse, RemoteHistoryPage, RemoteHistoryProvider};
pub use sqlite::SqliteHistoryStore;
pub use store::{HistoryStore, HistoryStoreEvent};
