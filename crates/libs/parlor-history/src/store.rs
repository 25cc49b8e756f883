use std::collections::HashSet;

use async_trait::async_trait;
use parlor_message::{HistoryId, MessageRecord};

use crate::error::HistoryStoreError;

/// Outcome of persisting one message of an incremental history batch.
/// The holder uses these to route tracker notifications without diffing
/// the store itself.
#[derive(Debug, Clone)]
pub enum HistoryStoreEvent {
    /// The message was not in the store before. `prev` is the history id
    /// of the immediately older stored message, `None` when the new
    /// message is now the oldest.
    Added { message: MessageRecord, prev: Option<HistoryId> },
    /// A stored message was overwritten with different content.
    Changed { message: MessageRecord },
}

/// Key-ordered local cache of history messages.
///
/// Stored records are keyed by their [`HistoryId`]; ordering is
/// `(timestamp_micros, db_key)`. All page-returning methods yield messages
/// ascending by that key.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The newest `limit` messages, ascending.
    async fn latest(&self, limit: usize) -> Result<Vec<MessageRecord>, HistoryStoreError>;

    /// Up to `limit` messages strictly older than `before`, ascending.
    async fn before(
        &self,
        before: &HistoryId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, HistoryStoreError>;

    /// Every stored message, ascending.
    async fn all(&self) -> Result<Vec<MessageRecord>, HistoryStoreError>;

    /// Upserts a batch, reporting per-message what actually happened.
    /// Messages identical to their stored version produce no event.
    async fn insert_or_update(
        &self,
        messages: &[MessageRecord],
    ) -> Result<Vec<HistoryStoreEvent>, HistoryStoreError>;

    /// Removes messages by history db key, returning the removed records.
    async fn delete(
        &self,
        db_keys: &HashSet<String>,
    ) -> Result<Vec<MessageRecord>, HistoryStoreError>;

    /// Drops the entire cache.
    async fn clear(&self) -> Result<(), HistoryStoreError>;
}
