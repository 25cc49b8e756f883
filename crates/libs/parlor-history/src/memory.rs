use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use parlor_message::{HistoryId, MessageRecord};

use crate::error::HistoryStoreError;
use crate::store::{HistoryStore, HistoryStoreEvent};

/// Ordered in-memory history cache. The default store when the caller
/// opted out of on-disk persistence, and the workhorse of the test suite.
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    // Key order is the timeline order: (timestamp_micros, db_key).
    messages: BTreeMap<(i64, String), MessageRecord>,
    by_db_key: HashMap<String, i64>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn history_id_of(message: &MessageRecord) -> Result<HistoryId, HistoryStoreError> {
    message
        .history_id()
        .cloned()
        .ok_or_else(|| HistoryStoreError::MissingHistoryId(message.id().to_string()))
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn latest(&self, limit: usize) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let state = self.inner.lock().expect("memory store mutex poisoned");
        let mut page: Vec<MessageRecord> =
            state.messages.values().rev().take(limit).cloned().collect();
        page.reverse();
        Ok(page)
    }

    async fn before(
        &self,
        before: &HistoryId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let state = self.inner.lock().expect("memory store mutex poisoned");
        let bound = (before.timestamp_micros, before.db_key.clone());
        let mut page: Vec<MessageRecord> = state
            .messages
            .range(..bound)
            .rev()
            .take(limit)
            .map(|(_, message)| message.clone())
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn all(&self) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let state = self.inner.lock().expect("memory store mutex poisoned");
        Ok(state.messages.values().cloned().collect())
    }

    async fn insert_or_update(
        &self,
        messages: &[MessageRecord],
    ) -> Result<Vec<HistoryStoreEvent>, HistoryStoreError> {
        let mut state = self.inner.lock().expect("memory store mutex poisoned");
        let mut events = Vec::new();

        for message in messages {
            let history_id = history_id_of(message)?;
            let key = (history_id.timestamp_micros, history_id.db_key.clone());

            if let Some(&old_ts) = state.by_db_key.get(&history_id.db_key) {
                let old_key = (old_ts, history_id.db_key.clone());
                let stored = state.messages.get(&old_key);
                if stored.is_some_and(|existing| existing.content_eq(message)) {
                    continue;
                }
                state.messages.remove(&old_key);
                state.messages.insert(key, message.clone());
                state.by_db_key.insert(history_id.db_key.clone(), history_id.timestamp_micros);
                events.push(HistoryStoreEvent::Changed { message: message.clone() });
            } else {
                let prev = state
                    .messages
                    .range(..key.clone())
                    .next_back()
                    .map(|((ts, db_key), _)| HistoryId::new(db_key.clone(), *ts));
                state.messages.insert(key, message.clone());
                state.by_db_key.insert(history_id.db_key.clone(), history_id.timestamp_micros);
                events.push(HistoryStoreEvent::Added { message: message.clone(), prev });
            }
        }

        Ok(events)
    }

    async fn delete(
        &self,
        db_keys: &HashSet<String>,
    ) -> Result<Vec<MessageRecord>, HistoryStoreError> {
        let mut state = self.inner.lock().expect("memory store mutex poisoned");
        let mut removed = Vec::new();

        for db_key in db_keys {
            if let Some(ts) = state.by_db_key.remove(db_key) {
                if let Some(message) = state.messages.remove(&(ts, db_key.clone())) {
                    removed.push(message);
                }
            }
        }

        Ok(removed)
    }

    async fn clear(&self) -> Result<(), HistoryStoreError> {
        let mut state = self.inner.lock().expect("memory store mutex poisoned");
        state.messages.clear();
        state.by_db_key.clear();
        Ok(())
    }
}
