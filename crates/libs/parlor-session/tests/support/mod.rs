//! Shared fixtures: a scripted remote provider and a recording listener.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parlor_history::{
    HistorySinceResponse, RemoteHistoryError, RemoteHistoryPage, RemoteHistoryProvider,
};
use parlor_message::{HistoryId, MessageContent, MessageKind, MessageListener, MessageRecord};

/// A listener event flattened to comparable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Added { id: String, after: Option<String> },
    Changed { id: String, from_text: String, to_text: String },
    Removed { id: String },
    RemovedAll,
}

#[derive(Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event log mutex poisoned").clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().expect("event log mutex poisoned"))
    }
}

impl MessageListener for RecordingListener {
    fn added(&self, message: &MessageRecord, after: Option<&MessageRecord>) {
        self.events.lock().expect("event log mutex poisoned").push(Event::Added {
            id: message.id().as_str().to_owned(),
            after: after.map(|m| m.id().as_str().to_owned()),
        });
    }

    fn changed(&self, from: &MessageRecord, to: &MessageRecord) {
        self.events.lock().expect("event log mutex poisoned").push(Event::Changed {
            id: to.id().as_str().to_owned(),
            from_text: from.text().to_owned(),
            to_text: to.text().to_owned(),
        });
    }

    fn removed(&self, message: &MessageRecord) {
        self.events.lock().expect("event log mutex poisoned").push(Event::Removed {
            id: message.id().as_str().to_owned(),
        });
    }

    fn removed_all(&self) {
        self.events
            .lock()
            .expect("event log mutex poisoned")
            .push(Event::RemovedAll);
    }
}

/// Remote provider with scripted responses, popped in FIFO order. Calls
/// beyond the script return empty end-of-history pages.
#[derive(Default)]
pub struct MockRemote {
    since: Mutex<VecDeque<Result<HistorySinceResponse, RemoteHistoryError>>>,
    before: Mutex<VecDeque<Result<RemoteHistoryPage, RemoteHistoryError>>>,
    since_calls: Mutex<Vec<Option<String>>>,
    before_calls: Mutex<Vec<(i64, usize)>>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue_since(&self, response: Result<HistorySinceResponse, RemoteHistoryError>) {
        self.since.lock().expect("mock mutex poisoned").push_back(response);
    }

    pub fn queue_before(&self, page: Result<RemoteHistoryPage, RemoteHistoryError>) {
        self.before.lock().expect("mock mutex poisoned").push_back(page);
    }

    pub fn since_calls(&self) -> Vec<Option<String>> {
        self.since_calls.lock().expect("mock mutex poisoned").clone()
    }

    pub fn before_calls(&self) -> Vec<(i64, usize)> {
        self.before_calls.lock().expect("mock mutex poisoned").clone()
    }
}

#[async_trait]
impl RemoteHistoryProvider for MockRemote {
    async fn history_since(
        &self,
        revision: Option<&str>,
    ) -> Result<HistorySinceResponse, RemoteHistoryError> {
        self.since_calls
            .lock()
            .expect("mock mutex poisoned")
            .push(revision.map(str::to_owned));
        self.since
            .lock()
            .expect("mock mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(empty_since()))
    }

    async fn history_before(
        &self,
        timestamp_micros: i64,
        limit: usize,
    ) -> Result<RemoteHistoryPage, RemoteHistoryError> {
        self.before_calls
            .lock()
            .expect("mock mutex poisoned")
            .push((timestamp_micros, limit));
        self.before
            .lock()
            .expect("mock mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(RemoteHistoryPage { messages: Vec::new(), has_more: false }))
    }
}

pub fn empty_since() -> HistorySinceResponse {
    HistorySinceResponse {
        messages: Vec::new(),
        deleted_ids: HashSet::new(),
        has_more: false,
        is_initial: false,
        revision: None,
    }
}

pub fn since_batch(messages: Vec<MessageRecord>, revision: &str) -> HistorySinceResponse {
    HistorySinceResponse {
        messages,
        deleted_ids: HashSet::new(),
        has_more: false,
        is_initial: false,
        revision: Some(revision.to_owned()),
    }
}

pub fn history_message(id: &str, db_key: &str, ts: i64, text: &str) -> MessageRecord {
    MessageRecord::history(
        id,
        HistoryId::new(db_key, ts),
        MessageContent::text(MessageKind::Operator, "operator", text),
    )
}

pub fn chat_message(id: &str, current_chat_id: &str, ts: i64, text: &str) -> MessageRecord {
    MessageRecord::current_chat(
        id,
        current_chat_id,
        ts,
        MessageContent::text(MessageKind::Operator, "operator", text),
    )
}

pub fn ids(page: &[MessageRecord]) -> Vec<&str> {
    page.iter().map(|m| m.id().as_str()).collect()
}
