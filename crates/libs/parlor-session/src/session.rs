use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parlor_history::{
    HistoryMetaStorage, HistoryStore, MemoryHistoryMeta, MemoryHistoryStore,
    RemoteHistoryProvider,
};
use parlor_message::{MessageContent, MessageKind, MessageListener, MessageRecord};

use crate::context::SessionContext;
use crate::error::{AccessError, SessionError};
use crate::holder::{ChatInfo, MessageHolder};
use crate::poller::HistoryPoller;
use crate::tracker::MessageTracker;

/// Tunables for a chat session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between incremental-history polls when the server sends
    /// no revision hints.
    pub poll_interval: Duration,
    /// How many consecutive fully-overlapping history pages a tracker
    /// retries before treating the page request as exhausted.
    pub overlap_retry_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            overlap_retry_cap: 8,
        }
    }
}

/// Builder for [`ChatSession`]. The remote provider is the only required
/// collaborator; storage defaults to in-memory.
pub struct SessionBuilder {
    remote: Arc<dyn RemoteHistoryProvider>,
    store: Option<Arc<dyn HistoryStore>>,
    meta: Option<Arc<dyn HistoryMetaStorage>>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn meta_storage(mut self, meta: Arc<dyn HistoryMetaStorage>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds the session to the calling thread and its current runtime.
    /// Every later call must come from this thread.
    pub fn build(self) -> ChatSession {
        let context = SessionContext::capture();
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryHistoryStore::new()));
        let meta: Arc<dyn HistoryMetaStorage> =
            self.meta.unwrap_or_else(|| Arc::new(MemoryHistoryMeta::new()));
        let holder = MessageHolder::new(
            context.clone(),
            store,
            Arc::clone(&self.remote),
            meta.is_history_ended(),
            self.config.overlap_retry_cap,
        );
        let poller = HistoryPoller::new(
            context.clone(),
            holder.clone(),
            self.remote,
            meta,
            self.config.poll_interval,
        );
        ChatSession {
            context,
            holder,
            poller,
            current_chat: std::cell::RefCell::new(None),
            send_counter: AtomicU64::new(0),
        }
    }
}

/// One live-chat session: the holder, its poller and the message entry
/// points the transport layer feeds. Owned by a single thread; calls from
/// any other thread fail with [`AccessError::WrongContext`].
pub struct ChatSession {
    context: SessionContext,
    holder: MessageHolder,
    poller: HistoryPoller,
    current_chat: std::cell::RefCell<Option<ChatInfo>>,
    send_counter: AtomicU64,
}

impl ChatSession {
    pub fn builder(remote: Arc<dyn RemoteHistoryProvider>) -> SessionBuilder {
        SessionBuilder {
            remote,
            store: None,
            meta: None,
            config: SessionConfig::default(),
        }
    }

    /// Registers a listener and returns the tracker that paginates for it.
    pub async fn new_message_tracker(
        &self,
        listener: Box<dyn MessageListener>,
    ) -> Result<MessageTracker, SessionError> {
        self.holder.new_tracker(listener).await
    }

    /// Optimistically appends a visitor message and returns its record.
    /// The transport acknowledges it later via [`Self::received_message`].
    pub async fn send_message(
        &self,
        text: impl Into<String>,
    ) -> Result<MessageRecord, SessionError> {
        self.context.check_access()?;
        let id = self.next_client_id();
        let message = MessageRecord::outgoing(
            id.as_str(),
            now_micros(),
            MessageContent::text(MessageKind::Visitor, "", text),
        );
        self.holder.sending(message.clone()).await?;
        Ok(message)
    }

    /// Optimistically edits a message. Returns the previous text for
    /// [`Self::revert_edit`] on server failure.
    pub async fn edit_message(
        &self,
        message_id: &str,
        new_text: &str,
    ) -> Result<String, SessionError> {
        self.holder.changing(message_id, new_text).await
    }

    /// Rolls back a failed edit to its previous text.
    pub async fn revert_edit(
        &self,
        message_id: &str,
        previous_text: &str,
    ) -> Result<(), SessionError> {
        self.holder.cancel_changing(message_id, previous_text).await
    }

    /// Withdraws an optimistic message the server never accepted.
    pub async fn cancel_send(&self, message_id: &str) -> Result<(), SessionError> {
        self.holder.sending_cancelled(message_id).await
    }

    /// Full chat snapshot from the delta stream.
    pub async fn receive_chat_snapshot(
        &self,
        chat: Option<ChatInfo>,
        messages: Vec<MessageRecord>,
    ) -> Result<(), SessionError> {
        self.context.check_access()?;
        let previous = self.current_chat.borrow().clone();
        self.holder
            .receiving(chat.as_ref(), previous.as_ref(), messages)
            .await?;
        *self.current_chat.borrow_mut() = chat;
        Ok(())
    }

    /// Single added message from the delta stream.
    pub async fn received_message(&self, message: MessageRecord) -> Result<(), SessionError> {
        self.holder.receive_new_message(message).await
    }

    /// Single edited message from the delta stream.
    pub async fn changed_message(&self, message: MessageRecord) -> Result<(), SessionError> {
        self.holder.receive_changed_message(message).await
    }

    /// Single deleted message from the delta stream, by current-chat id.
    pub async fn deleted_message(&self, current_chat_id: &str) -> Result<(), SessionError> {
        self.holder.receive_deleted_message(current_chat_id).await
    }

    /// Out-of-band incremental history batch, bypassing the poller.
    pub async fn receive_history_update(
        &self,
        messages: Vec<MessageRecord>,
        deleted_db_keys: HashSet<String>,
    ) -> Result<(), SessionError> {
        self.holder.receive_history_update(messages, deleted_db_keys).await
    }

    /// Revision hint pushed by the server; wakes the poller when it is
    /// ahead of the applied revision.
    pub fn history_revision_hint(&self, revision: &str) -> Result<(), AccessError> {
        self.context.check_access()?;
        self.poller.set_has_revision_hint(true);
        self.poller.trigger(revision);
        Ok(())
    }

    /// Resumes history polling (and performs an immediate catch-up poll).
    pub fn resume(&self) -> Result<(), AccessError> {
        self.context.check_access()?;
        self.poller.resume();
        Ok(())
    }

    /// Pauses history polling; the engine keeps serving local state.
    pub fn pause(&self) -> Result<(), AccessError> {
        self.context.check_access()?;
        self.poller.pause();
        Ok(())
    }

    /// Deletes all cached history; every listener gets `removed_all`.
    pub async fn clear_history(&self) -> Result<(), SessionError> {
        self.holder.clear_history().await
    }

    /// Tears the session down. Idempotent. Every subsequent operation on
    /// the session and its trackers fails with a destroyed-object error;
    /// parked page requests unblock with that error too.
    pub async fn destroy(&self) {
        if self.context.is_destroyed() {
            return;
        }
        self.poller.pause();
        self.context.destroy();
        self.holder.abandon_pending_requests().await;
        log::debug!("chat session destroyed");
    }

    fn next_client_id(&self) -> String {
        let n = self.send_counter.fetch_add(1, Ordering::Relaxed);
        format!("client-{}-{n}", now_micros())
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}
