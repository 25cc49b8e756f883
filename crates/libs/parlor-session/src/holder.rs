use std::collections::HashSet;
use std::sync::Arc;

use parlor_history::{HistoryStore, HistoryStoreEvent, RemoteHistoryProvider};
use parlor_message::{HistoryId, MessageListener, MessageRecord};
use tokio::sync::Mutex;

use crate::context::SessionContext;
use crate::error::{SessionError, TrackerError};
use crate::tracker::{self, MessageTracker, PendingPage, TrackerSlot};

/// Identity of a chat as reported by the delta stream. Snapshot
/// comparisons only care about which chat a message set belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    pub id: String,
}

impl ChatInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

pub(crate) struct Shared {
    pub(crate) context: SessionContext,
    pub(crate) store: Arc<dyn HistoryStore>,
    pub(crate) remote: Arc<dyn RemoteHistoryProvider>,
    pub(crate) overlap_retry_cap: usize,
    pub(crate) state: Mutex<HolderState>,
}

pub(crate) struct HolderState {
    /// Authoritative live window, ascending by time. May still contain a
    /// tail of the previous chat below `last_chat_index`.
    pub(crate) current_chat: Vec<MessageRecord>,
    pub(crate) last_chat_index: usize,
    /// Locally originated, not yet acknowledged messages.
    pub(crate) to_send: Vec<MessageRecord>,
    pub(crate) reached_end_of_local_history: bool,
    pub(crate) reached_end_of_remote_history: bool,
    pub(crate) trackers: Vec<TrackerSlot>,
    pub(crate) next_tracker_id: u64,
}

pub(crate) fn slot_mut(state: &mut HolderState, id: u64) -> Option<&mut TrackerSlot> {
    state.trackers.iter_mut().find(|slot| slot.id == id)
}

/// Single source of truth for the live chat window. Bridges history
/// responses into the merged timeline and relays events to every
/// registered tracker.
#[derive(Clone)]
pub struct MessageHolder {
    pub(crate) shared: Arc<Shared>,
}

impl MessageHolder {
    pub(crate) fn new(
        context: SessionContext,
        store: Arc<dyn HistoryStore>,
        remote: Arc<dyn RemoteHistoryProvider>,
        reached_end_of_remote_history: bool,
        overlap_retry_cap: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                context,
                store,
                remote,
                overlap_retry_cap,
                state: Mutex::new(HolderState {
                    current_chat: Vec::new(),
                    last_chat_index: 0,
                    to_send: Vec::new(),
                    reached_end_of_local_history: false,
                    reached_end_of_remote_history,
                    trackers: Vec::new(),
                    next_tracker_id: 0,
                }),
            }),
        }
    }

    /// Registers a listener and returns its tracker handle; the handle is
    /// also the unsubscribe handle (`destroy`).
    pub async fn new_tracker(
        &self,
        listener: Box<dyn MessageListener>,
    ) -> Result<MessageTracker, SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        let id = state.next_tracker_id;
        state.next_tracker_id += 1;
        state.trackers.push(TrackerSlot::new(id, listener));
        log::debug!("tracker {id} registered");
        Ok(MessageTracker::new(Arc::clone(&self.shared), id))
    }

    /// Applies a chat snapshot from the delta stream: replaces or augments
    /// the current-chat set, preserving the position of unaffected
    /// messages and fanning out the add/change/remove diff.
    pub async fn receiving(
        &self,
        new_chat: Option<&ChatInfo>,
        previous_chat: Option<&ChatInfo>,
        new_messages: Vec<MessageRecord>,
    ) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        if state.current_chat.is_empty() {
            for message in new_messages {
                added_new_message(&mut state, message);
            }
        } else if new_chat.is_none() {
            historify_current_chat(&mut state);
        } else if previous_chat.is_none() || new_chat != previous_chat {
            historify_current_chat(&mut state);
            for message in new_messages {
                added_new_message(&mut state, message);
            }
        } else {
            merge_current_chat(&mut state, new_messages);
        }
        Ok(())
    }

    /// A single new message from the delta stream.
    pub async fn receive_new_message(&self, message: MessageRecord) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        added_new_message(&mut state, message);
        Ok(())
    }

    /// A delta-stream edit of a live message, matched by current-chat id.
    pub async fn receive_changed_message(
        &self,
        message: MessageRecord,
    ) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        let start = state.last_chat_index;
        let found = state.current_chat[start..]
            .iter()
            .position(|m| m.current_chat_id() == message.current_chat_id())
            .map(|offset| offset + start);
        if let Some(index) = found {
            let previous = state.current_chat[index].clone();
            state.current_chat[index] = message.clone();
            notify_changed_current_chat(&mut state, &previous, &message, index);
        } else {
            log::debug!("change for unknown current-chat message {:?} dropped", message.id());
        }
        Ok(())
    }

    /// A delta-stream deletion of a live message.
    pub async fn receive_deleted_message(
        &self,
        current_chat_id: &str,
    ) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        let start = state.last_chat_index;
        let found = state.current_chat[start..]
            .iter()
            .position(|m| m.current_chat_id() == Some(current_chat_id))
            .map(|offset| offset + start);
        if let Some(index) = found {
            let removed = state.current_chat.remove(index);
            notify_deleted_current_chat(&mut state, &removed, index);
        }
        Ok(())
    }

    /// Applies a server incremental-history batch. Returns only after the
    /// batch is durably persisted; the poller advances its revision
    /// strictly after that.
    pub async fn receive_history_update(
        &self,
        messages: Vec<MessageRecord>,
        deleted_db_keys: HashSet<String>,
    ) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let events = self.shared.store.insert_or_update(&messages).await?;
        let removed = self.shared.store.delete(&deleted_db_keys).await?;

        let pending = {
            let mut state = self.shared.state.lock().await;
            for message in &removed {
                notify_deleted_history(&mut state, message);
            }
            for event in events {
                match event {
                    HistoryStoreEvent::Added { message, prev } => {
                        if !try_merge_with_last_chat(&mut state, &message) {
                            notify_added_history(&mut state, &message, prev.as_ref());
                        }
                    }
                    HistoryStoreEvent::Changed { message } => {
                        notify_changed_history(&mut state, &message);
                    }
                }
            }
            end_history_batch(&mut state)
        };

        // Bootstrap pages parked before the first batch can resolve now.
        for (tracker_id, request) in pending {
            let result =
                tracker::run_page_request(&self.shared, tracker_id, request.limit).await;
            let _ = request.respond.send(result);
        }
        Ok(())
    }

    /// Appends an optimistic message; visible to listeners immediately.
    pub async fn sending(&self, message: MessageRecord) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        let after = state.current_chat.last().cloned();
        state.to_send.push(message.clone());
        state.current_chat.push(message.clone());
        for slot in &state.trackers {
            slot.listener.added(&message, after.as_ref());
        }
        Ok(())
    }

    /// Removes a not-yet-acknowledged optimistic message.
    pub async fn sending_cancelled(&self, message_id: &str) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        let Some(position) = state.to_send.iter().position(|m| m.id().as_str() == message_id)
        else {
            return Err(SessionError::UnknownMessage(message_id.to_owned()));
        };
        let message = state.to_send.remove(position);
        if let Some(chat_position) =
            state.current_chat.iter().position(|m| m.id().as_str() == message_id)
        {
            state.current_chat.remove(chat_position);
            // A pending send surviving a chat close sits below the
            // previous-chat boundary; keep the boundary in step.
            if chat_position < state.last_chat_index {
                state.last_chat_index -= 1;
            }
        }
        for slot in &state.trackers {
            slot.listener.removed(&message);
        }
        Ok(())
    }

    /// In-place optimistic edit. Returns the previous text so a failed
    /// server round-trip can roll back via [`Self::cancel_changing`].
    pub async fn changing(
        &self,
        message_id: &str,
        new_text: &str,
    ) -> Result<String, SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;

        if let Some(position) = state.to_send.iter().position(|m| m.id().as_str() == message_id)
        {
            let previous = state.to_send[position].clone();
            state.to_send[position].set_text(new_text);
            let updated = state.to_send[position].clone();
            if let Some(chat_position) =
                state.current_chat.iter().position(|m| m.id().as_str() == message_id)
            {
                state.current_chat[chat_position] = updated.clone();
            }
            for slot in &state.trackers {
                slot.listener.changed(&previous, &updated);
            }
            return Ok(previous.text().to_owned());
        }

        let start = state.last_chat_index;
        let found = state.current_chat[start..]
            .iter()
            .position(|m| m.id().as_str() == message_id)
            .map(|offset| offset + start);
        let Some(index) = found else {
            return Err(SessionError::UnknownMessage(message_id.to_owned()));
        };
        let previous = state.current_chat[index].clone();
        state.current_chat[index].set_text(new_text);
        let updated = state.current_chat[index].clone();
        notify_changed_current_chat(&mut state, &previous, &updated, index);
        Ok(previous.text().to_owned())
    }

    /// Rolls an optimistic edit back to its pre-edit text, emitting a
    /// corrective `changed` event.
    pub async fn cancel_changing(
        &self,
        message_id: &str,
        previous_text: &str,
    ) -> Result<(), SessionError> {
        self.changing(message_id, previous_text).await.map(|_| ())
    }

    /// Wipes the local cache and the live window; trackers start over.
    pub async fn clear_history(&self) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        self.shared.store.clear().await?;
        let mut state = self.shared.state.lock().await;
        state.current_chat.clear();
        state.to_send.clear();
        state.last_chat_index = 0;
        state.reached_end_of_local_history = false;
        for slot in &mut state.trackers {
            slot.head = None;
            slot.id_to_history.clear();
            slot.all_sources_ended = false;
            slot.first_history_update_received = false;
            slot.listener.removed_all();
        }
        Ok(())
    }

    /// Remote history is fully drained. Monotonic.
    pub(crate) async fn set_end_of_remote_history(&self) -> Result<(), SessionError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        state.reached_end_of_remote_history = true;
        Ok(())
    }

    /// Drops parked page requests so their callers unblock with a
    /// destroyed-object error. Part of session teardown.
    pub(crate) async fn abandon_pending_requests(&self) {
        let mut state = self.shared.state.lock().await;
        for slot in &mut state.trackers {
            slot.pending.take();
            slot.loading = false;
        }
    }
}

// Pagination primitives, consumed by the tracker's page loop.
impl Shared {
    /// The newest `limit` messages: the current-chat tail when the live
    /// window is non-empty, otherwise the newest stored history page.
    pub(crate) async fn latest_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TrackerError> {
        let live_tail = {
            let state = self.state.lock().await;
            if state.current_chat.is_empty() {
                None
            } else {
                let start = state.current_chat.len().saturating_sub(limit);
                Some(state.current_chat[start..].to_vec())
            }
        };
        match live_tail {
            Some(page) => Ok(page),
            None => Ok(self.store.latest(limit).await?),
        }
    }

    /// Messages strictly older than `before`, choosing the source the way
    /// the record's identity dictates.
    pub(crate) async fn page_before(
        &self,
        before: &MessageRecord,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TrackerError> {
        enum Plan {
            Slice(Vec<MessageRecord>),
            LatestStore,
            HistoryBefore(HistoryId),
            Empty,
        }

        let plan = if before.is_current_chat() {
            let state = self.state.lock().await;
            if state.current_chat.is_empty() {
                log::warn!("current chat is empty; request for older messages rejected");
                Plan::Empty
            } else if state.current_chat.first().map(|m| m.id()) == Some(before.id()) {
                match before.history_id() {
                    // No history component yet: anything older lives in
                    // the (not yet linked) history cache.
                    None => Plan::LatestStore,
                    Some(id) => Plan::HistoryBefore(id.clone()),
                }
            } else if let Some(index) =
                state.current_chat.iter().position(|m| m.id() == before.id())
            {
                let start = index.saturating_sub(limit);
                Plan::Slice(state.current_chat[start..index].to_vec())
            } else {
                Plan::Empty
            }
        } else {
            match before.history_id() {
                Some(id) => Plan::HistoryBefore(id.clone()),
                None => Plan::Empty,
            }
        };

        match plan {
            Plan::Slice(page) => Ok(page),
            Plan::LatestStore => Ok(self.store.latest(limit).await?),
            Plan::HistoryBefore(id) => self.history_before(&id, limit).await,
            Plan::Empty => Ok(Vec::new()),
        }
    }

    /// Local cache first; once that is exhausted, backfill from the
    /// remote provider until it reports the end of history.
    async fn history_before(
        &self,
        id: &HistoryId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TrackerError> {
        let local_ended = self.state.lock().await.reached_end_of_local_history;
        if !local_ended {
            let page = self.store.before(id, limit).await?;
            if !page.is_empty() {
                return Ok(page);
            }
            self.state.lock().await.reached_end_of_local_history = true;
        }
        if self.state.lock().await.reached_end_of_remote_history {
            return Ok(Vec::new());
        }

        let page = self.remote.history_before(id.timestamp_micros, limit).await?;
        if !page.has_more {
            self.state.lock().await.reached_end_of_remote_history = true;
        }
        if !page.messages.is_empty() {
            self.store.insert_or_update(&page.messages).await?;
        }
        let mut messages = page.messages;
        if messages.len() > limit {
            messages = messages.split_off(messages.len() - limit);
        }
        Ok(messages)
    }
}

fn added_new_message(state: &mut HolderState, mut message: MessageRecord) {
    // Server echo of an optimistic send: same identity, `changed` not
    // `added` + `removed`.
    if let Some(position) = state.to_send.iter().position(|m| m.id() == message.id()) {
        let optimistic = state.to_send.remove(position);
        if let Some(chat_position) =
            state.current_chat.iter().position(|m| m.id() == message.id())
        {
            state.current_chat[chat_position] = message.clone();
        } else {
            state.current_chat.push(message.clone());
        }
        for slot in &state.trackers {
            slot.listener.changed(&optimistic, &message);
        }
        return;
    }

    // A history twin some tracker already surfaced turns this into a
    // merge rather than a fresh add.
    let twin_history_id = state
        .trackers
        .iter()
        .flat_map(|slot| slot.id_to_history.values())
        .find(|twin| twin.id() == message.id())
        .and_then(|twin| twin.history_id().cloned());
    if let Some(history_id) = twin_history_id {
        let _ = message.attach_history(history_id);
    }

    let after = state.current_chat.last().cloned();
    state.current_chat.push(message.clone());

    for slot in &mut state.trackers {
        if slot.head.is_none() {
            if slot.all_sources_ended {
                // First live message of an exhausted timeline becomes the
                // tracker's head.
                slot.head = Some(message.clone());
            } else {
                // Not paginated yet: buffered silently.
                continue;
            }
        } else if slot
            .head
            .as_ref()
            .is_some_and(|head| head.timestamp_micros() > message.timestamp_micros())
        {
            // Older than this tracker's window: kept, not announced.
            continue;
        }

        let twin_key = slot
            .id_to_history
            .iter()
            .find(|(_, twin)| twin.id() == message.id())
            .map(|(key, _)| key.clone());
        if let Some(key) = twin_key {
            if let Some(twin) = slot.id_to_history.remove(&key) {
                if !twin.content_eq(&message) {
                    slot.listener.changed(&twin, &message);
                }
            }
            continue;
        }
        slot.listener.added(&message, after.as_ref());
    }
}

/// The live chat closed or was replaced: messages that already have a
/// history component flip primary to history and leave the live window.
fn historify_current_chat(state: &mut HolderState) {
    let drained: Vec<MessageRecord> = state.current_chat.drain(..).collect();
    let mut remaining = Vec::new();

    for mut message in drained {
        if message.has_history_component() {
            let _ = message.promote_to_history();
            let Some(db_key) = message.history_id().map(|id| id.db_key.clone()) else {
                continue;
            };
            for slot in &mut state.trackers {
                let Some(twin) = slot.id_to_history.get(&db_key).cloned() else {
                    continue;
                };
                if twin.content_eq(&message) {
                    slot.id_to_history.insert(db_key.clone(), message.clone());
                } else {
                    // The stored history copy is authoritative now.
                    slot.listener.changed(&message, &twin);
                }
            }
        } else {
            remaining.push(message);
        }
    }

    state.current_chat = remaining;
    state.last_chat_index = state.current_chat.len();
}

/// Stable-order diff of the live window against a fresh snapshot of the
/// same chat.
fn merge_current_chat(state: &mut HolderState, new_messages: Vec<MessageRecord>) {
    let mut previous_index = state.last_chat_index;
    let mut old_exhausted = false;

    for new_message in new_messages {
        let mut handled = false;
        if !old_exhausted {
            while previous_index < state.current_chat.len() {
                let previous = state.current_chat[previous_index].clone();
                if previous.id() == new_message.id() {
                    if !previous.content_eq(&new_message) {
                        state.current_chat[previous_index] = new_message.clone();
                        notify_changed_current_chat(
                            state,
                            &previous,
                            &new_message,
                            previous_index,
                        );
                    }
                    handled = true;
                    previous_index += 1;
                    break;
                }
                state.current_chat.remove(previous_index);
                notify_deleted_current_chat(state, &previous, previous_index);
            }
            if !handled && previous_index >= state.current_chat.len() {
                old_exhausted = true;
            }
        }
        if old_exhausted && !handled {
            added_new_message(state, new_message);
        }
    }
}

/// A history message matched a message still sitting in the live window.
/// Returns true when the add was absorbed as a merge.
fn try_merge_with_last_chat(state: &mut HolderState, message: &MessageRecord) -> bool {
    let Some(history_id) = message.history_id().cloned() else {
        return false;
    };
    let Some(index) = state.current_chat.iter().position(|m| m.id() == message.id()) else {
        return false;
    };

    if index < state.last_chat_index {
        // Previous-chat leftover: the history copy takes over entirely.
        let live = state.current_chat.remove(index);
        state.last_chat_index -= 1;
        let mut replacement = message.clone();
        if let Some(current_chat_id) = live.current_chat_id().map(str::to_owned) {
            let _ = replacement.attach_current_chat(current_chat_id);
        }
        for slot in &mut state.trackers {
            if slot.head.is_none() && !slot.all_sources_ended {
                continue;
            }
            slot.id_to_history.insert(history_id.db_key.clone(), replacement.clone());
            if !live.content_eq(&replacement) {
                slot.listener.changed(&live, &replacement);
            }
        }
    } else {
        // Live message gains its secondary history reference; the live
        // copy stays authoritative.
        let live = &mut state.current_chat[index];
        if !live.has_history_component() {
            let _ = live.attach_history(history_id.clone());
        }
        for slot in &mut state.trackers {
            slot.id_to_history.insert(history_id.db_key.clone(), message.clone());
        }
    }
    true
}

fn notify_changed_current_chat(
    state: &mut HolderState,
    previous: &MessageRecord,
    new: &MessageRecord,
    index: usize,
) {
    let HolderState { current_chat, trackers, .. } = state;
    for slot in trackers.iter_mut() {
        let Some(head) = slot.head.clone() else {
            continue;
        };
        if head.is_history() {
            if head.id() == previous.id() {
                slot.head = Some(new.clone());
            }
            slot.listener.changed(previous, new);
        } else if let Some(head_index) =
            current_chat.iter().position(|m| m.id() == head.id())
        {
            if index >= head_index {
                if head.id() == previous.id() {
                    slot.head = Some(new.clone());
                }
                slot.listener.changed(previous, new);
            }
        }
    }
}

fn notify_deleted_current_chat(state: &mut HolderState, removed: &MessageRecord, index: usize) {
    let HolderState { current_chat, trackers, .. } = state;
    for slot in trackers.iter_mut() {
        let Some(head) = slot.head.clone() else {
            continue;
        };
        let head_index = current_chat.iter().position(|m| m.id() == head.id());
        let in_window = head.is_history()
            || head.id() == removed.id()
            || head_index.is_some_and(|head_index| index >= head_index);
        if !in_window {
            continue;
        }
        if head.id() == removed.id() {
            if let Some(next) = current_chat.get(index) {
                slot.head = Some(next.clone());
            }
        }
        slot.listener.removed(removed);
    }
}

fn notify_deleted_history(state: &mut HolderState, message: &MessageRecord) {
    let Some(db_key) = message.history_id().map(|id| id.db_key.clone()) else {
        return;
    };
    for slot in &mut state.trackers {
        let Some(known) = slot.id_to_history.remove(&db_key) else {
            continue;
        };
        let surfaced = slot.head.as_ref().is_some_and(|head| {
            head.is_history() && known.timestamp_micros() >= head.timestamp_micros()
        });
        if surfaced {
            slot.listener.removed(&known);
        }
    }
}

fn notify_changed_history(state: &mut HolderState, message: &MessageRecord) {
    let Some(db_key) = message.history_id().map(|id| id.db_key.clone()) else {
        return;
    };
    for slot in &mut state.trackers {
        let in_window = slot.head.as_ref().is_some_and(|head| {
            head.is_history() && message.timestamp_micros() >= head.timestamp_micros()
        });
        if !in_window {
            continue;
        }
        match slot.id_to_history.insert(db_key.clone(), message.clone()) {
            Some(previous) => slot.listener.changed(&previous, message),
            None => log::debug!("change for unsurfaced history message {:?}", message.id()),
        }
    }
}

fn notify_added_history(
    state: &mut HolderState,
    message: &MessageRecord,
    prev: Option<&HistoryId>,
) {
    let Some(db_key) = message.history_id().map(|id| id.db_key.clone()) else {
        return;
    };
    for slot in &mut state.trackers {
        let in_window = slot.head.as_ref().is_some_and(|head| {
            head.is_history() && message.timestamp_micros() >= head.timestamp_micros()
        });
        if !in_window {
            continue;
        }
        slot.id_to_history.insert(db_key.clone(), message.clone());
        let after = prev.and_then(|prev| slot.id_to_history.get(&prev.db_key).cloned());
        slot.listener.added(message, after.as_ref());
    }
}

/// Marks the end of one applied history batch and collects parked
/// bootstrap page requests, now resolvable.
fn end_history_batch(state: &mut HolderState) -> Vec<(u64, PendingPage)> {
    let mut pending = Vec::new();
    for slot in &mut state.trackers {
        if !slot.first_history_update_received {
            slot.first_history_update_received = true;
        }
        if let Some(request) = slot.pending.take() {
            pending.push((slot.id, request));
        }
    }
    pending
}
