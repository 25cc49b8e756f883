use std::collections::HashMap;
use std::sync::Arc;

use parlor_message::{MessageListener, MessageRecord};
use tokio::sync::oneshot;

use crate::error::TrackerError;
use crate::holder::{slot_mut, Shared};

/// A page request parked until the first history batch is applied.
pub(crate) struct PendingPage {
    pub(crate) limit: usize,
    pub(crate) respond: oneshot::Sender<Result<Vec<MessageRecord>, TrackerError>>,
}

/// Per-tracker state, owned by the holder so every mutation happens under
/// the one engine lock.
pub(crate) struct TrackerSlot {
    pub(crate) id: u64,
    pub(crate) listener: Box<dyn MessageListener>,
    /// Oldest message this tracker has surfaced. `None` until the first
    /// page resolves.
    pub(crate) head: Option<MessageRecord>,
    /// History messages surfaced through this tracker, keyed by db key.
    pub(crate) id_to_history: HashMap<String, MessageRecord>,
    pub(crate) all_sources_ended: bool,
    pub(crate) loading: bool,
    pub(crate) first_history_update_received: bool,
    pub(crate) pending: Option<PendingPage>,
}

impl TrackerSlot {
    pub(crate) fn new(id: u64, listener: Box<dyn MessageListener>) -> Self {
        Self {
            id,
            listener,
            head: None,
            id_to_history: HashMap::new(),
            all_sources_ended: false,
            loading: false,
            first_history_update_received: false,
            pending: None,
        }
    }
}

/// Cursor over the merged timeline, paginating from newest to oldest.
/// Obtained from the session together with a listener; `destroy`
/// unsubscribes.
pub struct MessageTracker {
    shared: Arc<Shared>,
    id: u64,
}

impl MessageTracker {
    pub(crate) fn new(shared: Arc<Shared>, id: u64) -> Self {
        Self { shared, id }
    }

    /// The next page of up to `limit` messages, older than everything
    /// returned so far, ascending by time. An empty page means every
    /// source is exhausted; further calls keep returning empty pages.
    pub async fn get_next_messages(
        &self,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, TrackerError> {
        self.shared.context.check_access()?;
        if limit == 0 {
            return Err(TrackerError::InvalidLimit);
        }

        let bootstrap = {
            let mut state = self.shared.state.lock().await;
            let chat_first_id =
                state.current_chat.first().map(|m| m.id().clone());
            let slot = slot_mut(&mut state, self.id).ok_or(TrackerError::Destroyed)?;
            if slot.loading {
                return Err(TrackerError::RepeatedRequest);
            }
            if slot.all_sources_ended {
                return Ok(Vec::new());
            }
            slot.loading = true;
            let head_id = slot.head.as_ref().map(|m| m.id().clone());
            let chat_extends_window =
                chat_first_id.is_some() && chat_first_id != head_id;
            !slot.first_history_update_received && !chat_extends_window
        };

        if !bootstrap {
            return run_page_request(&self.shared, self.id, limit).await;
        }

        // Cold start: serve straight from the cache, or park until the
        // first history batch lands.
        let cached = match self.shared.store.latest(limit).await {
            Ok(cached) => cached,
            Err(err) => {
                reset_loading(&self.shared, self.id).await;
                return Err(err.into());
            }
        };
        if cached.is_empty() {
            // The first batch may have landed while the cache read held no
            // lock; parking then would never be woken.
            let receiver = {
                let mut state = self.shared.state.lock().await;
                let slot =
                    slot_mut(&mut state, self.id).ok_or(TrackerError::Destroyed)?;
                if slot.first_history_update_received {
                    None
                } else {
                    let (sender, receiver) = oneshot::channel();
                    slot.pending = Some(PendingPage { limit, respond: sender });
                    Some(receiver)
                }
            };
            let Some(receiver) = receiver else {
                return run_page_request(&self.shared, self.id, limit).await;
            };
            log::debug!("tracker {}: cache empty, waiting for first history batch", self.id);
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(TrackerError::Destroyed),
            }
        } else {
            {
                let mut state = self.shared.state.lock().await;
                let slot =
                    slot_mut(&mut state, self.id).ok_or(TrackerError::Destroyed)?;
                slot.first_history_update_received = true;
            }
            match apply_batch(&self.shared, self.id, cached).await? {
                BatchOutcome::Page(page) => Ok(page),
                // A cached page cannot overlap an empty live window; an
                // overlap here still terminates cleanly.
                BatchOutcome::FullyOverlapping(_) => {
                    reset_loading(&self.shared, self.id).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Every cached history message, ascending, ignoring the pagination
    /// cursor.
    pub async fn get_all_messages(&self) -> Result<Vec<MessageRecord>, TrackerError> {
        self.shared.context.check_access()?;
        {
            let mut state = self.shared.state.lock().await;
            slot_mut(&mut state, self.id).ok_or(TrackerError::Destroyed)?;
        }
        Ok(self.shared.store.all().await?)
    }

    /// Rewinds the cursor to `message`, forgetting everything surfaced
    /// before it. The next page continues from there.
    pub async fn reset_to(&self, message: &MessageRecord) -> Result<(), TrackerError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        let same_head = {
            let slot = slot_mut(&mut state, self.id).ok_or(TrackerError::Destroyed)?;
            if slot.loading {
                return Err(TrackerError::RepeatedRequest);
            }
            slot.head.as_ref().is_some_and(|head| head.id() == message.id())
        };
        if !same_head {
            state.reached_end_of_local_history = false;
        }
        let slot = slot_mut(&mut state, self.id).ok_or(TrackerError::Destroyed)?;
        if message.is_history() {
            let cutoff = message.timestamp_micros();
            slot.id_to_history.retain(|_, m| m.timestamp_micros() >= cutoff);
        } else {
            slot.id_to_history.clear();
        }
        slot.head = Some(message.clone());
        slot.all_sources_ended = false;
        Ok(())
    }

    /// Unregisters the listener. Idempotent. Any parked page request
    /// resolves with a destroyed-object error.
    pub async fn destroy(&self) -> Result<(), TrackerError> {
        self.shared.context.check_access()?;
        let mut state = self.shared.state.lock().await;
        if let Some(position) = state.trackers.iter().position(|slot| slot.id == self.id) {
            state.trackers.remove(position);
            log::debug!("tracker {} destroyed", self.id);
        }
        Ok(())
    }
}

enum BatchOutcome {
    Page(Vec<MessageRecord>),
    /// Every message of the raw page merged into the live window; retry
    /// from the page's oldest message.
    FullyOverlapping(MessageRecord),
}

/// Fetch-and-apply loop for one page request. Pages that fully dissolve
/// into the live window are retried further back, up to a cap.
pub(crate) async fn run_page_request(
    shared: &Arc<Shared>,
    id: u64,
    limit: usize,
) -> Result<Vec<MessageRecord>, TrackerError> {
    let mut before_override: Option<MessageRecord> = None;

    for attempt in 0..=shared.overlap_retry_cap {
        let target = {
            let mut state = shared.state.lock().await;
            let slot = slot_mut(&mut state, id).ok_or(TrackerError::Destroyed)?;
            before_override.clone().or_else(|| slot.head.clone())
        };
        let raw = match &target {
            None => shared.latest_messages(limit).await,
            Some(before) => shared.page_before(before, limit).await,
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                reset_loading(shared, id).await;
                return Err(err);
            }
        };
        match apply_batch(shared, id, raw).await? {
            BatchOutcome::Page(page) => return Ok(page),
            BatchOutcome::FullyOverlapping(oldest) => {
                if attempt == shared.overlap_retry_cap {
                    log::warn!(
                        "tracker {id}: {attempt} consecutive history pages merged \
                         entirely into the current chat; giving up"
                    );
                    reset_loading(shared, id).await;
                    return Ok(Vec::new());
                }
                before_override = Some(oldest);
            }
        }
    }
    Ok(Vec::new())
}

/// Reconciles one raw page with the live window under the engine lock and
/// advances the tracker's head.
async fn apply_batch(
    shared: &Arc<Shared>,
    id: u64,
    raw: Vec<MessageRecord>,
) -> Result<BatchOutcome, TrackerError> {
    let mut state = shared.state.lock().await;
    let crate::holder::HolderState { current_chat, trackers, .. } = &mut *state;
    let slot = trackers
        .iter_mut()
        .find(|slot| slot.id == id)
        .ok_or(TrackerError::Destroyed)?;

    if raw.is_empty() {
        slot.all_sources_ended = true;
        slot.loading = false;
        log::debug!("tracker {id}: all message sources ended");
        return Ok(BatchOutcome::Page(Vec::new()));
    }

    // Route future history events for everything in this page.
    for message in &raw {
        if let Some(history_id) = message.history_id() {
            slot.id_to_history.insert(history_id.db_key.clone(), message.clone());
        }
    }

    let chat_first_ts = current_chat.first().map(|m| m.timestamp_micros());
    let chat_last_ts = current_chat.last().map(|m| m.timestamp_micros());
    let raw_last_ts = raw.last().map(|m| m.timestamp_micros());

    let overlaps = match (chat_first_ts, raw_last_ts) {
        (Some(chat_first), Some(raw_last)) => raw_last >= chat_first,
        _ => false,
    };

    let page = if overlaps {
        let (chat_first, chat_last) = match (chat_first_ts, chat_last_ts) {
            (Some(first), Some(last)) => (first, last),
            _ => unreachable!("overlap implies a non-empty current chat"),
        };
        let oldest = raw[0].clone();
        let mut page = Vec::with_capacity(raw.len());
        for message in raw {
            let ts = message.timestamp_micros();
            let live = if message.is_history() && ts >= chat_first && ts <= chat_last {
                current_chat.iter_mut().find(|m| m.id() == message.id())
            } else {
                None
            };
            match live {
                Some(live) => {
                    // Same message, two sources: link them and keep the
                    // live copy.
                    if !live.has_history_component() {
                        if let Some(history_id) = message.history_id().cloned() {
                            let _ = live.attach_history(history_id);
                        }
                    }
                    if !live.content_eq(&message) {
                        slot.listener.changed(&message, live);
                    }
                }
                None => page.push(message),
            }
        }
        if page.is_empty() {
            // Caller retries further back; loading stays held.
            return Ok(BatchOutcome::FullyOverlapping(oldest));
        }
        page
    } else {
        raw
    };

    if let Some(first) = page.first() {
        let advance = slot
            .head
            .as_ref()
            .map_or(true, |head| first.timestamp_micros() < head.timestamp_micros());
        if advance {
            slot.head = Some(first.clone());
        }
    }
    slot.loading = false;
    Ok(BatchOutcome::Page(page))
}

async fn reset_loading(shared: &Arc<Shared>, id: u64) {
    let mut state = shared.state.lock().await;
    if let Some(slot) = slot_mut(&mut state, id) {
        slot.loading = false;
    }
}
