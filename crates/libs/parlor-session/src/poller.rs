use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use parlor_history::{HistoryMetaStorage, RemoteHistoryProvider};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::context::SessionContext;
use crate::error::SessionError;
use crate::holder::MessageHolder;

/// Periodically pulls incremental history and feeds it to the holder.
///
/// The stored revision only advances after a batch has been durably
/// applied, so a crash between fetch and apply replays the batch instead
/// of losing it.
pub struct HistoryPoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    context: SessionContext,
    holder: MessageHolder,
    remote: Arc<dyn RemoteHistoryProvider>,
    meta: Arc<dyn HistoryMetaStorage>,
    interval: Duration,
    wakeup: Notify,
    state: StdMutex<PollerState>,
}

struct PollerState {
    running: bool,
    task: Option<JoinHandle<()>>,
    last_revision: Option<String>,
    last_poll: Option<Instant>,
    /// When the server pushes revision hints, interval polling is
    /// redundant and the loop waits for triggers only.
    has_revision_hint: bool,
}

enum PollOutcome {
    Idle,
    /// More pages queued server-side; poll again without waiting.
    Backlog,
}

impl HistoryPoller {
    pub(crate) fn new(
        context: SessionContext,
        holder: MessageHolder,
        remote: Arc<dyn RemoteHistoryProvider>,
        meta: Arc<dyn HistoryMetaStorage>,
        interval: Duration,
    ) -> Self {
        let last_revision = meta.revision();
        Self {
            inner: Arc::new(PollerInner {
                context,
                holder,
                remote,
                meta,
                interval,
                wakeup: Notify::new(),
                state: StdMutex::new(PollerState {
                    running: false,
                    task: None,
                    last_revision,
                    last_poll: None,
                    has_revision_hint: false,
                }),
            }),
        }
    }

    /// Starts (or restarts) the polling loop. Idempotent.
    pub fn resume(&self) {
        let mut state = self.inner.state.lock().expect("poller state mutex poisoned");
        if state.running {
            return;
        }
        state.running = true;
        let inner = Arc::clone(&self.inner);
        // The loop polls immediately when no poll has happened yet and
        // otherwise picks up where the pre-pause schedule left off.
        state.task = Some(tokio::spawn(async move {
            run_loop(inner).await;
        }));
    }

    /// Stops the polling loop. Idempotent; a poll already in flight is
    /// cancelled.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock().expect("poller state mutex poisoned");
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    /// Server-side hint that history moved past `revision`. Wakes the
    /// loop only when the hint is ahead of what was already applied.
    pub fn trigger(&self, revision: &str) {
        let state = self.inner.state.lock().expect("poller state mutex poisoned");
        if state.last_revision.as_deref() == Some(revision) {
            return;
        }
        drop(state);
        self.inner.wakeup.notify_one();
    }

    /// Switches between interval polling and hint-driven polling.
    pub fn set_has_revision_hint(&self, has_hint: bool) {
        let mut state = self.inner.state.lock().expect("poller state mutex poisoned");
        let was_hinted = std::mem::replace(&mut state.has_revision_hint, has_hint);
        drop(state);
        // Leaving hint mode needs a wakeup so the loop falls back to the
        // interval schedule; entering it does not warrant a poll.
        if was_hinted && !has_hint {
            self.inner.wakeup.notify_one();
        }
    }
}

async fn run_loop(inner: Arc<PollerInner>) {
    loop {
        let delay = {
            let state = inner.state.lock().expect("poller state mutex poisoned");
            if state.has_revision_hint {
                None
            } else {
                let elapsed = state.last_poll.map(|at| at.elapsed()).unwrap_or(inner.interval);
                Some(inner.interval.saturating_sub(elapsed))
            }
        };
        match delay {
            Some(delay) if !delay.is_zero() => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.wakeup.notified() => {}
                }
            }
            Some(_) => {}
            None => inner.wakeup.notified().await,
        }

        match poll_once(&inner).await {
            Ok(PollOutcome::Backlog) => {
                // Drain eagerly until the server reports no more pages.
                inner.wakeup.notify_one();
            }
            Ok(PollOutcome::Idle) => {}
            Err(SessionError::Access(err)) => {
                log::debug!("history poll stopped: {err}");
                return;
            }
            Err(err) => {
                // Revision untouched; the same batch is retried next tick.
                log::warn!("history poll failed: {err}");
            }
        }
    }
}

async fn poll_once(inner: &Arc<PollerInner>) -> Result<PollOutcome, SessionError> {
    let since = {
        let mut state = inner.state.lock().expect("poller state mutex poisoned");
        state.last_poll = Some(Instant::now());
        state.last_revision.clone()
    };

    inner.context.check_access()?;
    let response = inner.remote.history_since(since.as_deref()).await?;

    if response.is_initial && !response.has_more {
        inner.holder.set_end_of_remote_history().await?;
        inner.meta.set_history_ended();
    }

    let has_more = response.has_more;
    let is_initial = response.is_initial;
    let revision = response.revision.clone();

    inner
        .holder
        .receive_history_update(response.messages, response.deleted_ids)
        .await?;

    // The batch is applied and persisted; only now does the revision
    // move. A response without a revision leaves the cursor in place.
    if revision.is_some() {
        {
            let mut state = inner.state.lock().expect("poller state mutex poisoned");
            state.last_revision = revision.clone();
        }
        inner.meta.set_revision(revision);
    }

    if has_more && !is_initial {
        Ok(PollOutcome::Backlog)
    } else {
        Ok(PollOutcome::Idle)
    }
}
