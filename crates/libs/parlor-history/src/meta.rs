use std::sync::Mutex;

/// Persistence for the incremental-sync cursor. The revision is written
/// strictly after the batch it covers has been applied to the store, so a
/// crash in between re-requests the same window instead of losing it.
pub trait HistoryMetaStorage: Send + Sync {
    fn revision(&self) -> Option<String>;

    fn set_revision(&self, revision: Option<String>);

    fn is_history_ended(&self) -> bool;

    /// Monotonic: once set, stays set.
    fn set_history_ended(&self);
}

/// Meta storage that does not survive the session. Used when the caller
/// opted out of local persistence.
#[derive(Default)]
pub struct MemoryHistoryMeta {
    state: Mutex<MetaState>,
}

impl MemoryHistoryMeta {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct MetaState {
    revision: Option<String>,
    history_ended: bool,
}

impl HistoryMetaStorage for MemoryHistoryMeta {
    fn revision(&self) -> Option<String> {
        self.state.lock().expect("meta state mutex poisoned").revision.clone()
    }

    fn set_revision(&self, revision: Option<String>) {
        self.state.lock().expect("meta state mutex poisoned").revision = revision;
    }

    fn is_history_ended(&self) -> bool {
        self.state.lock().expect("meta state mutex poisoned").history_ended
    }

    fn set_history_ended(&self) {
        self.state.lock().expect("meta state mutex poisoned").history_ended = true;
    }
}
