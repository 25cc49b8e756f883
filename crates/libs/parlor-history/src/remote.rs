use std::collections::HashSet;

use async_trait::async_trait;
use parlor_message::MessageRecord;

use crate::error::RemoteHistoryError;

/// One incremental history response ("everything since revision R").
#[derive(Debug, Clone)]
pub struct HistorySinceResponse {
    pub messages: Vec<MessageRecord>,
    pub deleted_ids: HashSet<String>,
    pub has_more: bool,
    /// True when the request carried no revision, i.e. this is the first
    /// sync of the session.
    pub is_initial: bool,
    pub revision: Option<String>,
}

/// One backfill page ("messages older than T").
#[derive(Debug, Clone)]
pub struct RemoteHistoryPage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
}

/// Server-side history access. The wire protocol, retries and timeouts
/// live behind this seam; the engine only sees already-mapped records.
#[async_trait]
pub trait RemoteHistoryProvider: Send + Sync {
    async fn history_since(
        &self,
        revision: Option<&str>,
    ) -> Result<HistorySinceResponse, RemoteHistoryError>;

    async fn history_before(
        &self,
        timestamp_micros: i64,
        limit: usize,
    ) -> Result<RemoteHistoryPage, RemoteHistoryError>;
}
