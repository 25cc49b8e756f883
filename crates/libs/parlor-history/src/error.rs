use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed stored payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("message '{0}' has no history identity and cannot be stored")]
    MissingHistoryId(String),
}

#[derive(Debug, Error)]
pub enum RemoteHistoryError {
    #[error("transport: {0}")]
    Transport(String),
}
