use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Address of a message inside the history storage: the storage key plus
/// the server timestamp the key was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryId {
    pub db_key: String,
    pub timestamp_micros: i64,
}

impl HistoryId {
    pub fn new(db_key: impl Into<String>, timestamp_micros: i64) -> Self {
        Self { db_key: db_key.into(), timestamp_micros }
    }
}

/// Which identity of a dual-sourced message is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourcePrimary {
    History,
    CurrentChat,
}

/// Where a message record currently lives.
///
/// A record starts out single-sourced. During a merge it may carry both
/// identities; `primary` then decides callback routing and ordering until
/// one side wins. Transitions are only possible through the checked
/// operations below, so an illegal flip is a caller bug surfaced as
/// [`SourceError`], never a silent state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    HistoryOnly(HistoryId),
    CurrentChatOnly(String),
    Both { primary: SourcePrimary, history: HistoryId, current_chat: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("message already carries a history identity")]
    AlreadyHasHistory,
    #[error("message already carries a current-chat identity")]
    AlreadyHasCurrentChat,
    #[error("message has no secondary identity to promote")]
    NotDual,
}

impl MessageSource {
    pub fn is_history(&self) -> bool {
        matches!(
            self,
            Self::HistoryOnly(_) | Self::Both { primary: SourcePrimary::History, .. }
        )
    }

    pub fn is_current_chat(&self) -> bool {
        !self.is_history()
    }

    pub fn history_id(&self) -> Option<&HistoryId> {
        match self {
            Self::HistoryOnly(id) | Self::Both { history: id, .. } => Some(id),
            Self::CurrentChatOnly(_) => None,
        }
    }

    pub fn current_chat_id(&self) -> Option<&str> {
        match self {
            Self::CurrentChatOnly(id) | Self::Both { current_chat: id, .. } => Some(id),
            Self::HistoryOnly(_) => None,
        }
    }

    pub fn has_history_component(&self) -> bool {
        self.history_id().is_some()
    }

    /// Attaches a secondary history identity to a current-chat message.
    pub fn attach_history(&mut self, id: HistoryId) -> Result<(), SourceError> {
        match self {
            Self::CurrentChatOnly(current_chat) => {
                *self = Self::Both {
                    primary: SourcePrimary::CurrentChat,
                    history: id,
                    current_chat: std::mem::take(current_chat),
                };
                Ok(())
            }
            Self::HistoryOnly(_) | Self::Both { .. } => Err(SourceError::AlreadyHasHistory),
        }
    }

    /// Attaches a secondary current-chat identity to a history message.
    pub fn attach_current_chat(&mut self, id: String) -> Result<(), SourceError> {
        match self {
            Self::HistoryOnly(history) => {
                *self = Self::Both {
                    primary: SourcePrimary::History,
                    history: history.clone(),
                    current_chat: id,
                };
                Ok(())
            }
            Self::CurrentChatOnly(_) | Self::Both { .. } => {
                Err(SourceError::AlreadyHasCurrentChat)
            }
        }
    }

    /// Makes the history identity of a dual-sourced message authoritative.
    pub fn promote_to_history(&mut self) -> Result<(), SourceError> {
        match self {
            Self::Both { primary, .. } => {
                *primary = SourcePrimary::History;
                Ok(())
            }
            _ => Err(SourceError::NotDual),
        }
    }

    /// Makes the current-chat identity of a dual-sourced message authoritative.
    pub fn promote_to_current_chat(&mut self) -> Result<(), SourceError> {
        match self {
            Self::Both { primary, .. } => {
                *primary = SourcePrimary::CurrentChat;
                Ok(())
            }
            _ => Err(SourceError::NotDual),
        }
    }
}
