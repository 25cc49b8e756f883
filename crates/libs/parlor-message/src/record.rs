use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::source::{HistoryId, MessageSource, SourceError};

/// Stable message identifier, unique within a chat's lifetime. Locally
/// originated messages carry a client-generated id that the server echoes
/// back on acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Visitor,
    Operator,
    Info,
    File,
    Keyboard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    Sending,
    Sent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub quoted_message_id: MessageId,
    pub sender_name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardButton {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyboard {
    pub buttons: Vec<Vec<KeyboardButton>>,
    pub selected_button: Option<String>,
}

/// Message payload. Irrelevant to the merge engine except for equality
/// comparison when deciding whether a reconciled duplicate needs a
/// `changed` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub kind: MessageKind,
    pub sender_name: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<Quote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl MessageContent {
    pub fn text(kind: MessageKind, sender_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            sender_name: sender_name.into(),
            text: text.into(),
            attachment: None,
            quote: None,
            keyboard: None,
            data: None,
        }
    }
}

/// A single chat message: immutable identity, checked source transitions,
/// in-place status mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    id: MessageId,
    timestamp_micros: i64,
    source: MessageSource,
    send_status: SendStatus,
    content: MessageContent,
}

impl MessageRecord {
    /// A message backed by the history storage.
    pub fn history(
        id: impl Into<MessageId>,
        history_id: HistoryId,
        content: MessageContent,
    ) -> Self {
        let timestamp_micros = history_id.timestamp_micros;
        Self {
            id: id.into(),
            timestamp_micros,
            source: MessageSource::HistoryOnly(history_id),
            send_status: SendStatus::Sent,
            content,
        }
    }

    /// A message living in the current-chat window.
    pub fn current_chat(
        id: impl Into<MessageId>,
        current_chat_id: impl Into<String>,
        timestamp_micros: i64,
        content: MessageContent,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp_micros,
            source: MessageSource::CurrentChatOnly(current_chat_id.into()),
            send_status: SendStatus::Sent,
            content,
        }
    }

    /// A locally originated, not yet acknowledged message. Lives in the
    /// current-chat window under its client-generated id until the server
    /// echoes it back.
    pub fn outgoing(id: impl Into<MessageId>, timestamp_micros: i64, content: MessageContent) -> Self {
        let id = id.into();
        Self {
            timestamp_micros,
            source: MessageSource::CurrentChatOnly(id.0.clone()),
            send_status: SendStatus::Sending,
            content,
            id,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp_micros
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    pub fn send_status(&self) -> SendStatus {
        self.send_status
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub fn text(&self) -> &str {
        &self.content.text
    }

    pub fn is_history(&self) -> bool {
        self.source.is_history()
    }

    pub fn is_current_chat(&self) -> bool {
        self.source.is_current_chat()
    }

    pub fn history_id(&self) -> Option<&HistoryId> {
        self.source.history_id()
    }

    pub fn current_chat_id(&self) -> Option<&str> {
        self.source.current_chat_id()
    }

    pub fn has_history_component(&self) -> bool {
        self.source.has_history_component()
    }

    pub fn mark_sent(&mut self) {
        self.send_status = SendStatus::Sent;
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.content.text = text.into();
    }

    pub fn attach_history(&mut self, id: HistoryId) -> Result<(), SourceError> {
        self.source.attach_history(id)
    }

    pub fn attach_current_chat(&mut self, id: impl Into<String>) -> Result<(), SourceError> {
        self.source.attach_current_chat(id.into())
    }

    pub fn promote_to_history(&mut self) -> Result<(), SourceError> {
        self.source.promote_to_history()
    }

    pub fn promote_to_current_chat(&mut self) -> Result<(), SourceError> {
        self.source.promote_to_current_chat()
    }

    /// Equality for change detection: identity, payload and timestamp.
    /// Source and send status are deliberately ignored; a message that
    /// merely moved between sources has not "changed" for listeners.
    pub fn content_eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.timestamp_micros == other.timestamp_micros
            && self.content == other.content
    }
}
