//! Message entity model for the parlor live-chat SDK.
//!
//! A [`MessageRecord`] carries a stable client-or-server identity plus a
//! [`MessageSource`] describing where the record currently lives: the live
//! current-chat window, the durable history, or both at once while a merge
//! is in flight. The source never flips silently: every transition goes
//! through a checked operation on the record.

mod listener;
mod record;
mod source;

pub use listener::MessageListener;
pub use record::{
    Attachment, Keyboard, KeyboardButton, MessageContent, MessageId, MessageKind, MessageRecord,
    Quote, SendStatus,
};
pub use source::{HistoryId, MessageSource, SourceError, SourcePrimary};
