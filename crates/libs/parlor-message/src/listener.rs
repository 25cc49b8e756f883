use crate::record::MessageRecord;

/// Consumer-implemented observer for one tracker's timeline.
///
/// Callbacks are delivered on the session's owner context, already ordered
/// and deduplicated by the tracker. `added` comes with the message the new
/// one should be inserted after, or `None` for the top of the window.
pub trait MessageListener: Send {
    fn added(&self, message: &MessageRecord, after: Option<&MessageRecord>);

    fn changed(&self, from: &MessageRecord, to: &MessageRecord);

    fn removed(&self, message: &MessageRecord);

    fn removed_all(&self);
}
