mod support;

use std::collections::HashSet;
use std::sync::Arc;

use parlor_history::{HistoryStore, MemoryHistoryStore};
use parlor_message::SendStatus;
use parlor_session::{AccessError, ChatInfo, ChatSession, SessionError};

use support::{chat_message, history_message, ids, Event, MockRemote, RecordingListener};

fn build_session() -> ChatSession {
    ChatSession::builder(MockRemote::new()).build()
}

#[tokio::test]
async fn optimistic_send_becomes_changed_on_server_echo() {
    let session = build_session();
    let listener = RecordingListener::new();
    let _tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    let record = session.send_message("hello there").await.expect("send");
    assert_eq!(record.send_status(), SendStatus::Sending);
    assert_eq!(
        listener.take(),
        [Event::Added { id: record.id().as_str().to_owned(), after: None }]
    );

    // The server echo carries the same client id: one changed event, no
    // second copy.
    let echo = chat_message(record.id().as_str(), "cc-1", record.timestamp_micros(), "hello there");
    session.received_message(echo).await.expect("echo");
    assert_eq!(
        listener.take(),
        [Event::Changed {
            id: record.id().as_str().to_owned(),
            from_text: "hello there".to_owned(),
            to_text: "hello there".to_owned(),
        }]
    );
}

#[tokio::test]
async fn cancelled_send_is_removed() {
    let session = build_session();
    let listener = RecordingListener::new();
    let _tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    let record = session.send_message("typo").await.expect("send");
    listener.take();

    session.cancel_send(record.id().as_str()).await.expect("cancel");
    assert_eq!(
        listener.take(),
        [Event::Removed { id: record.id().as_str().to_owned() }]
    );

    assert!(matches!(
        session.cancel_send(record.id().as_str()).await,
        Err(SessionError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn edit_and_revert_round_trip() {
    let session = build_session();
    let listener = RecordingListener::new();
    let _tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    let record = session.send_message("first draft").await.expect("send");
    listener.take();

    let previous = session
        .edit_message(record.id().as_str(), "second draft")
        .await
        .expect("edit");
    assert_eq!(previous, "first draft");
    assert_eq!(
        listener.take(),
        [Event::Changed {
            id: record.id().as_str().to_owned(),
            from_text: "first draft".to_owned(),
            to_text: "second draft".to_owned(),
        }]
    );

    // Server rejected the edit: a corrective changed event restores the
    // previous text.
    session
        .revert_edit(record.id().as_str(), &previous)
        .await
        .expect("revert");
    assert_eq!(
        listener.take(),
        [Event::Changed {
            id: record.id().as_str().to_owned(),
            from_text: "second draft".to_owned(),
            to_text: "first draft".to_owned(),
        }]
    );

    assert!(matches!(
        session.edit_message("missing", "text").await,
        Err(SessionError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn live_messages_buffer_until_first_page() {
    let session = build_session();
    let listener = RecordingListener::new();
    let tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    // No page requested yet: the snapshot lands silently.
    session
        .receive_chat_snapshot(
            Some(ChatInfo::new("c1")),
            vec![chat_message("m1", "cc-1", 100, "buffered")],
        )
        .await
        .expect("snapshot");
    assert_eq!(listener.events(), Vec::<Event>::new());

    // The buffered message arrives through pagination instead.
    let page = tracker.get_next_messages(10).await.expect("first page");
    assert_eq!(ids(&page), ["m1"]);

    // From now on the window is live: new messages are announced.
    session
        .received_message(chat_message("m2", "cc-2", 200, "live"))
        .await
        .expect("receive");
    assert_eq!(
        listener.take(),
        [Event::Added { id: "m2".to_owned(), after: Some("m1".to_owned()) }]
    );
}

#[tokio::test]
async fn snapshot_diff_emits_changed_and_added() {
    let session = build_session();
    let listener = RecordingListener::new();
    let tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    let chat = ChatInfo::new("c1");
    session
        .receive_chat_snapshot(
            Some(chat.clone()),
            vec![chat_message("m1", "cc-1", 100, "hello")],
        )
        .await
        .expect("snapshot");
    tracker.get_next_messages(10).await.expect("first page");
    listener.take();

    // Same chat, refreshed snapshot: m1 edited in place, m2 appended.
    session
        .receive_chat_snapshot(
            Some(chat),
            vec![
                chat_message("m1", "cc-1", 100, "hello, edited"),
                chat_message("m2", "cc-2", 200, "and more"),
            ],
        )
        .await
        .expect("refresh");
    assert_eq!(
        listener.take(),
        [
            Event::Changed {
                id: "m1".to_owned(),
                from_text: "hello".to_owned(),
                to_text: "hello, edited".to_owned(),
            },
            Event::Added { id: "m2".to_owned(), after: Some("m1".to_owned()) },
        ]
    );
}

#[tokio::test]
async fn delta_edits_and_deletes_apply_to_live_window() {
    let session = build_session();
    let listener = RecordingListener::new();
    let tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    session
        .receive_chat_snapshot(
            Some(ChatInfo::new("c1")),
            vec![
                chat_message("m1", "cc-1", 100, "one"),
                chat_message("m2", "cc-2", 200, "two"),
            ],
        )
        .await
        .expect("snapshot");
    tracker.get_next_messages(10).await.expect("first page");
    listener.take();

    session
        .changed_message(chat_message("m2", "cc-2", 200, "two, edited"))
        .await
        .expect("edit");
    session.deleted_message("cc-1").await.expect("delete");

    assert_eq!(
        listener.take(),
        [
            Event::Changed {
                id: "m2".to_owned(),
                from_text: "two".to_owned(),
                to_text: "two, edited".to_owned(),
            },
            Event::Removed { id: "m1".to_owned() },
        ]
    );
}

#[tokio::test]
async fn closed_chat_moves_linked_messages_to_history() {
    let session = build_session();
    let listener = RecordingListener::new();
    let tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    session
        .receive_chat_snapshot(
            Some(ChatInfo::new("c1")),
            vec![chat_message("m1", "cc-1", 100, "hello")],
        )
        .await
        .expect("snapshot");
    tracker.get_next_messages(10).await.expect("first page");

    // The history copy of m1 arrives and links up silently.
    session
        .receive_history_update(
            vec![history_message("m1", "k1", 100, "hello")],
            HashSet::new(),
        )
        .await
        .expect("history update");
    assert_eq!(listener.events(), Vec::<Event>::new());

    // Chat closes, then a new chat opens: m1 survives as history and the
    // new message is announced on an empty live window.
    session
        .receive_chat_snapshot(None, Vec::new())
        .await
        .expect("close");
    session
        .receive_chat_snapshot(
            Some(ChatInfo::new("c2")),
            vec![chat_message("m3", "cc-3", 300, "new chat")],
        )
        .await
        .expect("new chat");

    assert_eq!(
        listener.take(),
        [Event::Added { id: "m3".to_owned(), after: None }]
    );
}

#[tokio::test]
async fn clear_history_resets_every_tracker() {
    let remote = MockRemote::new();
    let store = Arc::new(MemoryHistoryStore::new());
    store
        .insert_or_update(&[history_message("m1", "k1", 100, "one")])
        .await
        .expect("seed cache");
    let session = ChatSession::builder(remote)
        .history_store(Arc::clone(&store) as Arc<dyn HistoryStore>)
        .build();
    let listener = RecordingListener::new();
    let tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    let page = tracker.get_next_messages(10).await.expect("page");
    assert_eq!(ids(&page), ["m1"]);

    session.clear_history().await.expect("clear");
    assert_eq!(listener.take(), [Event::RemovedAll]);
    assert!(store.all().await.expect("store read").is_empty());
}

#[tokio::test]
async fn cancel_after_chat_close_keeps_delta_indexing_valid() {
    let session = build_session();
    let listener = RecordingListener::new();
    let _tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    // The pending send survives the chat close inside the live window.
    let record = session.send_message("pending").await.expect("send");
    session
        .receive_chat_snapshot(None, Vec::new())
        .await
        .expect("close");
    session.cancel_send(record.id().as_str()).await.expect("cancel");

    // Delta traffic against the now-empty window must be a clean no-op,
    // not an index panic.
    session.deleted_message("cc-gone").await.expect("delete");
    session
        .changed_message(chat_message("mx", "cc-x", 50, "late edit"))
        .await
        .expect("change");
    assert!(matches!(
        session.edit_message("mx", "text").await,
        Err(SessionError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn wrong_thread_is_rejected() {
    let session = build_session();
    let handle = std::thread::spawn(move || session.pause());
    let result = handle.join().expect("join");
    assert_eq!(result, Err(AccessError::WrongContext));
}

#[tokio::test]
async fn destroyed_session_rejects_everything() {
    let session = build_session();
    let listener = RecordingListener::new();
    let tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    session.destroy().await;
    session.destroy().await;

    assert!(matches!(
        session.send_message("too late").await,
        Err(SessionError::Access(AccessError::Destroyed))
    ));
    assert!(matches!(
        tracker.get_next_messages(5).await,
        Err(parlor_session::TrackerError::Access(AccessError::Destroyed))
    ));
    assert_eq!(session.resume(), Err(AccessError::Destroyed));
}
