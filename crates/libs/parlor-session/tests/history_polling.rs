mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parlor_history::{
    HistoryMetaStorage, HistorySinceResponse, MemoryHistoryMeta, RemoteHistoryError,
};
use parlor_session::{ChatSession, SessionConfig};

use support::{history_message, ids, since_batch, MockRemote, RecordingListener};

fn polling_session(remote: Arc<MockRemote>, interval: Duration) -> ChatSession {
    ChatSession::builder(remote)
        .config(SessionConfig { poll_interval: interval, ..SessionConfig::default() })
        .build()
}

#[tokio::test]
async fn revision_advances_only_after_a_batch_is_applied() {
    let remote = MockRemote::new();
    remote.queue_since(Ok(since_batch(
        vec![history_message("m1", "k1", 100, "one")],
        "r1",
    )));
    let session = polling_session(Arc::clone(&remote), Duration::from_millis(20));
    let tracker = session
        .new_message_tracker(Box::new(RecordingListener::new()))
        .await
        .expect("tracker");

    session.resume().expect("resume");
    tokio::time::sleep(Duration::from_millis(80)).await;
    session.pause().expect("pause");

    let calls = remote.since_calls();
    assert!(calls.len() >= 2, "expected repeated polls, got {calls:?}");
    assert_eq!(calls[0], None);
    assert_eq!(calls[1].as_deref(), Some("r1"));

    let all = tracker.get_all_messages().await.expect("cache");
    assert_eq!(ids(&all), ["m1"]);
}

#[tokio::test]
async fn failed_poll_retries_with_the_same_revision() {
    let remote = MockRemote::new();
    remote.queue_since(Err(RemoteHistoryError::Transport("connection reset".into())));
    remote.queue_since(Ok(since_batch(
        vec![history_message("m1", "k1", 100, "one")],
        "r1",
    )));
    let session = polling_session(Arc::clone(&remote), Duration::from_millis(20));

    session.resume().expect("resume");
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.pause().expect("pause");

    let calls = remote.since_calls();
    assert!(calls.len() >= 3, "expected retries, got {calls:?}");
    // The failed batch did not move the cursor.
    assert_eq!(calls[0], None);
    assert_eq!(calls[1], None);
    assert_eq!(calls[2].as_deref(), Some("r1"));
}

#[tokio::test]
async fn backlog_is_drained_without_waiting_for_the_interval() {
    let remote = MockRemote::new();
    remote.queue_since(Ok(HistorySinceResponse {
        messages: vec![history_message("m1", "k1", 100, "one")],
        deleted_ids: HashSet::new(),
        has_more: true,
        is_initial: false,
        revision: Some("r1".to_owned()),
    }));
    remote.queue_since(Ok(since_batch(
        vec![history_message("m2", "k2", 200, "two")],
        "r2",
    )));
    // An interval far longer than the test: the second page must arrive
    // through the backlog path.
    let session = polling_session(Arc::clone(&remote), Duration::from_secs(600));
    let tracker = session
        .new_message_tracker(Box::new(RecordingListener::new()))
        .await
        .expect("tracker");

    session.resume().expect("resume");
    tokio::time::sleep(Duration::from_millis(80)).await;
    session.pause().expect("pause");

    let calls = remote.since_calls();
    assert_eq!(calls.len(), 2, "backlog poll only, got {calls:?}");
    assert_eq!(calls[1].as_deref(), Some("r1"));

    let all = tracker.get_all_messages().await.expect("cache");
    assert_eq!(ids(&all), ["m1", "m2"]);
}

#[tokio::test]
async fn initial_response_without_backlog_marks_history_ended() {
    let remote = MockRemote::new();
    remote.queue_since(Ok(HistorySinceResponse {
        messages: vec![history_message("m1", "k1", 100, "one")],
        deleted_ids: HashSet::new(),
        has_more: false,
        is_initial: true,
        revision: Some("r1".to_owned()),
    }));
    let meta = Arc::new(MemoryHistoryMeta::new());
    let session = ChatSession::builder(remote.clone())
        .meta_storage(meta.clone())
        .config(SessionConfig {
            poll_interval: Duration::from_secs(600),
            ..SessionConfig::default()
        })
        .build();
    let tracker = session
        .new_message_tracker(Box::new(RecordingListener::new()))
        .await
        .expect("tracker");

    session.resume().expect("resume");
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.pause().expect("pause");

    assert!(meta.is_history_ended());
    assert_eq!(meta.revision().as_deref(), Some("r1"));

    // The exhausted remote is never consulted when paginating past the
    // oldest cached message.
    let page = tracker.get_next_messages(10).await.expect("page");
    assert_eq!(ids(&page), ["m1"]);
    let page = tracker.get_next_messages(10).await.expect("end page");
    assert!(page.is_empty());
    assert!(remote.before_calls().is_empty());
}

#[tokio::test]
async fn deletions_reach_listeners_after_pagination() {
    let remote = MockRemote::new();
    let session = polling_session(Arc::clone(&remote), Duration::from_secs(600));
    let listener = RecordingListener::new();
    let tracker = session
        .new_message_tracker(Box::new(listener.clone()))
        .await
        .expect("tracker");

    session
        .receive_history_update(
            vec![
                history_message("m1", "k1", 100, "one"),
                history_message("m2", "k2", 200, "two"),
            ],
            HashSet::new(),
        )
        .await
        .expect("seed");
    let page = tracker.get_next_messages(10).await.expect("page");
    assert_eq!(ids(&page), ["m1", "m2"]);
    listener.take();

    session
        .receive_history_update(Vec::new(), HashSet::from(["k1".to_owned()]))
        .await
        .expect("delete");
    assert_eq!(
        listener.take(),
        [support::Event::Removed { id: "m1".to_owned() }]
    );

    let all = tracker.get_all_messages().await.expect("cache");
    assert_eq!(ids(&all), ["m2"]);
}

#[tokio::test]
async fn revision_hint_wakes_the_poller() {
    let remote = MockRemote::new();
    remote.queue_since(Ok(since_batch(
        vec![history_message("m1", "k1", 100, "one")],
        "r1",
    )));
    remote.queue_since(Ok(since_batch(
        vec![history_message("m2", "k2", 200, "two")],
        "r2",
    )));
    let session = polling_session(Arc::clone(&remote), Duration::from_secs(600));

    session.resume().expect("resume");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.since_calls().len(), 1);

    // A hint matching the applied revision is a no-op.
    session.history_revision_hint("r1").expect("hint");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.since_calls().len(), 1);

    // A newer hint triggers an immediate poll.
    session.history_revision_hint("r2").expect("hint");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = remote.since_calls();
    assert_eq!(calls.len(), 2, "hint poll expected, got {calls:?}");
    assert_eq!(calls[1].as_deref(), Some("r1"));
    session.pause().expect("pause");
}

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    let remote = MockRemote::new();
    let session = polling_session(Arc::clone(&remote), Duration::from_secs(600));

    session.resume().expect("resume");
    session.resume().expect("second resume");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.since_calls().len(), 1);

    session.pause().expect("pause");
    session.pause().expect("second pause");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.since_calls().len(), 1, "no polls while paused");
}
