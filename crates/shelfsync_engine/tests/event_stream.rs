//! Reconnect timing and record delivery of the event stream client.

use bytes::Bytes;
use shelfsync_engine::{
    BackoffConfig, ConnectionState, EventStreamClient, ScriptedEventSource, ScriptedSession,
    SessionEnding,
};
use shelfsync_protocol::{DomainEvent, EntityRef};
use shelfsync_testkit::{book, record, records};
use std::sync::Arc;
use std::time::Duration;

fn gaps(source: &ScriptedEventSource) -> Vec<u64> {
    source
        .open_times()
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect()
}

fn refusals(n: usize) -> Vec<ScriptedSession> {
    (0..n).map(|i| ScriptedSession::refuse(format!("refused {i}"))).collect()
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_up_to_thirty_seconds() {
    let source = Arc::new(ScriptedEventSource::new(refusals(8)));
    let client = EventStreamClient::new(source.clone(), BackoffConfig::default());
    client.connect();
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(gaps(&source), vec![1, 2, 4, 8, 16, 30, 30, 30]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn productive_session_resets_backoff() {
    let update = record(&DomainEvent::EntityUpdated(book("b1", 2, "Dune")));
    let mut script = refusals(3);
    script.push(ScriptedSession::chunks([Bytes::from(update)]));
    script.extend(refusals(2));
    let source = Arc::new(ScriptedEventSource::new(script));
    let client = EventStreamClient::new(source.clone(), BackoffConfig::default());
    client.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(gaps(&source)[..5], [1, 2, 4, 1, 2]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn session_without_records_keeps_backing_off() {
    let mut script = refusals(2);
    script.push(ScriptedSession::chunks([]).then(SessionEnding::Error("reset by peer".into())));
    script.extend(refusals(1));
    let source = Arc::new(ScriptedEventSource::new(script));
    let client = EventStreamClient::new(source.clone(), BackoffConfig::default());
    client.connect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(gaps(&source)[..4], [1, 2, 4, 8]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    let source = Arc::new(ScriptedEventSource::new(refusals(4)));
    let client = EventStreamClient::new(source.clone(), BackoffConfig::default());
    client.connect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(source.open_count(), 1);

    client.disconnect().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.open_count(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn silent_stream_reconnects_after_heartbeat_timeout() {
    let update = record(&DomainEvent::EntityUpdated(book("b1", 2, "Dune")));
    let source = Arc::new(ScriptedEventSource::new([
        ScriptedSession::chunks([Bytes::from(update)]).then(SessionEnding::Hang)
    ]));
    let client = EventStreamClient::new(source.clone(), BackoffConfig::default())
        .with_heartbeat_timeout(Some(Duration::from_secs(5)));
    client.connect();
    tokio::time::sleep(Duration::from_secs(7)).await;

    assert_eq!(gaps(&source), vec![6]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn records_split_across_chunks_are_reassembled() {
    let stream = records(&[
        DomainEvent::EntityUpdated(book("b1", 2, "Dune")),
        DomainEvent::Heartbeat,
        DomainEvent::EntityDeleted {
            entity: EntityRef::book("b2"),
            server_version: 4,
        },
    ]);
    let bytes = stream.into_bytes();
    let chunks: Vec<Bytes> = bytes.chunks(7).map(Bytes::copy_from_slice).collect();
    let source = Arc::new(ScriptedEventSource::new([
        ScriptedSession::chunks(chunks).then(SessionEnding::Hang)
    ]));
    let client = EventStreamClient::new(source, BackoffConfig::default());
    let mut events = client.subscribe();
    client.connect();

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert_eq!(first, DomainEvent::EntityUpdated(book("b1", 2, "Dune")));
    assert_eq!(
        second,
        DomainEvent::EntityDeleted {
            entity: EntityRef::book("b2"),
            server_version: 4,
        }
    );
    assert_eq!(client.stats().records, 3);
    client.disconnect().await;
}
