// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! Integration tests for the send / echo / history flow.
//!
//! Covers:
//! - the optimistic send resolving in place when its echo arrives
//! - validation rejecting empty content without touching the timeline
//! - pushes from the peer interleaving with local sends
//! - duplicated pushes collapsing to a single entry

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use courier::chat::reconcile::{PushOutcome, ReconciliationEngine, SeqSource};
use courier::chat::{ChatEvent, DeliveryState};
use courier::facade::{Courier, CourierConfig, HistoryStatus, SendError};
use courier::history::InMemoryHistory;
use courier::net::ReconnectConfig;
use courier::transport::loopback::LoopbackBroker;
use courier_proto::message::{ClientSeq, MessageId, MessageRecord, UserId, ValidationError};

fn user(id: &str) -> UserId {
    UserId::new(id)
}

fn confirmed(id: &str, from: &str, to: &str, content: &str, seq: Option<u64>) -> MessageRecord {
    MessageRecord {
        id: Some(MessageId::new(id)),
        sender_id: user(from),
        recipient_id: user(to),
        content: content.to_string(),
        client_seq: seq.map(ClientSeq::new),
        chat_id: None,
    }
}

fn fast_config() -> CourierConfig {
    CourierConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..CourierConfig::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test]
fn history_then_send_then_echo_resolves_in_place() {
    let engine = ReconciliationEngine::new(user("1"), user("2"), Arc::new(SeqSource::starting_at(1)));
    engine.load_history(vec![confirmed("h1", "2", "1", "hi", None)]);

    let out = engine.begin_send("hello").unwrap();
    let view = engine.snapshot();
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].id, Some(MessageId::new("h1")));
    assert_eq!(view[1].content, "hello");
    assert_eq!(view[1].delivery, DeliveryState::Pending);

    let echo = confirmed("e1", "1", "2", "hello", Some(out.seq.get()));
    assert_eq!(engine.apply_push(echo), PushOutcome::Resolved(1));

    let view = engine.snapshot();
    assert_eq!(view.len(), 2);
    assert_eq!(view[1].id, Some(MessageId::new("e1")));
    assert_eq!(view[1].delivery, DeliveryState::Confirmed);
}

#[test]
fn echo_emits_update_not_append() {
    let engine = ReconciliationEngine::new(user("1"), user("2"), Arc::new(SeqSource::starting_at(1)));
    let events: Arc<Mutex<Vec<ChatEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    engine.subscribe(move |e| sink.lock().push(e.clone()));

    let out = engine.begin_send("hello").unwrap();
    engine.apply_push(confirmed("e1", "1", "2", "hello", Some(out.seq.get())));

    let events = events.lock();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ChatEvent::Appended { index: 0, .. }));
    assert!(matches!(events[1], ChatEvent::Updated { index: 0, .. }));
}

#[test]
fn same_push_twice_is_one_entry() {
    let engine = ReconciliationEngine::new(user("1"), user("2"), Arc::new(SeqSource::starting_at(1)));
    let push = confirmed("p1", "2", "1", "yo", Some(7));
    assert_eq!(engine.apply_push(push.clone()), PushOutcome::Appended(0));
    assert_eq!(engine.apply_push(push), PushOutcome::Duplicate);
    assert_eq!(engine.snapshot().len(), 1);
}

#[tokio::test]
async fn conversation_round_trip_over_loopback() {
    let broker = LoopbackBroker::new();
    let history = InMemoryHistory::new();
    history.insert(confirmed("h1", "2", "1", "hi", None));

    let courier = Courier::new(broker.transport(), history.clone(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();
    assert_eq!(conv.history_status(), &HistoryStatus::Loaded { count: 1 });
    eventually(|| conv.connection_state().is_connected()).await;

    let seq = conv.send("hello").unwrap();
    eventually(|| conv.messages().iter().all(|m| m.delivery.is_confirmed())).await;

    let view = conv.messages();
    assert_eq!(view.len(), 2);
    assert_eq!(view[0].content, "hi");
    assert_eq!(view[1].content, "hello");
    assert_eq!(view[1].client_seq, Some(seq));
    assert!(view[1].id.is_some());
    conv.close().await;
}

#[tokio::test]
async fn empty_content_is_rejected_without_side_effects() {
    let broker = LoopbackBroker::new();
    let courier = Courier::new(broker.transport(), InMemoryHistory::new(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();
    eventually(|| conv.connection_state().is_connected()).await;

    assert_eq!(conv.send(""), Err(SendError::Validation(ValidationError::Empty)));
    assert_eq!(conv.send("   "), Err(SendError::Validation(ValidationError::Empty)));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(conv.messages().is_empty());
    assert!(broker.published().is_empty());
    conv.close().await;
}

#[tokio::test]
async fn both_sides_see_the_same_timeline() {
    let broker = LoopbackBroker::new();
    let history = InMemoryHistory::new();
    let alice = Courier::new(broker.transport(), history.clone(), fast_config());
    let bob = Courier::new(broker.transport(), history, fast_config());

    let a = alice.open(user("1"), user("2")).await.unwrap();
    let b = bob.open(user("2"), user("1")).await.unwrap();
    eventually(|| a.connection_state().is_connected() && b.connection_state().is_connected())
        .await;

    a.send("ping").unwrap();
    eventually(|| b.messages().len() == 1).await;
    b.send("pong").unwrap();
    eventually(|| a.messages().len() == 2 && a.messages().iter().all(|m| m.delivery.is_confirmed()))
        .await;
    eventually(|| b.messages().len() == 2 && b.messages().iter().all(|m| m.delivery.is_confirmed()))
        .await;

    let contents = |v: &courier::chat::store::Snapshot| {
        v.iter().map(|m| m.content.clone()).collect::<Vec<_>>()
    };
    assert_eq!(contents(&a.messages()), vec!["ping", "pong"]);
    assert_eq!(contents(&b.messages()), vec!["ping", "pong"]);

    a.close().await;
    b.close().await;
}
