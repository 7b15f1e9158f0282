// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send,
    clippy::cast_possible_truncation
)]

//! Integration tests for connection loss and recovery.
//!
//! The loopback broker severs sessions on demand and can replay pushes it
//! already delivered, standing in for an at-least-once broker after a
//! resubscribe. These tests check that:
//! - a dropped connection comes back and re-subscribes the user topic
//! - replayed pushes neither duplicate nor reorder confirmed entries
//! - conversations observe the dropped / connected transitions
//! - sends during an outage wait and go out once the connection is back
//! - records stored while the client was away are merged after reconnect
//! - closing stops the retry loop
//! - backoff delays grow and are capped

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use courier::chat::ChatEvent;
use courier::facade::{Courier, CourierConfig};
use courier::history::InMemoryHistory;
use courier::net::{ConnectionState, ReconnectConfig};
use courier::transport::loopback::LoopbackBroker;
use courier_proto::message::{ClientSeq, MessageId, MessageRecord, UserId};
use courier_proto::topic;

fn user(id: &str) -> UserId {
    UserId::new(id)
}

fn fast_config() -> CourierConfig {
    CourierConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..CourierConfig::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn drop_reconnects_and_resubscribes() {
    let broker = LoopbackBroker::new();
    let courier = Courier::new(broker.transport(), InMemoryHistory::new(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();
    let destination = topic::user_messages(&user("1"));
    eventually(|| broker.subscription_count(&destination) == 1).await;

    broker.drop_connections("network gone");
    eventually(|| broker.connect_count() >= 2 && conv.connection_state().is_connected()).await;
    assert_eq!(broker.subscription_count(&destination), 1);
    conv.close().await;
}

#[tokio::test]
async fn replay_after_reconnect_changes_nothing() {
    let broker = LoopbackBroker::new();
    let courier = Courier::new(broker.transport(), InMemoryHistory::new(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();
    eventually(|| conv.connection_state().is_connected()).await;

    conv.send("one").unwrap();
    broker.push(&MessageRecord::outbound(
        user("2"),
        user("1"),
        "from peer".to_string(),
        ClientSeq::new(5),
    ));
    conv.send("two").unwrap();
    eventually(|| {
        conv.messages().len() == 3 && conv.messages().iter().all(|m| m.delivery.is_confirmed())
    })
    .await;
    let before = conv.messages().to_vec();

    broker.drop_connections("blip");
    eventually(|| broker.connect_count() >= 2 && conv.connection_state().is_connected()).await;
    eventually(|| broker.subscription_count(&topic::user_messages(&user("1"))) == 1).await;

    broker.replay(&user("1"), 10);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(conv.messages().to_vec(), before);
    conv.close().await;
}

#[tokio::test]
async fn conversation_observes_drop_and_recovery() {
    let broker = LoopbackBroker::new();
    let courier = Courier::new(broker.transport(), InMemoryHistory::new(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();
    eventually(|| conv.connection_state().is_connected()).await;

    let seen: Arc<Mutex<Vec<ConnectionState>>> = Arc::default();
    let sink = Arc::clone(&seen);
    conv.subscribe(move |event| {
        if let ChatEvent::ConnectionChanged(state) = event {
            sink.lock().push(*state);
        }
    });

    broker.drop_connections("blip");
    eventually(|| seen.lock().last() == Some(&ConnectionState::Connected)).await;

    let seen = seen.lock().clone();
    assert_eq!(seen.first(), Some(&ConnectionState::Dropped));
    assert!(seen.contains(&ConnectionState::Connecting));
    conv.close().await;
}

#[tokio::test]
async fn send_during_outage_goes_out_after_reconnect() {
    let broker = LoopbackBroker::new();
    let courier = Courier::new(broker.transport(), InMemoryHistory::new(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();

    broker.set_reachable(false);
    broker.drop_connections("outage");
    eventually(|| !conv.connection_state().is_connected()).await;

    conv.send("during outage").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conv.messages()[0].delivery.is_pending());

    broker.set_reachable(true);
    eventually(|| conv.messages()[0].delivery.is_confirmed()).await;

    assert_eq!(conv.messages().len(), 1);
    assert_eq!(broker.published().len(), 1);
    conv.close().await;
}

#[tokio::test]
async fn records_missed_during_outage_are_caught_up() {
    let broker = LoopbackBroker::new();
    let history = InMemoryHistory::new();
    let courier = Courier::new(broker.transport(), history.clone(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();

    // The echo of this send is lost with the connection.
    broker.set_echo(false);
    let seq = conv.send("mine").unwrap();
    eventually(|| broker.published().len() == 1).await;
    let stored_own = broker.published()[0].clone();

    broker.set_reachable(false);
    broker.drop_connections("outage");
    eventually(|| !conv.connection_state().is_connected()).await;

    let mut missed = MessageRecord::outbound(
        user("2"),
        user("1"),
        "sent while you were away".to_string(),
        ClientSeq::new(7),
    );
    missed.id = Some(MessageId::new("h-1"));
    history.insert(stored_own);
    history.insert(missed);

    broker.set_echo(true);
    broker.set_reachable(true);
    eventually(|| conv.messages().len() == 2).await;
    eventually(|| conv.messages()[0].delivery.is_confirmed()).await;

    let messages = conv.messages();
    assert_eq!(messages[0].client_seq, Some(seq));
    assert_eq!(messages[0].id, Some(MessageId::new("m-0")));
    assert_eq!(messages[1].id, Some(MessageId::new("h-1")));
    assert_eq!(messages[1].content, "sent while you were away");
    conv.close().await;
}

#[tokio::test]
async fn close_during_retry_stops_reconnecting() {
    let broker = LoopbackBroker::new();
    broker.set_reachable(false);
    let courier = Courier::new(broker.transport(), InMemoryHistory::new(), fast_config());
    let conv = courier.open(user("1"), user("2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    conv.close().await;
    assert_eq!(courier.connection_state(), ConnectionState::Disconnected);

    broker.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connect_count(), 0);
    assert_eq!(broker.session_count(), 0);
}

#[test]
fn backoff_grows_exponentially_and_caps() {
    let config = ReconnectConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        multiplier: 2.0,
        jitter: 0.0,
    };
    let delays: Vec<u64> = (0..8)
        .map(|attempt| config.delay_for(attempt).as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2000, 2000, 2000]);
}
