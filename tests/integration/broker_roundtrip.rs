// Test-specific lint overrides: integration tests use unwrap/expect freely.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

//! End-to-end tests against a real `courier-broker` on localhost.
//!
//! Each test starts a broker on an ephemeral port and talks to it through
//! the WebSocket transport and the HTTP history source, exactly as the
//! `courier` binary does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier::chat::ChatEvent;
use courier::facade::{Courier, CourierConfig, HistoryStatus};
use courier::history::HttpHistorySource;
use courier::net::{ConnectionState, ReconnectConfig};
use courier::transport::websocket::WebSocketTransport;
use courier_broker::broker::{self, BrokerState};
use courier_proto::message::UserId;
use courier_proto::topic;

type LiveCourier = Courier<WebSocketTransport, HttpHistorySource>;

fn user(id: &str) -> UserId {
    UserId::new(id)
}

async fn start_broker() -> (SocketAddr, Arc<BrokerState>) {
    let state = Arc::new(BrokerState::new());
    let (addr, _handle) = broker::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

fn live_courier(addr: SocketAddr, history_url: &str) -> LiveCourier {
    live_courier_retrying_after(addr, history_url, Duration::from_millis(20))
}

fn live_courier_retrying_after(
    addr: SocketAddr,
    history_url: &str,
    initial_delay: Duration,
) -> LiveCourier {
    let config = CourierConfig {
        reconnect: ReconnectConfig {
            initial_delay,
            max_delay: initial_delay.max(Duration::from_millis(200)),
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..CourierConfig::default()
    };
    let transport = WebSocketTransport::new(format!("ws://{addr}/ws"))
        .with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
    let history = HttpHistorySource::with_timeout(history_url, Duration::from_secs(2)).unwrap();
    Courier::new(transport, history, config)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn eventually_async<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn two_clients_exchange_messages() {
    let (addr, state) = start_broker().await;
    let http = format!("http://{addr}");
    let alice = live_courier(addr, &http);
    let bob = live_courier(addr, &http);

    let a = alice.open(user("1"), user("2")).await.unwrap();
    let b = bob.open(user("2"), user("1")).await.unwrap();
    eventually_async(|| {
        let state = Arc::clone(&state);
        async move {
            state.subscription_count("user/1/messages").await == 1
                && state.subscription_count("user/2/messages").await == 1
        }
    })
    .await;

    let seq = a.send("hello bob").unwrap();
    eventually(|| b.messages().len() == 1).await;
    eventually(|| a.messages().len() == 1 && a.messages()[0].delivery.is_confirmed()).await;

    let (mine, theirs) = (a.messages(), b.messages());
    let (mine, theirs) = (&mine[0], &theirs[0]);
    assert_eq!(mine.client_seq, Some(seq));
    assert_eq!(mine.id, theirs.id);
    assert_eq!(theirs.sender_id, user("1"));
    assert_eq!(theirs.content, "hello bob");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn reopening_loads_history_over_http() {
    let (addr, state) = start_broker().await;
    let http = format!("http://{addr}");
    let alice = live_courier(addr, &http);

    let a = alice.open(user("1"), user("2")).await.unwrap();
    eventually(|| a.connection_state().is_connected()).await;
    eventually_async(|| {
        let state = Arc::clone(&state);
        async move { state.subscription_count("user/1/messages").await == 1 }
    })
    .await;
    a.send("first").unwrap();
    a.send("second").unwrap();
    eventually(|| a.messages().iter().all(|m| m.delivery.is_confirmed())).await;
    let ids: Vec<_> = a.messages().iter().map(|m| m.id.clone()).collect();
    a.close().await;

    let again = live_courier(addr, &http);
    let a2 = again.open(user("1"), user("2")).await.unwrap();
    assert_eq!(a2.history_status(), &HistoryStatus::Loaded { count: 2 });
    let reloaded: Vec<_> = a2.messages().iter().map(|m| m.id.clone()).collect();
    assert_eq!(reloaded, ids);
    assert!(a2.messages().iter().all(|m| m.delivery.is_confirmed()));

    // A fresh send after reload must not collide with the stored sequence numbers.
    a2.send("third").unwrap();
    eventually(|| a2.messages().len() == 3 && a2.messages()[2].delivery.is_confirmed()).await;
    a2.close().await;
}

#[tokio::test]
async fn broker_closing_sessions_triggers_reconnect() {
    let (addr, state) = start_broker().await;
    let http = format!("http://{addr}");
    let alice = live_courier(addr, &http);
    let a = alice.open(user("1"), user("2")).await.unwrap();
    let destination = topic::user_messages(&user("1"));
    eventually_async(|| {
        let state = Arc::clone(&state);
        let destination = destination.clone();
        async move { state.subscription_count(&destination).await == 1 }
    })
    .await;

    let dropped = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&dropped);
    a.subscribe(move |event| {
        if *event == ChatEvent::ConnectionChanged(ConnectionState::Dropped) {
            flag.store(true, Ordering::SeqCst);
        }
    });

    state.close_all_connections().await;
    eventually(|| dropped.load(Ordering::SeqCst)).await;
    eventually(|| a.connection_state().is_connected()).await;
    eventually_async(|| {
        let state = Arc::clone(&state);
        let destination = destination.clone();
        async move { state.subscription_count(&destination).await == 1 }
    })
    .await;

    a.send("after reconnect").unwrap();
    eventually(|| a.messages().len() == 1 && a.messages()[0].delivery.is_confirmed()).await;
    a.close().await;
}

#[tokio::test]
async fn unreachable_history_still_opens_conversation() {
    let (addr, _state) = start_broker().await;
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let alice = live_courier(addr, &format!("http://{closed}"));

    let a = alice.open(user("1"), user("2")).await.unwrap();
    assert!(matches!(a.history_status(), HistoryStatus::Unavailable { .. }));
    assert!(a.messages().is_empty());

    eventually(|| a.connection_state().is_connected()).await;
    a.send("still works").unwrap();
    eventually(|| a.messages().len() == 1 && a.messages()[0].delivery.is_confirmed()).await;
    a.close().await;
}

#[tokio::test]
async fn send_right_after_open_is_confirmed() {
    let (addr, _state) = start_broker().await;
    let alice = live_courier(addr, &format!("http://{addr}"));

    let a = alice.open(user("1"), user("2")).await.unwrap();
    assert_eq!(a.connection_state(), ConnectionState::Connected);
    a.send("hello").unwrap();
    eventually(|| a.messages()[0].delivery.is_confirmed()).await;
    a.close().await;
}

#[tokio::test]
async fn message_sent_while_peer_is_down_arrives_after_reconnect() {
    let (addr, state) = start_broker().await;
    let http = format!("http://{addr}");
    let alice = live_courier_retrying_after(addr, &http, Duration::from_millis(800));
    let bob = live_courier(addr, &http);

    let a = alice.open(user("1"), user("2")).await.unwrap();
    let b = bob.open(user("2"), user("1")).await.unwrap();

    state.close_all_connections().await;
    eventually(|| !a.connection_state().is_connected()).await;
    eventually(|| b.connection_state().is_connected()).await;

    b.send("are you there?").unwrap();
    eventually(|| b.messages()[0].delivery.is_confirmed()).await;
    assert!(!a.connection_state().is_connected());

    eventually(|| a.connection_state().is_connected()).await;
    eventually(|| a.messages().len() == 1).await;
    let (mine, theirs) = (a.messages(), b.messages());
    assert_eq!(mine[0].id, theirs[0].id);
    assert_eq!(mine[0].content, "are you there?");
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn refused_subscription_never_reports_connected() {
    let (addr, state) = start_broker().await;
    let alice = live_courier(addr, &format!("http://{addr}"));

    let a = alice.open(user("a/b"), user("2")).await.unwrap();
    assert_eq!(a.connection_state(), ConnectionState::Dropped);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!a.connection_state().is_connected());
    assert_eq!(state.subscription_count("user/a/b/messages").await, 0);
    a.close().await;
}
