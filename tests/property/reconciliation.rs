#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property-based tests for conversation reconciliation.
//!
//! Uses proptest to verify:
//! 1. The visible count is history + local sends + distinct peer pushes,
//!    whatever the interleaving of echoes, replays and duplicates.
//! 2. Echoes confirm in place and never reorder local sends.
//! 3. Delivering a batch of pushes twice leaves the same timeline as once.

use std::collections::HashSet;
use std::sync::Arc;

use courier::chat::reconcile::{ReconciliationEngine, SeqSource};
use courier_proto::message::{ClientSeq, MessageId, MessageRecord, UserId};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Send,
    /// Echo of the n-th local send (modulo the sends so far).
    Echo(usize),
    /// Push from the peer carrying id `p{n}`.
    Peer(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Send),
        any::<usize>().prop_map(Op::Echo),
        (0u8..16).prop_map(Op::Peer),
    ]
}

fn me() -> UserId {
    UserId::new("1")
}

fn peer() -> UserId {
    UserId::new("2")
}

fn record(id: String, from: UserId, to: UserId, content: String, seq: Option<ClientSeq>) -> MessageRecord {
    MessageRecord {
        id: Some(MessageId::new(id)),
        sender_id: from,
        recipient_id: to,
        content,
        client_seq: seq,
        chat_id: None,
    }
}

fn echo(seq: ClientSeq, content: &str) -> MessageRecord {
    record(format!("e{}", seq.get()), me(), peer(), content.to_string(), Some(seq))
}

fn peer_push(n: u8) -> MessageRecord {
    record(format!("p{n}"), peer(), me(), format!("peer {n}"), Some(ClientSeq::new(u64::from(n))))
}

fn engine_with_history(history: usize) -> ReconciliationEngine {
    let engine = ReconciliationEngine::new(me(), peer(), Arc::new(SeqSource::starting_at(100)));
    let records = (0..history)
        .map(|i| record(format!("h{i}"), peer(), me(), format!("old {i}"), None))
        .collect();
    engine.load_history(records);
    engine
}

proptest! {
    #[test]
    fn no_duplication_under_any_interleaving(
        history in 0usize..5,
        ops in proptest::collection::vec(arb_op(), 0..60),
    ) {
        let engine = engine_with_history(history);
        let mut sent: Vec<(ClientSeq, String)> = Vec::new();
        let mut peers = HashSet::new();

        for op in ops {
            match op {
                Op::Send => {
                    let content = format!("mine {}", sent.len());
                    let out = engine.begin_send(&content).unwrap();
                    sent.push((out.seq, content));
                }
                Op::Echo(n) => {
                    if !sent.is_empty() {
                        let (seq, content) = &sent[n % sent.len()];
                        engine.apply_push(echo(*seq, content));
                    }
                }
                Op::Peer(n) => {
                    peers.insert(n);
                    engine.apply_push(peer_push(n));
                }
            }
        }

        let view = engine.snapshot();
        prop_assert_eq!(view.len(), history + sent.len() + peers.len());

        let local: Vec<ClientSeq> = view
            .iter()
            .filter(|m| m.sender_id == me())
            .filter_map(|m| m.client_seq)
            .collect();
        let expected: Vec<ClientSeq> = sent.iter().map(|(seq, _)| *seq).collect();
        prop_assert_eq!(local, expected);

        // Every send echoed once more: all confirmed, nothing added.
        for (seq, content) in &sent {
            engine.apply_push(echo(*seq, content));
        }
        let view = engine.snapshot();
        prop_assert_eq!(view.len(), history + sent.len() + peers.len());
        prop_assert!(view.iter().all(|m| m.delivery.is_confirmed()));
    }

    #[test]
    fn replaying_pushes_is_idempotent(
        sends in 0usize..6,
        pushes in proptest::collection::vec(0u8..16, 0..20),
    ) {
        let engine = engine_with_history(2);
        let mut batch = Vec::new();
        for i in 0..sends {
            let content = format!("mine {i}");
            let out = engine.begin_send(&content).unwrap();
            batch.push(echo(out.seq, &content));
        }
        batch.extend(pushes.iter().map(|n| peer_push(*n)));

        for r in &batch {
            engine.apply_push(r.clone());
        }
        let once = engine.snapshot().to_vec();

        for r in &batch {
            engine.apply_push(r.clone());
        }
        prop_assert_eq!(engine.snapshot().to_vec(), once);
    }
}
