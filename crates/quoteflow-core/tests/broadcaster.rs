//! Integration tests for the subscription broadcaster.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use common::local_cache;
use proptest::prelude::*;
use quoteflow_core::broadcaster::{
    BroadcastError, Broadcaster, BroadcasterConfig, ConnectionId, ConnectionMetadata, Delivery,
    DisconnectReason, ServerMessage, TopicSpec,
};
use serde_json::json;
use tokio::sync::mpsc;

fn drain(rx: &mut mpsc::Receiver<Delivery>) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

fn messages(items: Vec<Delivery>) -> Vec<ServerMessage> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Delivery::Message(message) => Some(message),
            Delivery::Close(_) => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_excess_and_recovers() {
    let hub = Broadcaster::new(BroadcasterConfig {
        rate_limit_messages: 3,
        rate_limit_window: Duration::from_secs(60),
        ..Default::default()
    });
    let (id, mut rx) = hub.connect(ConnectionMetadata::default()).unwrap();

    for _ in 0..3 {
        hub.handle_message(id, r#"{"type":"ping"}"#).await.unwrap();
    }
    tokio::time::advance(Duration::from_secs(15)).await;
    let err = hub
        .handle_message(id, r#"{"type":"subscribe","topic":"prices"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, BroadcastError::RateLimited { retry_after } if retry_after == Duration::from_secs(45)));

    // The rejected subscribe was not processed and the connection stays open.
    assert!(hub.subscriptions(id).unwrap().is_empty());
    assert!(hub.is_connected(id));

    let replies = messages(drain(&mut rx));
    assert_eq!(replies.len(), 4);
    match &replies[3] {
        ServerMessage::RateLimitExceeded { retry_after_ms, .. } => {
            assert_eq!(*retry_after_ms, 45_000)
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    assert_eq!(hub.metrics().rate_limited, 1);

    tokio::time::advance(Duration::from_secs(45)).await;
    hub.handle_message(id, r#"{"type":"subscribe","topic":"prices"}"#)
        .await
        .unwrap();
    assert_eq!(
        hub.subscriptions(id).unwrap(),
        BTreeSet::from(["prices".to_string()])
    );
}

#[tokio::test]
async fn test_rate_limits_are_per_connection() {
    let hub = Broadcaster::new(BroadcasterConfig {
        rate_limit_messages: 1,
        ..Default::default()
    });
    let (a, _rx_a) = hub.connect(ConnectionMetadata::default()).unwrap();
    let (b, _rx_b) = hub.connect(ConnectionMetadata::default()).unwrap();

    hub.handle_message(a, r#"{"type":"ping"}"#).await.unwrap();
    assert!(hub.handle_message(a, r#"{"type":"ping"}"#).await.is_err());
    hub.handle_message(b, r#"{"type":"ping"}"#).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loop_and_idle_eviction() {
    let hub = Arc::new(Broadcaster::new(BroadcasterConfig {
        heartbeat_interval: Duration::from_secs(30),
        subscription_timeout: Duration::from_secs(90),
        push_interval: None,
        ..Default::default()
    }));
    let (id, mut rx) = hub.connect(ConnectionMetadata::default()).unwrap();
    let shutdown = hub.start();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(matches!(
        messages(drain(&mut rx)).as_slice(),
        [ServerMessage::Heartbeat { .. }]
    ));

    // Heartbeats alone do not count as client activity.
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert!(!hub.is_connected(id));
    assert_eq!(
        drain(&mut rx).last(),
        Some(&Delivery::Close(DisconnectReason::IdleTimeout))
    );
    shutdown.send(true).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_push_loop_broadcasts_cached_topics() {
    let cache = local_cache();
    cache
        .set_json(
            "topic:prices:BTC",
            &json!({"BTC": 101}),
            Duration::from_secs(600),
            &[],
        )
        .await
        .unwrap();
    let hub = Arc::new(
        Broadcaster::new(BroadcasterConfig {
            push_interval: Some(Duration::from_secs(5)),
            ..Default::default()
        })
        .with_cache(cache),
    );
    let (id, mut rx) = hub.connect(ConnectionMetadata::default()).unwrap();
    hub.subscribe(id, &TopicSpec::new("prices", ["btc"])).unwrap();
    drain(&mut rx);

    let shutdown = hub.start();
    tokio::time::sleep(Duration::from_secs(11)).await;

    let pushed = messages(drain(&mut rx));
    assert_eq!(pushed.len(), 2);
    for message in pushed {
        match message {
            ServerMessage::Data { topic, payload, .. } => {
                assert_eq!(topic, "prices:BTC");
                assert_eq!(payload, json!({"BTC": 101}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
    shutdown.send(true).unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_transports() {
    let hub = Broadcaster::new(BroadcasterConfig::default());
    let (_id, mut rx) = hub.connect(ConnectionMetadata::default()).unwrap();

    assert_eq!(hub.shutdown(), 1);
    assert_eq!(
        rx.recv().await,
        Some(Delivery::Close(DisconnectReason::ServerShutdown))
    );
    assert_eq!(rx.recv().await, None);
}

#[derive(Debug, Clone)]
enum Op {
    Connect,
    Disconnect(usize),
    Subscribe(usize, usize, Vec<usize>),
    Unsubscribe(usize, usize, Vec<usize>),
}

const TOPICS: [&str; 3] = ["prices", "news", "Depth"];
const SYMBOLS: [&str; 4] = ["btc", "ETH", "sol", "Btc"];

fn spec(topic: usize, symbols: &[usize]) -> TopicSpec {
    TopicSpec::new(TOPICS[topic], symbols.iter().map(|s| SYMBOLS[*s]))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let symbols = prop::collection::vec(0..SYMBOLS.len(), 0..3);
    prop_oneof![
        1 => Just(Op::Connect),
        1 => (0usize..8).prop_map(Op::Disconnect),
        4 => (0usize..8, 0..TOPICS.len(), symbols.clone())
            .prop_map(|(c, t, s)| Op::Subscribe(c, t, s)),
        2 => (0usize..8, 0..TOPICS.len(), symbols)
            .prop_map(|(c, t, s)| Op::Unsubscribe(c, t, s)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_groups_mirror_subscriptions(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let hub = Broadcaster::new(BroadcasterConfig {
            max_connections: 6,
            ..Default::default()
        });
        let mut live: Vec<(ConnectionId, mpsc::Receiver<Delivery>)> = Vec::new();
        let mut model: BTreeMap<ConnectionId, BTreeSet<String>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Connect => match hub.connect(ConnectionMetadata::default()) {
                    Ok((id, rx)) => {
                        model.insert(id, BTreeSet::new());
                        live.push((id, rx));
                    }
                    Err(e) => {
                        let capacity_exceeded =
                            matches!(e, BroadcastError::CapacityExceeded { max: 6 });
                        prop_assert!(capacity_exceeded);
                        prop_assert_eq!(live.len(), 6);
                    }
                },
                Op::Disconnect(i) if !live.is_empty() => {
                    let (id, _rx) = live.remove(i % live.len());
                    prop_assert!(hub.disconnect(id, DisconnectReason::ClientClosed));
                    model.remove(&id);
                }
                Op::Subscribe(i, t, s) if !live.is_empty() => {
                    let id = live[i % live.len()].0;
                    let key = hub.subscribe(id, &spec(t, &s)).unwrap();
                    prop_assert_eq!(&key, &spec(t, &s).canonicalize().unwrap().key());
                    model.entry(id).or_default().insert(key);
                }
                Op::Unsubscribe(i, t, s) if !live.is_empty() => {
                    let id = live[i % live.len()].0;
                    let key = spec(t, &s).canonicalize().unwrap().key();
                    let expected = model.entry(id).or_default().remove(&key);
                    prop_assert_eq!(hub.unsubscribe(id, &spec(t, &s)).unwrap(), expected);
                }
                _ => {}
            }

            // Keep outbound buffers from filling up.
            for (_, rx) in live.iter_mut() {
                drain(rx);
            }
            prop_assert!(hub.is_consistent());
        }

        let mut expected_topics: BTreeMap<String, BTreeSet<ConnectionId>> = BTreeMap::new();
        for (id, keys) in &model {
            prop_assert_eq!(hub.subscriptions(*id).unwrap(), keys.clone());
            for key in keys {
                expected_topics.entry(key.clone()).or_default().insert(*id);
            }
        }
        prop_assert_eq!(
            hub.topic_keys(),
            expected_topics.keys().cloned().collect::<BTreeSet<_>>()
        );
        for (key, members) in &expected_topics {
            prop_assert_eq!(&hub.topic_members(key), members);
        }

        let metrics = hub.metrics();
        prop_assert_eq!(metrics.connections, model.len());
        prop_assert_eq!(
            metrics.subscriptions,
            model.values().map(BTreeSet::len).sum::<usize>()
        );
    }
}
