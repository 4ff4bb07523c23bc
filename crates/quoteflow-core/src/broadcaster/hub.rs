//! Connection registry, topic groups and fan-out.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use super::BroadcastError;
use super::connection::{ConnectionId, ConnectionMetadata, DisconnectReason};
use super::messages::{ClientMessage, Delivery, ServerMessage};
use super::rate_limit::RateWindow;
use super::topic::TopicSpec;
use crate::cache::TieredCache;
use crate::events::{CoreEvent, EventBus};
use crate::metrics;
use crate::scheduler::PREFETCH_PREFIX;

/// Cache namespace for per-topic payloads.
pub const TOPIC_PREFIX: &str = "topic:";

/// Produces the payload for a topic when nothing is cached for it.
pub type TopicFetcher =
    Arc<dyn Fn(TopicSpec) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Configuration for the broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Connections beyond this are rejected.
    pub max_connections: usize,
    /// Control messages accepted per connection per window.
    pub rate_limit_messages: u32,
    pub rate_limit_window: Duration,
    pub heartbeat_interval: Duration,
    /// Connections idle for longer are disconnected by the sweep.
    pub subscription_timeout: Duration,
    /// Period of the topic push loop; `None` disables it.
    pub push_interval: Option<Duration>,
    /// TTL for payloads produced by the topic fetcher.
    pub topic_ttl: Duration,
    /// Capacity of each connection's outbound channel.
    pub outbound_buffer: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            max_connections: 1_000,
            rate_limit_messages: 100,
            rate_limit_window: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            subscription_timeout: Duration::from_secs(300),
            push_interval: Some(Duration::from_secs(5)),
            topic_ttl: Duration::from_secs(5),
            outbound_buffer: 64,
        }
    }
}

/// Running counts exposed by [`Broadcaster::metrics`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BroadcasterMetrics {
    pub connections: usize,
    pub subscriptions: usize,
    pub topics: usize,
    pub accepted_total: u64,
    pub rejected_total: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub rate_limited: u64,
}

struct ConnectionRecord {
    sender: mpsc::Sender<Delivery>,
    subscriptions: HashSet<String>,
    last_activity: Instant,
    metadata: ConnectionMetadata,
}

struct TopicGroup {
    spec: TopicSpec,
    members: HashSet<ConnectionId>,
}

#[derive(Default)]
struct State {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    topics: HashMap<String, TopicGroup>,
    rate_limits: HashMap<ConnectionId, RateWindow>,
    subscription_count: usize,
}

impl State {
    fn publish_gauges(&self) {
        metrics::set_connection_gauges(self.connections.len(), self.subscription_count);
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
    rate_limited: AtomicU64,
}

enum Admission {
    Allowed(mpsc::Sender<Delivery>),
    Limited(mpsc::Sender<Delivery>, Duration),
}

/// Pushes topic data to subscribed connections.
///
/// Connections, topic groups and rate-limit windows live behind one lock so
/// that group membership always mirrors each connection's subscription set.
/// Delivery uses `try_send` on bounded channels: a slow or dead connection
/// never blocks the others.
pub struct Broadcaster {
    state: RwLock<State>,
    config: BroadcasterConfig,
    counters: Counters,
    cache: Option<Arc<TieredCache>>,
    fetcher: Option<TopicFetcher>,
    events: Option<EventBus>,
}

impl Broadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            config,
            counters: Counters::default(),
            cache: None,
            fetcher: None,
            events: None,
        }
    }

    /// Resolve topic payloads from `cache`.
    pub fn with_cache(mut self, cache: Arc<TieredCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Fall back to `fetcher` (through the cache) when a topic has no cached data.
    pub fn with_fetcher<F, Fut>(mut self, fetcher: F) -> Self
    where
        F: Fn(TopicSpec) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.fetcher = Some(Arc::new(move |spec| -> BoxFuture<'static, anyhow::Result<Value>> {
            Box::pin(fetcher(spec))
        }));
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.config
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    /// Register a new connection.
    ///
    /// Returns its id and the receiving end of its outbound channel, or
    /// `CapacityExceeded` when the server is full.
    pub fn connect(
        &self,
        metadata: ConnectionMetadata,
    ) -> Result<(ConnectionId, mpsc::Receiver<Delivery>), BroadcastError> {
        let max = self.config.max_connections;
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(self.config.outbound_buffer.max(1));
        let origin = metadata.origin.clone();
        let now = Instant::now();

        {
            let mut state = self.state.write();
            if state.connections.len() >= max {
                drop(state);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::record_rejected_connection();
                warn!(max_connections = max, "Connection rejected, server full");
                self.publish(CoreEvent::ConnectionRejected {
                    max_connections: max,
                });
                return Err(BroadcastError::CapacityExceeded { max });
            }

            state.connections.insert(
                id,
                ConnectionRecord {
                    sender,
                    subscriptions: HashSet::new(),
                    last_activity: now,
                    metadata,
                },
            );
            state.rate_limits.insert(id, RateWindow::new(now));
            state.publish_gauges();
        }

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        info!(connection_id = %id, origin = ?origin, "Connection accepted");
        self.publish(CoreEvent::ConnectionAccepted {
            connection_id: id,
            origin,
        });
        Ok((id, receiver))
    }

    /// Remove a connection from every topic group, then drop its record and
    /// rate-limit window. Returns whether the connection was known.
    pub fn disconnect(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let record = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(record) = state.connections.remove(&id) else {
                return false;
            };

            for key in &record.subscriptions {
                if let Some(group) = state.topics.get_mut(key) {
                    group.members.remove(&id);
                    if group.members.is_empty() {
                        state.topics.remove(key);
                    }
                }
            }
            state.subscription_count -= record.subscriptions.len();
            state.rate_limits.remove(&id);
            state.publish_gauges();
            record
        };

        // The transport may already be gone.
        let _ = record.sender.try_send(Delivery::Close(reason));

        info!(
            connection_id = %id,
            reason = %reason,
            subscriptions = record.subscriptions.len(),
            origin = ?record.metadata.origin,
            "Connection closed"
        );
        self.publish(CoreEvent::ConnectionClosed {
            connection_id: id,
            reason,
        });
        true
    }

    /// Refresh a connection's activity timestamp (transport pongs).
    pub fn touch(&self, id: ConnectionId) -> bool {
        match self.state.write().connections.get_mut(&id) {
            Some(record) => {
                record.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe a connection to a topic. Idempotent.
    ///
    /// Returns the canonical topic key and confirms it to the client.
    pub fn subscribe(&self, id: ConnectionId, spec: &TopicSpec) -> Result<String, BroadcastError> {
        let spec = spec.canonicalize()?;
        let key = spec.key();

        let sender = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let record = state
                .connections
                .get_mut(&id)
                .ok_or(BroadcastError::NotConnected(id))?;
            record.last_activity = Instant::now();
            let sender = record.sender.clone();

            if record.subscriptions.insert(key.clone()) {
                state
                    .topics
                    .entry(key.clone())
                    .or_insert_with(|| TopicGroup {
                        spec,
                        members: HashSet::new(),
                    })
                    .members
                    .insert(id);
                state.subscription_count += 1;
                state.publish_gauges();
            }
            sender
        };

        debug!(connection_id = %id, topic = %key, "Subscribed");
        self.deliver(&sender, ServerMessage::subscription_confirmed(key.clone()));
        Ok(key)
    }

    /// Inverse of [`Broadcaster::subscribe`]. Empty groups are removed.
    ///
    /// Returns whether the connection was subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, spec: &TopicSpec) -> Result<bool, BroadcastError> {
        let key = spec.canonicalize()?.key();

        let (sender, removed) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let record = state
                .connections
                .get_mut(&id)
                .ok_or(BroadcastError::NotConnected(id))?;
            record.last_activity = Instant::now();

            let removed = record.subscriptions.remove(&key);
            let sender = record.sender.clone();
            if removed {
                if let Some(group) = state.topics.get_mut(&key) {
                    group.members.remove(&id);
                    if group.members.is_empty() {
                        state.topics.remove(&key);
                    }
                }
                state.subscription_count -= 1;
                state.publish_gauges();
            }
            (sender, removed)
        };

        debug!(connection_id = %id, topic = %key, removed, "Unsubscribed");
        self.deliver(&sender, ServerMessage::unsubscribed(key));
        Ok(removed)
    }

    /// Parse and process one inbound text message.
    ///
    /// Messages over the rate limit are answered with `rate_limit_exceeded`
    /// and dropped. Malformed messages are answered with `error`. In both
    /// cases the connection stays open and the error is returned for logging.
    pub async fn handle_message(&self, id: ConnectionId, text: &str) -> Result<(), BroadcastError> {
        let sender = match self.admit(id)? {
            Admission::Allowed(sender) => sender,
            Admission::Limited(sender, retry_after) => {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                metrics::record_rate_limited();
                debug!(connection_id = %id, retry_after_ms = retry_after.as_millis() as u64, "Control message rate limited");
                self.publish(CoreEvent::RateLimited { connection_id: id });
                self.deliver(
                    &sender,
                    ServerMessage::rate_limit_exceeded(retry_after.as_millis() as u64),
                );
                return Err(BroadcastError::RateLimited { retry_after });
            }
        };

        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                self.deliver(&sender, ServerMessage::error(format!("invalid message: {e}")));
                return Err(BroadcastError::InvalidMessage(e.to_string()));
            }
        };

        let result = match message {
            ClientMessage::Ping => {
                self.deliver(&sender, ServerMessage::pong());
                Ok(())
            }
            ClientMessage::Subscribe(spec) => match self.subscribe(id, &spec) {
                Ok(key) => {
                    if let Ok(spec) = spec.canonicalize() {
                        if let Some(payload) = self.resolve_topic(&spec).await {
                            self.deliver(&sender, ServerMessage::data(key, payload));
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ClientMessage::Unsubscribe(spec) => self.unsubscribe(id, &spec).map(|_| ()),
        };

        if let Err(BroadcastError::InvalidTopic(reason)) = &result {
            self.deliver(&sender, ServerMessage::error(reason.clone()));
        }
        result
    }

    /// Count one inbound message against the connection's window.
    fn admit(&self, id: ConnectionId) -> Result<Admission, BroadcastError> {
        let now = Instant::now();
        let limit = self.config.rate_limit_messages;
        let window = self.config.rate_limit_window;

        let mut guard = self.state.write();
        let state = &mut *guard;
        let record = state
            .connections
            .get_mut(&id)
            .ok_or(BroadcastError::NotConnected(id))?;
        let rate = state
            .rate_limits
            .entry(id)
            .or_insert_with(|| RateWindow::new(now));

        match rate.check(now, limit, window) {
            Ok(()) => {
                record.last_activity = now;
                Ok(Admission::Allowed(record.sender.clone()))
            }
            Err(retry_after) => Ok(Admission::Limited(record.sender.clone(), retry_after)),
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Deliver `payload` to every member of `topic`.
    ///
    /// Never blocks. Members whose channel is closed are disconnected after
    /// the fan-out. Returns the number of connections the message was handed to.
    pub fn broadcast(&self, topic: &str, payload: Value) -> usize {
        let message = ServerMessage::data(topic, payload);
        let mut delivered = 0;
        let mut failed = 0;
        let mut closed = Vec::new();

        {
            let state = self.state.read();
            let Some(group) = state.topics.get(topic) else {
                return 0;
            };
            for id in &group.members {
                let Some(record) = state.connections.get(id) else {
                    continue;
                };
                match record.sender.try_send(Delivery::Message(message.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(connection_id = %id, topic = %topic, "Outbound buffer full, dropping message");
                        failed += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        failed += 1;
                        closed.push(*id);
                    }
                }
            }
        }

        self.count_delivery(delivered, failed);
        for id in closed {
            self.disconnect(id, DisconnectReason::TransportError);
        }
        debug!(topic = %topic, delivered, failed, "Broadcast");
        delivered
    }

    /// Send a message to one connection.
    pub fn send_to(&self, id: ConnectionId, message: ServerMessage) -> Result<(), BroadcastError> {
        let sender = self
            .state
            .read()
            .connections
            .get(&id)
            .map(|record| record.sender.clone())
            .ok_or(BroadcastError::NotConnected(id))?;
        self.deliver(&sender, message);
        Ok(())
    }

    /// Push a heartbeat to every connection. Returns how many accepted it.
    pub fn heartbeat(&self) -> usize {
        let message = ServerMessage::heartbeat();
        let mut delivered = 0;
        let mut failed = 0;
        let mut closed = Vec::new();

        {
            let state = self.state.read();
            for (id, record) in &state.connections {
                match record.sender.try_send(Delivery::Message(message.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => failed += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        failed += 1;
                        closed.push(*id);
                    }
                }
            }
        }

        self.count_delivery(delivered, failed);
        for id in closed {
            self.disconnect(id, DisconnectReason::TransportError);
        }
        delivered
    }

    /// Disconnect every connection idle for longer than the subscription timeout.
    pub fn sweep_idle(&self) -> Vec<ConnectionId> {
        let now = Instant::now();
        let timeout = self.config.subscription_timeout;
        let stale: Vec<ConnectionId> = self
            .state
            .read()
            .connections
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_activity) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.disconnect(*id, DisconnectReason::IdleTimeout);
        }
        if !stale.is_empty() {
            info!(evicted = stale.len(), "Evicted idle connections");
        }
        stale
    }

    /// Resolve and broadcast data for every active topic.
    ///
    /// Returns the number of topics that had data.
    pub async fn push_topics(&self) -> usize {
        let topics: Vec<TopicSpec> = self
            .state
            .read()
            .topics
            .values()
            .map(|group| group.spec.clone())
            .collect();

        let mut pushed = 0;
        for spec in topics {
            if let Some(payload) = self.resolve_topic(&spec).await {
                self.broadcast(&spec.key(), payload);
                pushed += 1;
            }
        }
        pushed
    }

    /// Find the payload for a canonical topic.
    ///
    /// Lookup order: `topic:<key>`, `prefetch:<kind>`, then the topic fetcher
    /// through the cache's read-through path.
    pub async fn resolve_topic(&self, spec: &TopicSpec) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        let key = spec.key();
        let topic_cache_key = format!("{TOPIC_PREFIX}{key}");

        if let Some(value) = cache.get_json::<Value>(&topic_cache_key).await {
            return Some(value);
        }
        if let Some(value) = cache
            .get_json::<Value>(&format!("{PREFETCH_PREFIX}{}", spec.topic))
            .await
        {
            return Some(value);
        }

        let fetcher = Arc::clone(self.fetcher.as_ref()?);
        let request = spec.clone();
        let result = cache
            .get_or_set_json::<Value, _, _>(
                &topic_cache_key,
                self.config.topic_ttl,
                &[spec.topic.as_str()],
                move || fetcher(request),
            )
            .await;
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(topic = %key, error = %e, "Topic fetch failed");
                None
            }
        }
    }

    /// Disconnect everything. Returns the number of connections closed.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<ConnectionId> = self.state.read().connections.keys().copied().collect();
        let closed = ids
            .into_iter()
            .filter(|id| self.disconnect(*id, DisconnectReason::ServerShutdown))
            .count();
        info!(closed, "Broadcaster shut down");
        closed
    }

    /// Start the heartbeat/idle sweep loop and, if configured, the push loop.
    ///
    /// Returns a shutdown sender that can be used to stop both loops.
    pub fn start(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let hub = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            info!(heartbeat_secs = period.as_secs(), "Broadcaster heartbeat started");
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.heartbeat();
                        hub.sweep_idle();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Broadcaster heartbeat shutting down");
                            break;
                        }
                    }
                }
            }
        });

        if let Some(period) = self.config.push_interval {
            let hub = Arc::clone(self);
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                info!(push_secs = period.as_secs(), "Broadcaster push loop started");
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            hub.push_topics().await;
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                info!("Broadcaster push loop shutting down");
                                break;
                            }
                        }
                    }
                }
            });
        }

        shutdown_tx
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn metrics(&self) -> BroadcasterMetrics {
        let state = self.state.read();
        BroadcasterMetrics {
            connections: state.connections.len(),
            subscriptions: state.subscription_count,
            topics: state.topics.len(),
            accepted_total: self.counters.accepted.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.state.read().connections.contains_key(&id)
    }

    /// Topic keys the connection is subscribed to.
    pub fn subscriptions(&self, id: ConnectionId) -> Option<BTreeSet<String>> {
        self.state
            .read()
            .connections
            .get(&id)
            .map(|record| record.subscriptions.iter().cloned().collect())
    }

    /// Members of a topic group.
    pub fn topic_members(&self, topic: &str) -> BTreeSet<ConnectionId> {
        self.state
            .read()
            .topics
            .get(topic)
            .map(|group| group.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Keys of all non-empty topic groups.
    pub fn topic_keys(&self) -> BTreeSet<String> {
        self.state.read().topics.keys().cloned().collect()
    }

    /// Check that topic groups and subscription sets mirror each other.
    pub fn is_consistent(&self) -> bool {
        let state = self.state.read();

        let groups_match = state.topics.iter().all(|(key, group)| {
            !group.members.is_empty()
                && group.members.iter().all(|id| {
                    state
                        .connections
                        .get(id)
                        .is_some_and(|record| record.subscriptions.contains(key))
                })
        });
        let subscriptions_match = state.connections.iter().all(|(id, record)| {
            record.subscriptions.iter().all(|key| {
                state
                    .topics
                    .get(key)
                    .is_some_and(|group| group.members.contains(id))
            })
        });
        let count_matches = state.subscription_count
            == state
                .connections
                .values()
                .map(|record| record.subscriptions.len())
                .sum::<usize>();
        let limits_match = state
            .rate_limits
            .keys()
            .all(|id| state.connections.contains_key(id));

        groups_match && subscriptions_match && count_matches && limits_match
    }

    fn deliver(&self, sender: &mpsc::Sender<Delivery>, message: ServerMessage) -> bool {
        let kind = message.kind();
        match sender.try_send(Delivery::Message(message)) {
            Ok(()) => {
                self.count_delivery(1, 0);
                true
            }
            Err(e) => {
                debug!(message = kind, error = %e, "Failed to deliver message");
                self.count_delivery(0, 1);
                false
            }
        }
    }

    fn count_delivery(&self, delivered: usize, failed: usize) {
        if delivered > 0 {
            self.counters
                .messages_sent
                .fetch_add(delivered as u64, Ordering::Relaxed);
            metrics::record_messages_sent(delivered);
        }
        if failed > 0 {
            self.counters
                .errors
                .fetch_add(failed as u64, Ordering::Relaxed);
            metrics::record_delivery_errors(failed);
        }
    }

    fn publish(&self, event: CoreEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}
