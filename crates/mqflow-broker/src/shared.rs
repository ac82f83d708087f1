//! Broker state shared by every connection task.
//!
//! - `subscriptions`: topic trie (read-heavy, write on sub/unsub)
//! - `retained`: last retained message per topic
//! - `sessions`: offline persistent sessions
//! - `connections`: maps client id to the live connection's delivery channel
//!
//! Lock order is subscriptions, then connections, then the session store.
//! No lock is held across an await point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Notify};

use mqflow_core::topic::{has_wildcards, validate_topic_filter, validate_topic_limits};
use mqflow_core::{
    ConnackCode, Connect, InFlightState, Publish, QoS, SubscribeReturnCode, Will,
};

use crate::config::Config;
use crate::retained::RetainedStore;
use crate::session::{MemorySessionStore, SessionRecord, SessionStore};
use crate::subscription::SubscriptionRegistry;
use crate::will::will_to_publish;

/// How long a new connection waits for the one it replaces to hand over.
const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(5);

/// Message from the broker to a connection task.
#[derive(Debug)]
pub enum Delivery {
    /// Forward this message to the client.
    Publish(Publish),
    /// Another connection claimed this client id; hand the session over and
    /// acknowledge.
    Takeover(oneshot::Sender<()>),
}

/// Routing entry for a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
    abort: Arc<Notify>,
}

impl ConnectionHandle {
    /// Returns false when the connection task is gone.
    pub fn send(&self, delivery: Delivery) -> bool {
        self.tx.send(delivery).is_ok()
    }

    /// Stop the connection task wherever it is waiting, including on a
    /// blocked write. The task still hands its session back.
    pub fn abort(&self) {
        self.abort.notify_one();
    }

    /// Resolves once [`ConnectionHandle::abort`] was called.
    pub async fn aborted(&self) {
        self.abort.notified().await
    }
}

/// Result of [`Broker::connect`].
#[derive(Debug)]
pub enum ConnectOutcome {
    Accepted {
        /// The client id in use, broker-assigned when the client sent none.
        client_id: String,
        session_present: bool,
        /// In-flight exchanges of the reattached session.
        inflight: InFlightState,
        /// Messages queued while the session was offline.
        queued: VecDeque<Publish>,
    },
    Rejected(ConnackCode),
}

/// State a connection hands back when it ends.
#[derive(Debug)]
pub struct Departure {
    pub client_id: String,
    pub connection_id: u64,
    pub clean_session: bool,
    /// False when the connection ended without DISCONNECT.
    pub graceful: bool,
    pub will: Option<Will>,
    pub inflight: InFlightState,
    /// Deliveries accepted but never sent, oldest first.
    pub queued: Vec<Publish>,
}

/// Shared broker state.
pub struct Broker {
    config: Config,
    subscriptions: RwLock<SubscriptionRegistry>,
    retained: RwLock<RetainedStore>,
    sessions: Arc<dyn SessionStore>,
    connections: RwLock<AHashMap<String, ConnectionHandle>>,
    next_connection_id: AtomicU64,
}

impl Broker {
    /// A broker with an in-memory session store.
    pub fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemorySessionStore::new()))
    }

    /// A broker using the given session store.
    pub fn with_store(config: Config, sessions: Arc<dyn SessionStore>) -> Self {
        let max_qos = config.mqtt.max_qos();
        Self {
            config,
            subscriptions: RwLock::new(SubscriptionRegistry::new(max_qos)),
            retained: RwLock::new(RetainedStore::new()),
            sessions,
            connections: RwLock::new(AHashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create the delivery channel for a newly accepted transport.
    pub fn register(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle {
            connection_id,
            tx,
            abort: Arc::new(Notify::new()),
        };
        (handle, rx)
    }

    /// Admit a CONNECT: check the client id, take over an existing
    /// connection with the same id, and resolve the session.
    pub async fn connect(&self, connect: &Connect, handle: &ConnectionHandle) -> ConnectOutcome {
        // MQTT-3.1.3-7: a zero-length client id requires a clean session
        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                log::debug!("Rejecting empty client id without clean session");
                return ConnectOutcome::Rejected(ConnackCode::IdentifierRejected);
            }
            format!("mqflow-{:016x}", handle.connection_id)
        } else {
            connect.client_id.clone()
        };

        let previous = {
            let mut connections = self.connections.write();
            let max = self.config.limits.max_connections;
            if max > 0 && connections.len() >= max && !connections.contains_key(&client_id) {
                log::warn!("Rejecting {}: connection limit {} reached", client_id, max);
                return ConnectOutcome::Rejected(ConnackCode::ServerUnavailable);
            }
            connections.insert(client_id.clone(), handle.clone())
        };

        if let Some(old) = previous {
            log::info!("Client {} reconnected, taking over the previous connection", client_id);
            let (tx, mut rx) = oneshot::channel();
            if old.send(Delivery::Takeover(tx))
                && tokio::time::timeout(TAKEOVER_TIMEOUT, &mut rx).await.is_err()
            {
                // Stuck connections, such as one blocked writing to a peer
                // that stopped reading, are closed before the session moves
                log::warn!(
                    "Previous connection of {} did not hand over in time, aborting it",
                    client_id
                );
                old.abort();
                if tokio::time::timeout(TAKEOVER_TIMEOUT, rx).await.is_err() {
                    log::error!("Previous connection of {} did not stop after abort", client_id);
                }
            }
        }

        let resolved = self.sessions.resolve(&client_id, connect.clean_session);
        let session_present = resolved.session_present();
        let record = resolved.into_record();
        {
            let mut subscriptions = self.subscriptions.write();
            if session_present {
                let id: Arc<str> = Arc::from(client_id.as_str());
                for (filter, qos) in &record.subscriptions {
                    subscriptions.subscribe(&id, filter, *qos);
                }
            } else {
                subscriptions.remove_session(&client_id);
            }
        }

        log::debug!(
            "Client {} connected (clean_session={}, session_present={}, queued={})",
            client_id,
            connect.clean_session,
            session_present,
            record.queued.len()
        );
        ConnectOutcome::Accepted {
            client_id,
            session_present,
            inflight: record.inflight,
            queued: record.queued,
        }
    }

    /// Route a message to every matching session.
    ///
    /// Stores or clears the retained message first when `retain` is set.
    /// Live sessions get the message on their channel; offline persistent
    /// sessions queue it when the delivery QoS is above 0. Returns the
    /// number of sessions that received or queued it.
    pub fn publish(&self, publish: Publish, from: &str) -> usize {
        if publish.retain && self.config.mqtt.retain_available {
            self.retained.write().store(&publish);
        }

        let matches = self
            .subscriptions
            .read()
            .match_topic(&publish.topic, publish.qos);
        if matches.is_empty() {
            log::trace!("No subscribers for {} from {}", publish.topic, from);
            return 0;
        }

        let mut outgoing = publish;
        outgoing.dup = false;
        outgoing.retain = false;
        outgoing.packet_id = None;

        let max_queued = self.config.limits.max_queued;
        let mut routed = 0;
        let connections = self.connections.read();
        for (client_id, qos) in matches {
            let mut message = outgoing.clone();
            message.qos = qos;
            if let Some(handle) = connections.get(&*client_id) {
                if handle.send(Delivery::Publish(message)) {
                    routed += 1;
                }
            } else if self.sessions.enqueue(&client_id, message, max_queued) {
                routed += 1;
            }
        }
        log::trace!("Routed {} from {} to {} sessions", outgoing.topic, from, routed);
        routed
    }

    /// Apply a SUBSCRIBE.
    ///
    /// Returns one return code per filter and the retained messages to send
    /// after the SUBACK, flagged retain at min(stored, granted) QoS.
    pub fn subscribe(
        &self,
        client_id: &str,
        filters: &[(String, QoS)],
    ) -> (Vec<SubscribeReturnCode>, Vec<Publish>) {
        let id: Arc<str> = Arc::from(client_id);
        let mut codes = Vec::with_capacity(filters.len());
        let mut retained = Vec::new();

        for (filter, qos) in filters {
            if let Err(reason) = self.check_filter(filter) {
                log::debug!("Client {} subscribe to '{}' refused: {}", client_id, filter, reason);
                codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let granted = self.subscriptions.write().subscribe(&id, filter, *qos);
            codes.push(SubscribeReturnCode::Granted(granted));

            if self.config.mqtt.retain_available {
                for mut message in self.retained.read().matching(filter) {
                    message.qos = message.qos.min(granted);
                    message.retain = true;
                    retained.push(message);
                }
            }
        }

        (codes, retained)
    }

    fn check_filter(&self, filter: &str) -> Result<(), String> {
        validate_topic_filter(filter).map_err(|e| e.to_string())?;
        let limits = &self.config.limits;
        validate_topic_limits(filter, limits.max_topic_length, limits.max_topic_levels)
            .map_err(|e| e.to_string())?;
        if !self.config.mqtt.wildcard_subscriptions && has_wildcards(filter) {
            return Err("wildcard subscriptions are disabled".into());
        }
        Ok(())
    }

    /// Apply an UNSUBSCRIBE. Unknown filters are ignored.
    pub fn unsubscribe(&self, client_id: &str, filters: &[String]) {
        let mut subscriptions = self.subscriptions.write();
        for filter in filters {
            if !subscriptions.unsubscribe(client_id, filter) {
                log::trace!("Client {} was not subscribed to '{}'", client_id, filter);
            }
        }
    }

    /// A connection ended.
    ///
    /// Only the connection currently registered for the client id leaves
    /// the routing table and may publish its will. The session is discarded
    /// when clean, otherwise stored with its in-flight and queued messages.
    pub fn disconnect(&self, departure: Departure) {
        let Departure {
            client_id,
            connection_id,
            clean_session,
            graceful,
            will,
            inflight,
            queued,
        } = departure;

        let subscriptions = if clean_session {
            Vec::new()
        } else {
            self.subscriptions.read().subscriptions_of(&client_id)
        };

        let owner = {
            let mut connections = self.connections.write();
            let owner = connections
                .get(&client_id)
                .is_some_and(|h| h.connection_id == connection_id);
            if owner {
                connections.remove(&client_id);
            }

            if !clean_session {
                let mut record = SessionRecord {
                    subscriptions,
                    inflight,
                    will: will.clone(),
                    disconnected_at: Some(Instant::now()),
                    ..SessionRecord::new(client_id.clone(), false)
                };
                for message in queued {
                    record.enqueue(message, self.config.limits.max_queued);
                }
                self.sessions.persist(record);
            }
            owner
        };

        if clean_session && owner {
            self.subscriptions.write().remove_session(&client_id);
            self.sessions.discard(&client_id);
        }

        log::debug!(
            "Client {} disconnected (graceful={}, clean_session={})",
            client_id,
            graceful,
            clean_session
        );

        if !graceful && owner {
            if let Some(will) = will {
                log::debug!("Publishing will of {} on {}", client_id, will.topic);
                self.publish(will_to_publish(&will), &client_id);
            }
        }
    }

    /// Drop persistent sessions offline for longer than the configured
    /// expiry. Returns how many were removed.
    pub fn expire_sessions(&self, now: Instant) -> usize {
        let Some(expiry) = self.config.session.expiry() else {
            return 0;
        };
        // Held across expiry and removal so a reconnect cannot subscribe
        // in between and lose its subscriptions to the sweep
        let mut subscriptions = self.subscriptions.write();
        let connections = self.connections.read();
        let expired = self.sessions.expire(now, expiry);
        for client_id in &expired {
            if connections.contains_key(client_id) {
                log::debug!("Session {} expired while connected, keeping subscriptions", client_id);
                continue;
            }
            subscriptions.remove_session(client_id);
        }
        if !expired.is_empty() {
            log::info!("Expired {} offline sessions", expired.len());
        }
        expired.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }

    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        self.subscriptions.read().subscriptions_of(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn broker() -> Broker {
        Broker::new(Config::default())
    }

    async fn connect(broker: &Broker, client_id: &str, clean: bool) -> (ConnectionHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (handle, rx) = broker.register();
        match broker.connect(&Connect::new(client_id, 30, clean), &handle).await {
            ConnectOutcome::Accepted { .. } => {}
            ConnectOutcome::Rejected(code) => panic!("rejected: {:?}", code),
        }
        (handle, rx)
    }

    fn departure(client_id: &str, handle: &ConnectionHandle, clean: bool, graceful: bool) -> Departure {
        Departure {
            client_id: client_id.into(),
            connection_id: handle.connection_id,
            clean_session: clean,
            graceful,
            will: None,
            inflight: InFlightState::default(),
            queued: Vec::new(),
        }
    }

    fn next_publish(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Publish {
        match rx.try_recv() {
            Ok(Delivery::Publish(p)) => p,
            other => panic!("expected publish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_client_id_rules() {
        let broker = broker();
        let (handle, _rx) = broker.register();
        let outcome = broker.connect(&Connect::new("", 30, false), &handle).await;
        assert!(matches!(
            outcome,
            ConnectOutcome::Rejected(ConnackCode::IdentifierRejected)
        ));

        let outcome = broker.connect(&Connect::new("", 30, true), &handle).await;
        match outcome {
            ConnectOutcome::Accepted { client_id, .. } => assert!(client_id.starts_with("mqflow-")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let broker = Broker::new(config);
        let _a = connect(&broker, "a", true).await;

        let (handle, _rx) = broker.register();
        let outcome = broker.connect(&Connect::new("b", 30, true), &handle).await;
        assert!(matches!(
            outcome,
            ConnectOutcome::Rejected(ConnackCode::ServerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_fanout_clears_retain_and_caps_qos() {
        let broker = broker();
        let (_ha, mut rx_a) = connect(&broker, "a", true).await;
        let (_hb, mut rx_b) = connect(&broker, "b", true).await;
        broker.subscribe("a", &[("t/#".into(), QoS::AtLeastOnce)]);
        broker.subscribe("b", &[("t/x".into(), QoS::AtMostOnce)]);

        let routed = broker.publish(Publish::new("t/x", "hi", QoS::ExactlyOnce, true), "c");
        assert_eq!(routed, 2);

        let to_a = next_publish(&mut rx_a);
        assert_eq!(to_a.qos, QoS::AtLeastOnce);
        assert!(!to_a.retain);
        assert_eq!(next_publish(&mut rx_b).qos, QoS::AtMostOnce);
        assert_eq!(broker.retained_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_returns_retained() {
        let broker = broker();
        broker.publish(Publish::new("s/1", "on", QoS::ExactlyOnce, true), "p");
        broker.publish(Publish::new("s/2", "off", QoS::AtMostOnce, true), "p");
        let _a = connect(&broker, "a", true).await;

        let (codes, retained) = broker.subscribe(
            "a",
            &[("s/+".into(), QoS::AtLeastOnce), ("bad/#/x".into(), QoS::AtMostOnce)],
        );
        assert_eq!(
            codes,
            vec![SubscribeReturnCode::Granted(QoS::AtLeastOnce), SubscribeReturnCode::Failure]
        );
        assert_eq!(retained.len(), 2);
        assert!(retained.iter().all(|p| p.retain));
        assert_eq!(retained[0].qos, QoS::AtLeastOnce);
        assert_eq!(retained[1].qos, QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_wildcards_disabled() {
        let mut config = Config::default();
        config.mqtt.wildcard_subscriptions = false;
        let broker = Broker::new(config);
        let (codes, _) = broker.subscribe(
            "a",
            &[("a/+".into(), QoS::AtMostOnce), ("a/b".into(), QoS::AtMostOnce)],
        );
        assert_eq!(codes[0], SubscribeReturnCode::Failure);
        assert_eq!(codes[1], SubscribeReturnCode::Granted(QoS::AtMostOnce));
    }

    #[tokio::test]
    async fn test_offline_queue_and_resume() {
        let broker = broker();
        let (handle, _rx) = connect(&broker, "p", false).await;
        broker.subscribe("p", &[("q".into(), QoS::AtLeastOnce)]);
        broker.disconnect(departure("p", &handle, false, true));
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(broker.session_count(), 1);

        broker.publish(Publish::new("q", "0", QoS::AtMostOnce, false), "x");
        broker.publish(Publish::new("q", "1", QoS::AtLeastOnce, false), "x");

        let (handle, _rx) = broker.register();
        match broker.connect(&Connect::new("p", 30, false), &handle).await {
            ConnectOutcome::Accepted {
                session_present,
                queued,
                ..
            } => {
                assert!(session_present);
                assert_eq!(queued.len(), 1);
                assert_eq!(queued[0].payload, Bytes::from_static(b"1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(broker.subscriptions_of("p").len(), 1);
    }

    #[tokio::test]
    async fn test_clean_disconnect_drops_subscriptions() {
        let broker = broker();
        let (handle, _rx) = connect(&broker, "c", true).await;
        broker.subscribe("c", &[("q".into(), QoS::AtLeastOnce)]);
        broker.disconnect(departure("c", &handle, true, true));
        assert!(broker.subscriptions_of("c").is_empty());
        assert_eq!(broker.session_count(), 0);
        assert_eq!(broker.publish(Publish::new("q", "x", QoS::AtLeastOnce, false), "x"), 0);
    }

    #[tokio::test]
    async fn test_will_only_on_abnormal_close() {
        let broker = broker();
        let (_hw, mut watcher) = connect(&broker, "w", true).await;
        broker.subscribe("w", &[("status/#".into(), QoS::AtMostOnce)]);

        let will = Will {
            topic: "status/d".into(),
            message: Bytes::from_static(b"lost"),
            qos: QoS::AtMostOnce,
            retain: false,
        };

        let (handle, _rx) = connect(&broker, "d", true).await;
        let mut dep = departure("d", &handle, true, true);
        dep.will = Some(will.clone());
        broker.disconnect(dep);
        assert!(watcher.try_recv().is_err());

        let (handle, _rx) = connect(&broker, "d", true).await;
        let mut dep = departure("d", &handle, true, false);
        dep.will = Some(will);
        broker.disconnect(dep);
        assert_eq!(next_publish(&mut watcher).payload, Bytes::from_static(b"lost"));
    }

    #[tokio::test]
    async fn test_takeover_notifies_previous_connection() {
        let broker = Arc::new(broker());
        let (old, mut old_rx) = connect(&broker, "dup", false).await;

        let old_task = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                match old_rx.recv().await {
                    Some(Delivery::Takeover(ack)) => {
                        broker.disconnect(departure("dup", &old, false, false));
                        let _ = ack.send(());
                    }
                    other => panic!("expected takeover, got {:?}", other),
                }
            })
        };

        let (new, _rx) = broker.register();
        let outcome = broker.connect(&Connect::new("dup", 30, false), &new).await;
        assert!(matches!(
            outcome,
            ConnectOutcome::Accepted {
                session_present: true,
                ..
            }
        ));
        old_task.await.unwrap();
        assert_eq!(broker.connection_count(), 1);
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_departure_does_not_unregister() {
        let broker = broker();
        let (old, _old_rx) = broker.register();
        let (new, _new_rx) = connect(&broker, "s", true).await;
        assert_ne!(old.connection_id, new.connection_id);

        broker.disconnect(departure("s", &old, true, false));
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_expire_sessions() {
        let mut config = Config::default();
        config.session.session_expiry = 10;
        let broker = Broker::new(config);
        let (handle, _rx) = connect(&broker, "e", false).await;
        broker.subscribe("e", &[("t".into(), QoS::AtLeastOnce)]);
        broker.disconnect(departure("e", &handle, false, true));

        assert_eq!(broker.expire_sessions(Instant::now()), 0);
        assert_eq!(broker.expire_sessions(Instant::now() + Duration::from_secs(11)), 1);
        assert!(broker.subscriptions_of("e").is_empty());
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn test_expiry_keeps_subscriptions_of_reconnected_client() {
        let mut config = Config::default();
        config.session.session_expiry = 10;
        let broker = Broker::new(config);

        // A stale record left behind while the client is connected again
        let (_handle, mut rx) = connect(&broker, "p", false).await;
        broker.subscribe("p", &[("q".into(), QoS::AtLeastOnce)]);
        broker.sessions.persist(SessionRecord {
            disconnected_at: Some(Instant::now()),
            ..SessionRecord::new("p", false)
        });

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(broker.expire_sessions(later), 1);
        assert_eq!(broker.subscriptions_of("p"), vec![("q".to_string(), QoS::AtLeastOnce)]);
        assert_eq!(broker.publish(Publish::new("q", "x", QoS::AtLeastOnce, false), "x"), 1);
        assert_eq!(next_publish(&mut rx).payload, Bytes::from_static(b"x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_aborts_unresponsive_connection() {
        let broker = Arc::new(broker());
        let (old, mut old_rx) = connect(&broker, "stuck", false).await;

        // Ignores the takeover request until aborted, then hands over
        let old_task = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                old.aborted().await;
                broker.disconnect(departure("stuck", &old, false, true));
                match old_rx.try_recv() {
                    Ok(Delivery::Takeover(ack)) => {
                        let _ = ack.send(());
                    }
                    other => panic!("expected takeover, got {:?}", other),
                }
            })
        };

        let (new, _rx) = broker.register();
        let outcome = broker.connect(&Connect::new("stuck", 30, false), &new).await;
        assert!(matches!(
            outcome,
            ConnectOutcome::Accepted {
                session_present: true,
                ..
            }
        ));
        old_task.await.unwrap();
        assert_eq!(broker.connection_count(), 1);
    }
}
