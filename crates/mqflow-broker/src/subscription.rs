//! Subscription registry with trie-based topic matching.

use std::sync::Arc;

use ahash::AHashMap;

use mqflow_core::QoS;

/// Subscriber entry stored in the trie.
#[derive(Debug, Clone)]
struct Subscriber {
    client_id: Arc<str>,
    qos: QoS,
}

/// A node in the subscription trie.
#[derive(Debug, Default)]
struct TrieNode {
    /// Subscribers whose filter ends exactly at this node.
    subscribers: Vec<Subscriber>,
    /// Child nodes by topic level.
    children: AHashMap<String, TrieNode>,
    /// Single-level wildcard (+) child.
    single_wildcard: Option<Box<TrieNode>>,
    /// Multi-level wildcard (#) subscribers.
    multi_wildcard: Vec<Subscriber>,
}

fn upsert(list: &mut Vec<Subscriber>, subscriber: Subscriber) {
    match list.iter_mut().find(|s| s.client_id == subscriber.client_id) {
        Some(existing) => existing.qos = subscriber.qos,
        None => list.push(subscriber),
    }
}

fn remove_from(list: &mut Vec<Subscriber>, client_id: &str) -> bool {
    let before = list.len();
    list.retain(|s| &*s.client_id != client_id);
    list.len() != before
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
            && self.multi_wildcard.is_empty()
            && self.children.is_empty()
            && self.single_wildcard.is_none()
    }

    fn insert(&mut self, levels: &[&str], subscriber: Subscriber) {
        let Some((&level, remaining)) = levels.split_first() else {
            upsert(&mut self.subscribers, subscriber);
            return;
        };

        match level {
            // '#' is always the last level of a valid filter
            "#" => upsert(&mut self.multi_wildcard, subscriber),
            "+" => self
                .single_wildcard
                .get_or_insert_with(Default::default)
                .insert(remaining, subscriber),
            _ => self
                .children
                .entry(level.to_string())
                .or_default()
                .insert(remaining, subscriber),
        }
    }

    /// Remove one subscription and prune nodes left empty.
    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        let Some((&level, remaining)) = levels.split_first() else {
            return remove_from(&mut self.subscribers, client_id);
        };

        match level {
            "#" => remove_from(&mut self.multi_wildcard, client_id),
            "+" => {
                let Some(child) = self.single_wildcard.as_mut() else {
                    return false;
                };
                let removed = child.remove(remaining, client_id);
                if child.is_empty() {
                    self.single_wildcard = None;
                }
                removed
            }
            _ => {
                let Some(child) = self.children.get_mut(level) else {
                    return false;
                };
                let removed = child.remove(remaining, client_id);
                if child.is_empty() {
                    self.children.remove(level);
                }
                removed
            }
        }
    }

    fn collect(&self, levels: &[&str], is_root: bool, result: &mut Vec<Subscriber>) {
        // MQTT-4.7.2-1: wildcards at the first level never match '$' topics
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            // '#' also matches the parent level itself ("a/#" matches "a")
            result.extend(self.multi_wildcard.iter().cloned());
        }

        let Some((&level, remaining)) = levels.split_first() else {
            result.extend(self.subscribers.iter().cloned());
            return;
        };

        if !skip_wildcards && !level.is_empty() {
            if let Some(child) = &self.single_wildcard {
                child.collect(remaining, false, result);
            }
        }

        if let Some(child) = self.children.get(level) {
            child.collect(remaining, false, result);
        }
    }
}

/// All subscriptions of all sessions.
///
/// Holds at most one subscription per (session, filter); subscribing again
/// to the same filter replaces the granted QoS.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    root: TrieNode,
    /// Filters per session, for unsubscribe-all and session snapshots.
    by_session: AHashMap<Arc<str>, AHashMap<String, QoS>>,
    max_qos: QoS,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(QoS::ExactlyOnce)
    }
}

impl SubscriptionRegistry {
    /// An empty registry granting at most `max_qos`.
    pub fn new(max_qos: QoS) -> Self {
        Self {
            root: TrieNode::default(),
            by_session: AHashMap::new(),
            max_qos,
        }
    }

    /// Add or replace a subscription. Returns the granted QoS.
    ///
    /// The filter must already be valid.
    pub fn subscribe(&mut self, client_id: &Arc<str>, filter: &str, qos: QoS) -> QoS {
        let granted = qos.min(self.max_qos);
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.insert(
            &levels,
            Subscriber {
                client_id: Arc::clone(client_id),
                qos: granted,
            },
        );
        self.by_session
            .entry(Arc::clone(client_id))
            .or_default()
            .insert(filter.to_string(), granted);
        granted
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let removed = self.root.remove(&levels, client_id);
        if let Some(filters) = self.by_session.get_mut(client_id) {
            filters.remove(filter);
            if filters.is_empty() {
                self.by_session.remove(client_id);
            }
        }
        removed
    }

    /// Remove every subscription of a session.
    pub fn remove_session(&mut self, client_id: &str) {
        let Some(filters) = self.by_session.remove(client_id) else {
            return;
        };
        for filter in filters.keys() {
            let levels: Vec<&str> = filter.split('/').collect();
            self.root.remove(&levels, client_id);
        }
    }

    /// Sessions that receive a message published on `topic` at
    /// `publish_qos`, each once, with the QoS to deliver at.
    ///
    /// A session with several matching filters gets the highest granted
    /// QoS among them, then capped by the publish QoS.
    pub fn match_topic(&self, topic: &str, publish_qos: QoS) -> Vec<(Arc<str>, QoS)> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut hits = Vec::new();
        self.root.collect(&levels, true, &mut hits);

        let mut best: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(hits.len());
        for hit in hits {
            best.entry(hit.client_id)
                .and_modify(|q| *q = (*q).max(hit.qos))
                .or_insert(hit.qos);
        }
        best.into_iter()
            .map(|(client_id, qos)| (client_id, qos.min(publish_qos)))
            .collect()
    }

    /// The filters a session holds, sorted by filter.
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<(String, QoS)> {
        let mut subs: Vec<(String, QoS)> = self
            .by_session
            .get(client_id)
            .map(|filters| filters.iter().map(|(f, q)| (f.clone(), *q)).collect())
            .unwrap_or_default();
        subs.sort();
        subs
    }

    /// Number of sessions holding at least one subscription.
    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}
