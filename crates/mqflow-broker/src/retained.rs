//! Retained message store.

use std::time::Instant;

use ahash::AHashMap;

use mqflow_core::topic::topic_matches_filter;
use mqflow_core::Publish;

/// A retained message with the time it was stored.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub publish: Publish,
    pub stored_at: Instant,
}

/// Last retained message per topic.
#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: AHashMap<String, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `publish` as the retained message for its topic.
    ///
    /// An empty payload clears the topic instead. Returns whether the
    /// store changed.
    pub fn store(&mut self, publish: &Publish) -> bool {
        if publish.payload.is_empty() {
            return self.messages.remove(&publish.topic).is_some();
        }

        let mut stored = publish.clone();
        stored.dup = false;
        stored.retain = true;
        stored.packet_id = None;
        self.messages.insert(
            publish.topic.clone(),
            RetainedMessage {
                publish: stored,
                stored_at: Instant::now(),
            },
        );
        true
    }

    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.messages.get(topic)
    }

    /// Retained messages whose topic matches `filter`, sorted by topic.
    pub fn matching(&self, filter: &str) -> Vec<Publish> {
        let mut found: Vec<Publish> = self
            .messages
            .iter()
            .filter(|(topic, _)| topic_matches_filter(topic, filter))
            .map(|(_, msg)| msg.publish.clone())
            .collect();
        found.sort_by(|a, b| a.topic.cmp(&b.topic));
        found
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
