//! Session store for persistent (clean_session = false) sessions.
//!
//! A record lives in the store only while its client is offline: resolving
//! a session on CONNECT takes the record out, disconnecting puts it back.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use mqflow_core::{InFlightState, Publish, QoS, Will};

/// Everything the broker keeps about one session between connections.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub client_id: String,
    pub clean_session: bool,
    /// Subscriptions held when the session went offline.
    pub subscriptions: Vec<(String, QoS)>,
    /// In-flight exchanges, outbound in send order.
    pub inflight: InFlightState,
    /// QoS 1/2 messages that arrived while offline, oldest first.
    pub queued: VecDeque<Publish>,
    /// Will of the last connection, kept for inspection only.
    pub will: Option<Will>,
    pub disconnected_at: Option<Instant>,
}

impl SessionRecord {
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            subscriptions: Vec::new(),
            inflight: InFlightState::default(),
            queued: VecDeque::new(),
            will: None,
            disconnected_at: None,
        }
    }

    /// Queue a message, dropping the oldest when `max_queued` is reached.
    ///
    /// QoS 0 messages are never queued. Returns whether the message was kept.
    pub fn enqueue(&mut self, publish: Publish, max_queued: usize) -> bool {
        if publish.qos == QoS::AtMostOnce || max_queued == 0 {
            return false;
        }
        while self.queued.len() >= max_queued {
            if let Some(dropped) = self.queued.pop_front() {
                log::debug!(
                    "Session {} queue full, dropping message on {}",
                    self.client_id,
                    dropped.topic
                );
            }
        }
        self.queued.push_back(publish);
        true
    }
}

/// Result of looking up a session on CONNECT.
#[derive(Debug)]
pub enum Resolved {
    /// A stored session was reattached.
    Existing(SessionRecord),
    /// No usable session; a fresh one starts.
    New(SessionRecord),
}

impl Resolved {
    pub fn session_present(&self) -> bool {
        matches!(self, Resolved::Existing(_))
    }

    pub fn into_record(self) -> SessionRecord {
        match self {
            Resolved::Existing(record) | Resolved::New(record) => record,
        }
    }
}

/// Storage for offline sessions.
///
/// Durability is up to the implementation; [`MemorySessionStore`] keeps
/// records for the lifetime of the process.
pub trait SessionStore: Send + Sync {
    /// Take the session for a connecting client.
    ///
    /// With `clean_session` any stored record is discarded and a new one is
    /// returned; otherwise a stored record is reattached if present.
    fn resolve(&self, client_id: &str, clean_session: bool) -> Resolved;

    /// Store a record for a client that went offline.
    fn persist(&self, record: SessionRecord);

    /// Drop a stored record.
    fn discard(&self, client_id: &str) -> Option<SessionRecord>;

    /// Queue a message for an offline session. Returns false when no record
    /// exists or the message was not kept.
    fn enqueue(&self, client_id: &str, publish: Publish, max_queued: usize) -> bool;

    /// Remove records disconnected for at least `expiry`, returning their ids.
    fn expire(&self, now: Instant, expiry: Duration) -> Vec<String>;

    /// Number of stored records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<AHashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn resolve(&self, client_id: &str, clean_session: bool) -> Resolved {
        let stored = self.records.lock().remove(client_id);
        match stored {
            Some(mut record) if !clean_session => {
                record.disconnected_at = None;
                Resolved::Existing(record)
            }
            stored => {
                if stored.is_some() {
                    log::debug!("Discarding stored session for {}", client_id);
                }
                Resolved::New(SessionRecord::new(client_id, clean_session))
            }
        }
    }

    fn persist(&self, record: SessionRecord) {
        self.records.lock().insert(record.client_id.clone(), record);
    }

    fn discard(&self, client_id: &str) -> Option<SessionRecord> {
        self.records.lock().remove(client_id)
    }

    fn enqueue(&self, client_id: &str, publish: Publish, max_queued: usize) -> bool {
        match self.records.lock().get_mut(client_id) {
            Some(record) => record.enqueue(publish, max_queued),
            None => false,
        }
    }

    fn expire(&self, now: Instant, expiry: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        self.records.lock().retain(|client_id, record| {
            let keep = match record.disconnected_at {
                Some(at) => now.saturating_duration_since(at) < expiry,
                None => true,
            };
            if !keep {
                expired.push(client_id.clone());
            }
            keep
        });
        expired
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }
}
