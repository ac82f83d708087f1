//! Packet identifier allocation and in-flight tracking.
//!
//! One tracker covers one direction of one connection. The same handshake
//! machine serves both directions:
//! - outbound QoS 2: PUBREC moves `Published -> Received`, sending PUBREL
//!   moves `Received -> Released`, PUBCOMP completes.
//! - inbound QoS 2: sending PUBREC moves `Published -> Received`, the peer's
//!   PUBREL moves `Received -> Released`, sending PUBCOMP completes.
//!
//! Implements:
//! - [MQTT-2.3.1-2] a new packet uses a currently unused identifier
//! - [MQTT-2.3.1-3] a re-sent packet keeps its identifier
//! - [MQTT-4.6.0-1] re-sends happen in the original send order

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use thiserror::Error;

use crate::error::Error;
use crate::packet::{Packet, QoS};

/// Highest packet identifier.
pub const MAX_PACKET_ID: u16 = u16::MAX;

/// Handshake stage of an in-flight entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Published,
    Received,
    Released,
    Completed,
}

/// Acknowledgment applied to an in-flight entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Suback,
    Unsuback,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AckKind::Puback => "PUBACK",
            AckKind::Pubrec => "PUBREC",
            AckKind::Pubrel => "PUBREL",
            AckKind::Pubcomp => "PUBCOMP",
            AckKind::Suback => "SUBACK",
            AckKind::Unsuback => "UNSUBACK",
        };
        f.write_str(s)
    }
}

/// Result of a successful [`PacketIdTracker::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Handshake finished; the entry was removed and its identifier freed.
    Completed(InFlight),
    /// Handshake moved forward to the given stage.
    StillPending(Stage),
}

/// Tracker misuse or an acknowledgment the handshake does not allow.
///
/// Returned without any change to the tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("packet identifier {0} is not in flight")]
    UnknownId(u16),

    #[error("unexpected {ack} for packet identifier {packet_id} in stage {stage:?}")]
    UnexpectedAck {
        packet_id: u16,
        stage: Stage,
        ack: AckKind,
    },

    #[error("packet identifier {0} is already in flight")]
    InUse(u16),

    #[error("packet identifier 0 is not allowed")]
    ZeroId,

    #[error("{0:?} cannot be tracked")]
    Untrackable(crate::packet::PacketType),
}

impl From<TrackError> for Error {
    fn from(e: TrackError) -> Self {
        Error::ProtocolViolation(e.to_string())
    }
}

/// One packet awaiting the rest of its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub packet_id: u16,
    /// Packet as originally sent or received.
    pub packet: Packet,
    pub stage: Stage,
    /// Last time the packet (or its PUBREL) went out.
    pub sent_at: Instant,
    /// Times the packet has been written to a transport.
    pub send_count: u32,
    /// Registration order within the tracker.
    seq: u64,
}

impl InFlight {
    /// Whether a reconnect should re-offer this entry.
    pub fn is_resend_eligible(&self) -> bool {
        self.stage != Stage::Completed
    }

    /// Packet to write when re-offering this entry after a reconnect.
    ///
    /// Publishes not yet acknowledged go out again with dup set; a QoS 2
    /// exchange past PUBREC resumes with PUBREL.
    pub fn resend_packet(&self) -> Packet {
        match (&self.packet, self.stage) {
            (Packet::Publish(publish), Stage::Published) => {
                let mut publish = publish.clone();
                publish.dup = true;
                Packet::Publish(publish)
            }
            (Packet::Publish(_), _) => Packet::Pubrel {
                packet_id: self.packet_id,
            },
            (packet, _) => packet.clone(),
        }
    }
}

/// Per-connection identifier allocator and in-flight table.
#[derive(Debug, Default)]
pub struct PacketIdTracker {
    /// Identifiers handed out or registered and not yet released.
    in_use: BTreeSet<u16>,
    entries: BTreeMap<u16, InFlight>,
    /// Every identifier below this one is in use.
    free_hint: u16,
    next_seq: u64,
}

impl PacketIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the lowest free non-zero identifier.
    pub fn allocate(&mut self) -> Result<u16, Error> {
        let start = self.free_hint.max(1);
        let mut candidate = u32::from(start);
        for &id in self.in_use.range(start..) {
            if u32::from(id) != candidate {
                break;
            }
            candidate += 1;
        }
        let id = u16::try_from(candidate).map_err(|_| {
            self.free_hint = MAX_PACKET_ID;
            Error::IdentifierExhausted
        })?;
        self.in_use.insert(id);
        self.free_hint = id.saturating_add(1);
        Ok(id)
    }

    /// Store an in-flight entry for `id` in stage `Published`.
    ///
    /// `id` may come from [`allocate`](Self::allocate) or from the peer.
    pub fn register(&mut self, id: u16, packet: Packet, now: Instant) -> Result<(), TrackError> {
        if id == 0 {
            return Err(TrackError::ZeroId);
        }
        match &packet {
            Packet::Publish(p) if p.qos != QoS::AtMostOnce => {}
            Packet::Subscribe(_) | Packet::Unsubscribe(_) => {}
            other => return Err(TrackError::Untrackable(other.packet_type())),
        }
        if self.entries.contains_key(&id) {
            return Err(TrackError::InUse(id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_use.insert(id);
        self.entries.insert(
            id,
            InFlight {
                packet_id: id,
                packet,
                stage: Stage::Published,
                sent_at: now,
                send_count: 1,
                seq,
            },
        );
        Ok(())
    }

    /// Apply an acknowledgment to the entry for `id`.
    ///
    /// Errors leave the tracker untouched.
    pub fn advance(&mut self, id: u16, ack: AckKind) -> Result<Advance, TrackError> {
        let entry = self.entries.get_mut(&id).ok_or(TrackError::UnknownId(id))?;

        let next = match (&entry.packet, entry.stage, ack) {
            (Packet::Publish(p), Stage::Published, AckKind::Puback) if p.qos == QoS::AtLeastOnce => {
                Stage::Completed
            }
            (Packet::Publish(p), stage, ack) if p.qos == QoS::ExactlyOnce => match (stage, ack) {
                (Stage::Published, AckKind::Pubrec) => Stage::Received,
                (Stage::Received, AckKind::Pubrel) => Stage::Released,
                (Stage::Released, AckKind::Pubcomp) => Stage::Completed,
                _ => {
                    return Err(TrackError::UnexpectedAck {
                        packet_id: id,
                        stage,
                        ack,
                    })
                }
            },
            (Packet::Subscribe(_), Stage::Published, AckKind::Suback)
            | (Packet::Unsubscribe(_), Stage::Published, AckKind::Unsuback) => Stage::Completed,
            (_, stage, ack) => {
                return Err(TrackError::UnexpectedAck {
                    packet_id: id,
                    stage,
                    ack,
                })
            }
        };

        if next == Stage::Completed {
            let mut done = self.release(id).ok_or(TrackError::UnknownId(id))?;
            done.stage = Stage::Completed;
            return Ok(Advance::Completed(done));
        }
        entry.stage = next;
        Ok(Advance::StillPending(next))
    }

    /// Free `id`, returning its entry if one was registered.
    pub fn release(&mut self, id: u16) -> Option<InFlight> {
        if self.in_use.remove(&id) && id < self.free_hint {
            self.free_hint = id;
        }
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&InFlight> {
        self.entries.get(&id)
    }

    pub fn stage(&self, id: u16) -> Option<Stage> {
        self.entries.get(&id).map(|e| e.stage)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.entries.contains_key(&id)
    }

    /// Whether `id` is reserved or registered.
    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in identifier order.
    pub fn in_flight(&self) -> impl Iterator<Item = &InFlight> {
        self.entries.values()
    }

    /// Entries in the order they were registered.
    pub fn resend_order(&self) -> Vec<&InFlight> {
        let mut entries: Vec<&InFlight> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Record that the entry for `id` went out again.
    pub fn mark_resent(&mut self, id: u16, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.sent_at = now;
            entry.send_count += 1;
        }
    }

    /// Send time of the longest-waiting entry.
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.sent_at).min()
    }

    /// Remove every entry, returned in registration order.
    pub fn drain_pending(&mut self) -> Vec<InFlight> {
        let mut entries: Vec<InFlight> = std::mem::take(&mut self.entries).into_values().collect();
        entries.sort_by_key(|e| e.seq);
        self.in_use.clear();
        self.free_hint = 1;
        entries
    }

    /// Load entries taken from an earlier connection, keeping their order.
    ///
    /// Stages and identifiers are kept; registration order follows the
    /// order of `entries`.
    pub fn restore(&mut self, entries: Vec<InFlight>) -> Result<(), TrackError> {
        for mut entry in entries {
            if entry.packet_id == 0 {
                return Err(TrackError::ZeroId);
            }
            if self.entries.contains_key(&entry.packet_id) {
                return Err(TrackError::InUse(entry.packet_id));
            }
            entry.seq = self.next_seq;
            self.next_seq += 1;
            self.in_use.insert(entry.packet_id);
            self.entries.insert(entry.packet_id, entry);
        }
        Ok(())
    }

    /// Forget everything (clean session).
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.entries.clear();
        self.free_hint = 1;
        self.next_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Publish, Subscribe, Unsubscribe};

    fn publish(qos: QoS, id: u16) -> Packet {
        Packet::Publish(Publish {
            packet_id: Some(id),
            ..Publish::new("t", &b"x"[..], qos, false)
        })
    }

    fn track(tracker: &mut PacketIdTracker, qos: QoS) -> u16 {
        let id = tracker.allocate().unwrap();
        tracker.register(id, publish(qos, id), Instant::now()).unwrap();
        id
    }

    #[test]
    fn test_allocate_lowest_free() {
        let mut tracker = PacketIdTracker::new();
        assert_eq!(tracker.allocate().unwrap(), 1);
        assert_eq!(tracker.allocate().unwrap(), 2);
        assert_eq!(tracker.allocate().unwrap(), 3);
        tracker.release(2);
        assert_eq!(tracker.allocate().unwrap(), 2);
        assert_eq!(tracker.allocate().unwrap(), 4);
    }

    #[test]
    fn test_exhaustion() {
        let mut tracker = PacketIdTracker::new();
        for expected in 1..=MAX_PACKET_ID {
            assert_eq!(tracker.allocate().unwrap(), expected);
        }
        assert!(matches!(tracker.allocate(), Err(Error::IdentifierExhausted)));

        tracker.release(40_000);
        assert_eq!(tracker.allocate().unwrap(), 40_000);
    }

    #[test]
    fn test_identifier_uniqueness_under_churn() {
        let mut tracker = PacketIdTracker::new();
        let mut live: Vec<u16> = Vec::new();
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;

        for _ in 0..20_000 {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let release = (state >> 33) % 3 == 0;
            if release && !live.is_empty() {
                let idx = (state >> 40) as usize % live.len();
                let id = live.swap_remove(idx);
                assert!(tracker.release(id).is_some());
            } else {
                let id = track(&mut tracker, QoS::AtLeastOnce);
                assert!(!live.contains(&id), "identifier {} handed out twice", id);
                live.push(id);
            }
            assert_eq!(tracker.len(), live.len());
        }
    }

    #[test]
    fn test_qos1_completes_on_puback_only() {
        let mut tracker = PacketIdTracker::new();
        let id = track(&mut tracker, QoS::AtLeastOnce);

        for ack in [AckKind::Pubrec, AckKind::Pubrel, AckKind::Pubcomp, AckKind::Suback] {
            assert!(matches!(
                tracker.advance(id, ack),
                Err(TrackError::UnexpectedAck { .. })
            ));
            assert_eq!(tracker.stage(id), Some(Stage::Published));
        }

        match tracker.advance(id, AckKind::Puback).unwrap() {
            Advance::Completed(entry) => {
                assert_eq!(entry.packet_id, id);
                assert_eq!(entry.stage, Stage::Completed);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(!tracker.is_in_use(id));

        // A second PUBACK finds nothing
        assert_eq!(
            tracker.advance(id, AckKind::Puback),
            Err(TrackError::UnknownId(id))
        );
    }

    #[test]
    fn test_qos2_moves_forward_only() {
        let mut tracker = PacketIdTracker::new();
        let id = track(&mut tracker, QoS::ExactlyOnce);

        // PUBCOMP before PUBREC
        assert!(tracker.advance(id, AckKind::Pubcomp).is_err());
        assert_eq!(tracker.stage(id), Some(Stage::Published));

        assert_eq!(
            tracker.advance(id, AckKind::Pubrec).unwrap(),
            Advance::StillPending(Stage::Received)
        );
        // Duplicate PUBREC does not move backwards or forwards
        assert!(tracker.advance(id, AckKind::Pubrec).is_err());
        assert_eq!(tracker.stage(id), Some(Stage::Received));

        assert!(tracker.advance(id, AckKind::Pubcomp).is_err());
        assert_eq!(
            tracker.advance(id, AckKind::Pubrel).unwrap(),
            Advance::StillPending(Stage::Released)
        );
        assert!(tracker.advance(id, AckKind::Puback).is_err());
        assert_eq!(tracker.stage(id), Some(Stage::Released));

        assert!(matches!(
            tracker.advance(id, AckKind::Pubcomp).unwrap(),
            Advance::Completed(_)
        ));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_subscribe_and_unsubscribe_acks() {
        let mut tracker = PacketIdTracker::new();
        let now = Instant::now();
        let sub_id = tracker.allocate().unwrap();
        tracker
            .register(
                sub_id,
                Packet::Subscribe(Subscribe {
                    packet_id: sub_id,
                    filters: vec![("a/#".into(), QoS::AtLeastOnce)],
                }),
                now,
            )
            .unwrap();
        let unsub_id = tracker.allocate().unwrap();
        tracker
            .register(
                unsub_id,
                Packet::Unsubscribe(Unsubscribe {
                    packet_id: unsub_id,
                    filters: vec!["a/#".into()],
                }),
                now,
            )
            .unwrap();

        assert!(tracker.advance(sub_id, AckKind::Unsuback).is_err());
        assert!(tracker.advance(unsub_id, AckKind::Suback).is_err());
        assert!(matches!(
            tracker.advance(sub_id, AckKind::Suback),
            Ok(Advance::Completed(_))
        ));
        assert!(matches!(
            tracker.advance(unsub_id, AckKind::Unsuback),
            Ok(Advance::Completed(_))
        ));
    }

    #[test]
    fn test_register_rejects_duplicates_and_qos0() {
        let mut tracker = PacketIdTracker::new();
        let now = Instant::now();
        tracker.register(7, publish(QoS::ExactlyOnce, 7), now).unwrap();
        assert_eq!(
            tracker.register(7, publish(QoS::ExactlyOnce, 7), now),
            Err(TrackError::InUse(7))
        );
        assert_eq!(
            tracker.register(0, publish(QoS::AtLeastOnce, 0), now),
            Err(TrackError::ZeroId)
        );
        let qos0 = Packet::Publish(Publish::new("t", &b""[..], QoS::AtMostOnce, false));
        assert!(matches!(
            tracker.register(8, qos0, now),
            Err(TrackError::Untrackable(_))
        ));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_resend_order_and_dup() {
        let mut tracker = PacketIdTracker::new();
        let first = track(&mut tracker, QoS::ExactlyOnce);
        let second = track(&mut tracker, QoS::AtLeastOnce);
        tracker.release(first);
        // Reuses identifier 1 but is registered last
        let third = track(&mut tracker, QoS::ExactlyOnce);
        assert_eq!(third, first);
        tracker.advance(third, AckKind::Pubrec).unwrap();

        let order: Vec<u16> = tracker.resend_order().iter().map(|e| e.packet_id).collect();
        assert_eq!(order, vec![second, third]);

        let resend: Vec<Packet> = tracker
            .resend_order()
            .iter()
            .map(|e| e.resend_packet())
            .collect();
        match &resend[0] {
            Packet::Publish(p) => assert!(p.dup),
            other => panic!("expected publish, got {:?}", other),
        }
        assert_eq!(resend[1], Packet::Pubrel { packet_id: third });
    }

    #[test]
    fn test_drain_and_restore_keep_order() {
        let mut tracker = PacketIdTracker::new();
        let ids: Vec<u16> = (0..5).map(|_| track(&mut tracker, QoS::AtLeastOnce)).collect();
        tracker.release(ids[1]);

        let drained = tracker.drain_pending();
        assert!(tracker.is_empty());
        assert!(!tracker.is_in_use(ids[0]));

        let mut next = PacketIdTracker::new();
        next.restore(drained).unwrap();
        let order: Vec<u16> = next.resend_order().iter().map(|e| e.packet_id).collect();
        assert_eq!(order, vec![ids[0], ids[2], ids[3], ids[4]]);

        // Restored identifiers stay reserved
        assert_eq!(next.allocate().unwrap(), ids[1]);
        assert_eq!(next.allocate().unwrap(), 6);
    }

    #[test]
    fn test_mark_resent() {
        let mut tracker = PacketIdTracker::new();
        let start = Instant::now();
        let id = tracker.allocate().unwrap();
        tracker.register(id, publish(QoS::AtLeastOnce, id), start).unwrap();

        let later = start + std::time::Duration::from_secs(3);
        tracker.mark_resent(id, later);
        let entry = tracker.get(id).unwrap();
        assert_eq!(entry.send_count, 2);
        assert_eq!(tracker.oldest_sent_at(), Some(later));
    }
}
