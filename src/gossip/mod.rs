//! Gossip Sync: opportunistically fills gaps left by temporary
//! disconnections by periodically exchanging Golomb-Coded Set filters of
//! held packet keys with neighbors.

pub mod gcs;

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{GossipError, Result};
use crate::protocol::types::{Packet, PeerId};
use crate::security::packet_key;

pub use gcs::GcsFilter;

const TAG_P: u8 = 0x01;
const TAG_M: u8 = 0x02;
const TAG_FILTER: u8 = 0x03;

/// The decoded/encoded form of a REQUEST_SYNC payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub p: u8,
    pub n: u32,
    pub filter_bytes: Vec<u8>,
}

impl SyncRequest {
    /// Build a REQUEST_SYNC over `keys` targeting false-positive rate `fpr`.
    pub fn build(keys: &[[u8; 16]], fpr: f64) -> Self {
        let filter = GcsFilter::build(keys, fpr);
        Self {
            p: filter.p,
            n: filter.n,
            filter_bytes: filter.encode(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_tlv(&mut out, TAG_P, &[self.p]);
        write_tlv(&mut out, TAG_M, &self.n.to_be_bytes());
        write_tlv(&mut out, TAG_FILTER, &self.filter_bytes);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut p = None;
        let mut n = None;
        let mut filter_bytes = None;
        let mut cursor = 0usize;

        while cursor < data.len() {
            if cursor + 3 > data.len() {
                return Err(GossipError::MalformedTlv.into());
            }
            let tag = data[cursor];
            let len = u16::from_be_bytes([data[cursor + 1], data[cursor + 2]]) as usize;
            cursor += 3;
            if cursor + len > data.len() {
                return Err(GossipError::MalformedTlv.into());
            }
            let value = &data[cursor..cursor + len];
            cursor += len;

            match tag {
                TAG_P if len == 1 => p = Some(value[0]),
                TAG_M if len == 4 => {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(value);
                    n = Some(u32::from_be_bytes(buf));
                }
                TAG_FILTER => filter_bytes = Some(value.to_vec()),
                _ => return Err(GossipError::MalformedTlv.into()),
            }
        }

        Ok(Self {
            p: p.ok_or(GossipError::MalformedTlv)?,
            n: n.ok_or(GossipError::MalformedTlv)?,
            filter_bytes: filter_bytes.ok_or(GossipError::MalformedTlv)?,
        })
    }

    /// Decode the embedded filter, rejecting it if it exceeds `max_bytes`.
    pub fn decode_filter(&self, max_bytes: usize) -> Result<GcsFilter> {
        GcsFilter::decode(&self.filter_bytes, self.p, self.n, max_bytes)
    }
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

struct AnnouncementEntry {
    timestamp_ms: u64,
    packet: Packet,
}

/// Bounded, insertion-ordered store of recent broadcast MESSAGE packets.
struct MessageStore {
    order: VecDeque<[u8; 16]>,
    by_key: HashMap<[u8; 16], Packet>,
    capacity: usize,
}

impl MessageStore {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            by_key: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, key: [u8; 16], packet: Packet) {
        if self.by_key.contains_key(&key) {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.by_key.remove(&oldest);
            }
        }
        self.order.push_back(key);
        self.by_key.insert(key, packet);
    }

    fn retain_senders(&mut self, keep: impl Fn(&Packet) -> bool) {
        let mut dropped = Vec::new();
        self.by_key.retain(|key, packet| {
            let keeping = keep(packet);
            if !keeping {
                dropped.push(*key);
            }
            keeping
        });
        if !dropped.is_empty() {
            self.order.retain(|key| !dropped.contains(key));
        }
    }
}

/// Tracks the latest ANNOUNCE per sender and recent broadcast MESSAGE
/// packets, for gossip reconciliation with neighbors.
pub struct GossipStore {
    announcements: DashMap<PeerId, AnnouncementEntry>,
    messages: Mutex<MessageStore>,
}

impl GossipStore {
    pub fn new(message_capacity: usize) -> Self {
        Self {
            announcements: DashMap::new(),
            messages: Mutex::new(MessageStore::new(message_capacity)),
        }
    }

    /// Record an ANNOUNCE if it is strictly newer than any held for the same
    /// sender and within the staleness window. Returns `true` if stored.
    pub fn record_announcement(&self, packet: Packet, now_ms: u64, stale_after_ms: u64) -> bool {
        if packet.timestamp_ms + stale_after_ms < now_ms {
            return false;
        }
        match self.announcements.get(&packet.sender_id) {
            Some(existing) if existing.timestamp_ms >= packet.timestamp_ms => false,
            _ => {
                self.announcements.insert(
                    packet.sender_id,
                    AnnouncementEntry {
                        timestamp_ms: packet.timestamp_ms,
                        packet,
                    },
                );
                true
            }
        }
    }

    pub fn record_message(&self, packet: Packet) {
        let key = packet_key(&packet);
        self.messages.lock().insert(key, packet);
    }

    /// Every tracked packet keyed by its content-addressed dedup key.
    pub fn tracked_packets(&self) -> Vec<([u8; 16], Packet)> {
        let mut out: Vec<([u8; 16], Packet)> = self
            .announcements
            .iter()
            .map(|entry| (packet_key(&entry.packet), entry.packet.clone()))
            .collect();
        out.extend(
            self.messages
                .lock()
                .by_key
                .iter()
                .map(|(key, packet)| (*key, packet.clone())),
        );
        out
    }

    /// Remove announcements (and their tracked messages) older than
    /// `stale_after_ms`.
    pub fn prune(&self, now_ms: u64, stale_after_ms: u64) {
        let mut pruned_senders = Vec::new();
        self.announcements.retain(|peer_id, entry| {
            let keep = entry.timestamp_ms + stale_after_ms >= now_ms;
            if !keep {
                pruned_senders.push(*peer_id);
            }
            keep
        });
        if !pruned_senders.is_empty() {
            self.messages
                .lock()
                .retain_senders(|packet| !pruned_senders.contains(&packet.sender_id));
        }
    }

    pub fn announcement_count(&self) -> usize {
        self.announcements.len()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().by_key.len()
    }
}

/// Stateless reconciliation step: given a peer's filter, find the locally
/// held packets it is missing and prepare them for direct unicast reply,
/// stamped with `reply_ttl` (`MeshConfig::sync_ttl`).
pub fn missing_for_filter(store: &GossipStore, filter: &GcsFilter, reply_ttl: u8) -> Vec<Packet> {
    store
        .tracked_packets()
        .into_iter()
        .filter(|(key, _)| !filter.contains(key))
        .map(|(_, mut packet)| {
            packet.ttl = reply_ttl;
            packet
        })
        .collect()
}
