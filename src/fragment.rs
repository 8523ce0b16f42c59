//! Splits oversized packets into `FRAGMENT` packets for transmission over a
//! constrained link, and reassembles them on the receiving side.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;

use crate::error::{FragmentError, Result};
use crate::protocol::constants::*;
use crate::protocol::types::{Packet, PeerId};

/// Fixed size of the fragment sub-header: 8-byte fragment_id, 2-byte index,
/// 2-byte total, 1-byte original_type.
pub const FRAGMENT_PAYLOAD_HEADER_SIZE: usize = FRAGMENT_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentHeader {
    fragment_id: [u8; 8],
    index: u16,
    total: u16,
    original_type: u8,
}

impl FragmentHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.fragment_id);
        out.write_u16::<BigEndian>(self.index).expect("vec write");
        out.write_u16::<BigEndian>(self.total).expect("vec write");
        out.push(self.original_type);
    }

    fn decode(data: &[u8]) -> Result<(Self, &[u8])> {
        if data.len() < FRAGMENT_PAYLOAD_HEADER_SIZE {
            return Err(FragmentError::InconsistentMetadata.into());
        }
        let mut cursor = Cursor::new(data);
        let mut fragment_id = [0u8; 8];
        cursor
            .read_exact(&mut fragment_id)
            .map_err(|_| FragmentError::InconsistentMetadata)?;
        let index = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| FragmentError::InconsistentMetadata)?;
        let total = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| FragmentError::InconsistentMetadata)?;
        let original_type = cursor
            .read_u8()
            .map_err(|_| FragmentError::InconsistentMetadata)?;
        let rest = &data[cursor.position() as usize..];
        Ok((
            Self {
                fragment_id,
                index,
                total,
                original_type,
            },
            rest,
        ))
    }
}

/// Header fields carried through from the original packet into each fragment
/// and back into the reassembled packet.
struct OriginEnvelope {
    version: u8,
    sender_id: PeerId,
    recipient_id: Option<PeerId>,
    route: Option<Vec<PeerId>>,
    ttl: u8,
}

/// Splits a packet's encoded payload into `FRAGMENT` packets bounded by
/// `mtu`, computing per-fragment capacity from the preserved header fields.
pub struct Fragmenter;

impl Fragmenter {
    /// Split `packet`'s payload across `FRAGMENT` packets sized for `mtu`.
    /// Returns `Some(fragments)` only when the payload actually needs
    /// splitting (i.e. it wouldn't fit the codec's single-frame path).
    pub fn fragment(packet: &Packet, mtu: usize) -> Vec<Packet> {
        let envelope = OriginEnvelope {
            version: packet.version,
            sender_id: packet.sender_id,
            recipient_id: packet.recipient_id,
            route: packet.route.clone(),
            ttl: packet.ttl,
        };
        let capacity = fragment_capacity(&envelope, mtu);
        let chunks: Vec<&[u8]> = packet.payload.chunks(capacity).collect();
        let total = chunks.len() as u16;

        let mut fragment_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut fragment_id);

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let header = FragmentHeader {
                    fragment_id,
                    index: index as u16,
                    total,
                    original_type: packet.message_type,
                };
                let mut payload = Vec::with_capacity(FRAGMENT_PAYLOAD_HEADER_SIZE + chunk.len());
                header.encode(&mut payload);
                payload.extend_from_slice(chunk);
                Packet {
                    version: envelope.version,
                    message_type: MESSAGE_TYPE_FRAGMENT,
                    ttl: envelope.ttl,
                    timestamp_ms: packet.timestamp_ms,
                    sender_id: envelope.sender_id,
                    recipient_id: envelope.recipient_id,
                    route: envelope.route.clone(),
                    payload,
                    signature: None,
                }
            })
            .collect()
    }
}

/// Per-fragment data capacity, accounting for the overhead the codec's
/// header will add (version-dependent length field width, optional
/// recipient/route) plus the 13-byte fragment sub-header.
fn fragment_capacity(envelope: &OriginEnvelope, mtu: usize) -> usize {
    let mut overhead = if envelope.version == PROTOCOL_VERSION_1 {
        HEADER_SIZE_V1
    } else {
        HEADER_SIZE_V2
    };
    if envelope.recipient_id.is_some() {
        overhead += PEER_ID_SIZE;
    }
    if let Some(route) = &envelope.route {
        if !route.is_empty() {
            overhead += 1 + route.len() * PEER_ID_SIZE;
        }
    }
    overhead += FRAGMENT_PAYLOAD_HEADER_SIZE;
    mtu.saturating_sub(overhead).max(1)
}

struct PendingSet {
    total: u16,
    original_type: u8,
    envelope: OriginEnvelope,
    timestamp_ms: u64,
    received: HashMap<u16, Vec<u8>>,
    first_seen_ms: u64,
    last_seen_ms: u64,
}

/// Tracks in-flight fragment sets keyed by `(sender_id, fragment_id)` and
/// reassembles them once every index has arrived.
pub struct Reassembler {
    sets: HashMap<(PeerId, [u8; 8]), PendingSet>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            sets: HashMap::new(),
        }
    }

    /// Feed one `FRAGMENT` packet in. Returns the reassembled packet once
    /// every fragment for its set has arrived.
    pub fn accept(&mut self, packet: &Packet, now_ms: u64) -> Result<Option<Packet>> {
        let (header, data) = FragmentHeader::decode(&packet.payload)?;
        let key = (packet.sender_id, header.fragment_id);

        let set = self.sets.entry(key).or_insert_with(|| PendingSet {
            total: header.total,
            original_type: header.original_type,
            envelope: OriginEnvelope {
                version: packet.version,
                sender_id: packet.sender_id,
                recipient_id: packet.recipient_id,
                route: packet.route.clone(),
                ttl: packet.ttl,
            },
            timestamp_ms: packet.timestamp_ms,
            received: HashMap::new(),
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        });

        if set.total != header.total || set.original_type != header.original_type {
            self.sets.remove(&key);
            return Err(FragmentError::InconsistentMetadata.into());
        }
        if header.index >= set.total {
            self.sets.remove(&key);
            return Err(FragmentError::IndexOutOfBounds {
                index: header.index,
                total: set.total,
            }
            .into());
        }

        set.received.insert(header.index, data.to_vec());
        set.last_seen_ms = now_ms;

        if set.received.len() as u16 == set.total {
            let set = self.sets.remove(&key).unwrap();
            let mut payload = Vec::new();
            for i in 0..set.total {
                match set.received.get(&i) {
                    Some(chunk) => payload.extend_from_slice(chunk),
                    None => return Err(FragmentError::Incomplete.into()),
                }
            }
            if payload.len() > MAX_LARGE_PAYLOAD {
                return Err(FragmentError::ReassembledTooLarge.into());
            }
            return Ok(Some(Packet {
                version: set.envelope.version,
                message_type: set.original_type,
                ttl: set.envelope.ttl,
                timestamp_ms: set.timestamp_ms,
                sender_id: set.envelope.sender_id,
                recipient_id: set.envelope.recipient_id,
                route: set.envelope.route,
                payload,
                signature: None,
            }));
        }

        Ok(None)
    }

    /// Drop fragment sets that have been inactive longer than
    /// `timeout_ms`. Call on `MeshConfig::fragment_cleanup_interval_ms`.
    pub fn sweep(&mut self, now_ms: u64, timeout_ms: u64) {
        self.sets
            .retain(|_, set| now_ms.saturating_sub(set.last_seen_ms) < timeout_ms);
    }

    /// Number of fragment sets currently pending reassembly.
    pub fn pending_count(&self) -> usize {
        self.sets.len()
    }
}
