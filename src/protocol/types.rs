//! Core data types: the `Packet` and its identifiers.

use serde::{Deserialize, Serialize};

use super::constants::*;

/// Opaque 8-byte peer handle.
pub type PeerId = [u8; PEER_ID_SIZE];

/// `recipient_id` value denoting broadcast.
pub const BROADCAST_PEER_ID: PeerId = [0xFF; PEER_ID_SIZE];

/// Render a peer id as hex, for logs only.
pub fn peer_id_hex(id: &PeerId) -> String {
    hex::encode(id)
}

/// The central packet entity, independent of wire representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub version: u8,
    pub message_type: u8,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub route: Option<Vec<PeerId>>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// Build a new unsigned packet for the given sender and type, with the
    /// default TTL for origin broadcasts.
    pub fn new_broadcast(message_type: u8, sender_id: PeerId, payload: Vec<u8>, ttl: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            message_type,
            ttl,
            timestamp_ms: 0,
            sender_id,
            recipient_id: Some(BROADCAST_PEER_ID),
            route: None,
            payload,
            signature: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.recipient_id, Some(r) if r == BROADCAST_PEER_ID) || self.recipient_id.is_none()
    }

    pub fn is_private(&self) -> bool {
        matches!(self.recipient_id, Some(r) if r != BROADCAST_PEER_ID)
    }

    pub fn has_route(&self) -> bool {
        matches!(&self.route, Some(r) if !r.is_empty())
    }

    /// Whether this packet requires v2 framing: a non-empty route, or a
    /// payload too large for the v1 2-byte length field.
    pub fn requires_v2(&self) -> bool {
        self.has_route() || self.payload.len() > MAX_STANDARD_PAYLOAD
    }

    /// Route validity per the spec: no duplicate hops, and the final
    /// recipient must not itself appear as a hop.
    pub fn route_is_valid(&self) -> bool {
        match &self.route {
            None => true,
            Some(route) => {
                let mut seen = std::collections::HashSet::with_capacity(route.len());
                for hop in route {
                    if !seen.insert(*hop) {
                        return false;
                    }
                    if let Some(recipient) = self.recipient_id {
                        if *hop == recipient {
                            return false;
                        }
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_recipient_is_all_ff() {
        let p = Packet::new_broadcast(MESSAGE_TYPE_MESSAGE, [1; 8], b"hi".to_vec(), 7);
        assert!(p.is_broadcast());
        assert!(!p.is_private());
    }

    #[test]
    fn route_with_duplicate_hop_is_invalid() {
        let mut p = Packet::new_broadcast(MESSAGE_TYPE_MESSAGE, [1; 8], vec![], 7);
        p.route = Some(vec![[2; 8], [2; 8], [3; 8]]);
        assert!(!p.route_is_valid());
    }

    #[test]
    fn route_without_duplicates_is_valid() {
        let mut p = Packet::new_broadcast(MESSAGE_TYPE_MESSAGE, [1; 8], vec![], 7);
        p.route = Some(vec![[2; 8], [3; 8]]);
        assert!(p.route_is_valid());
    }
}
