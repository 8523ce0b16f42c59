//! Relay Engine: TTL decrement, source-route following with a loop guard,
//! and broadcast fan-out that excludes the ingress neighbor.

use tracing::{trace, warn};

use crate::protocol::constants::MESSAGE_TYPE_REQUEST_SYNC;
use crate::protocol::types::{Packet, PeerId};

/// What the Relay Engine decided to do with a validated packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAction {
    /// Do not forward (TTL exhausted, loop detected, or a never-relayed type).
    Drop,
    /// Unicast to the next hop on an explicit source route.
    Unicast { next_hop: PeerId, packet: Packet },
    /// Broadcast to every neighbor except `exclude`.
    Broadcast { exclude: PeerId, packet: Packet },
}

pub struct RelayEngine {
    my_peer_id: PeerId,
}

impl RelayEngine {
    pub fn new(my_peer_id: PeerId) -> Self {
        Self { my_peer_id }
    }

    /// Decide how to relay a packet that already passed the Security Gate
    /// and arrived from `ingress_peer_id`.
    pub fn relay(&self, packet: &Packet, ingress_peer_id: PeerId) -> RelayAction {
        if packet.message_type == MESSAGE_TYPE_REQUEST_SYNC {
            trace!("REQUEST_SYNC is neighbor-only, not relayed");
            return RelayAction::Drop;
        }
        if packet.ttl == 0 {
            trace!("dropping ttl-exhausted packet");
            return RelayAction::Drop;
        }
        if !packet.route_is_valid() {
            warn!("dropping packet with looping source route");
            return RelayAction::Drop;
        }

        let mut forwarded = packet.clone();
        forwarded.ttl -= 1;

        match &packet.route {
            Some(route) if !route.is_empty() => {
                match route.iter().position(|hop| *hop == self.my_peer_id) {
                    Some(idx) if idx + 1 < route.len() => RelayAction::Unicast {
                        next_hop: route[idx + 1],
                        packet: forwarded,
                    },
                    Some(idx) if idx + 1 == route.len() => match packet.recipient_id {
                        Some(recipient) => RelayAction::Unicast {
                            next_hop: recipient,
                            packet: forwarded,
                        },
                        None => RelayAction::Drop,
                    },
                    _ => {
                        warn!("dropping packet: this node is not on its own source route");
                        RelayAction::Drop
                    }
                }
            }
            _ => RelayAction::Broadcast {
                exclude: ingress_peer_id,
                packet: forwarded,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    fn base_packet(ttl: u8) -> Packet {
        Packet {
            version: PROTOCOL_VERSION_1,
            message_type: MESSAGE_TYPE_MESSAGE,
            ttl,
            timestamp_ms: 0,
            sender_id: [9; 8],
            recipient_id: Some(BROADCAST_PEER_ID),
            route: None,
            payload: vec![],
            signature: None,
        }
    }

    #[test]
    fn ttl_zero_is_never_relayed() {
        let engine = RelayEngine::new([1; 8]);
        let packet = base_packet(0);
        assert_eq!(engine.relay(&packet, [2; 8]), RelayAction::Drop);
    }

    #[test]
    fn broadcast_excludes_ingress_and_decrements_ttl() {
        let engine = RelayEngine::new([1; 8]);
        let packet = base_packet(7);
        match engine.relay(&packet, [2; 8]) {
            RelayAction::Broadcast { exclude, packet } => {
                assert_eq!(exclude, [2; 8]);
                assert_eq!(packet.ttl, 6);
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_hop_route_is_dropped() {
        let engine = RelayEngine::new([1; 8]);
        let mut packet = base_packet(7);
        packet.version = PROTOCOL_VERSION_2;
        packet.route = Some(vec![[1; 8], [1; 8], [3; 8]]);
        assert_eq!(engine.relay(&packet, [9; 8]), RelayAction::Drop);
    }

    #[test]
    fn source_route_forwards_to_next_hop() {
        let engine = RelayEngine::new([1; 8]);
        let mut packet = base_packet(7);
        packet.version = PROTOCOL_VERSION_2;
        packet.route = Some(vec![[5; 8], [1; 8], [6; 8]]);
        match engine.relay(&packet, [9; 8]) {
            RelayAction::Unicast { next_hop, .. } => assert_eq!(next_hop, [6; 8]),
            other => panic!("expected unicast, got {other:?}"),
        }
    }

    #[test]
    fn last_hop_unicasts_direct_to_recipient() {
        let engine = RelayEngine::new([1; 8]);
        let mut packet = base_packet(7);
        packet.version = PROTOCOL_VERSION_2;
        packet.recipient_id = Some([42; 8]);
        packet.route = Some(vec![[5; 8], [1; 8]]);
        match engine.relay(&packet, [9; 8]) {
            RelayAction::Unicast { next_hop, .. } => assert_eq!(next_hop, [42; 8]),
            other => panic!("expected unicast, got {other:?}"),
        }
    }

    #[test]
    fn request_sync_is_never_relayed() {
        let engine = RelayEngine::new([1; 8]);
        let mut packet = base_packet(7);
        packet.message_type = MESSAGE_TYPE_REQUEST_SYNC;
        assert_eq!(engine.relay(&packet, [2; 8]), RelayAction::Drop);
    }
}
