//! Security Gate: every inbound decoded packet passes through here before
//! any further processing. Rejects self-echo, unsigned, unverifiable, and
//! duplicate packets; never surfaces its rejections to the application.

use std::num::NonZeroUsize;

use ed25519_dalek::{Signature, VerifyingKey};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::config::MeshConfig;
use crate::crypto::SigningKeyPair;
use crate::protocol::codec::Codec;
use crate::protocol::tlv::IdentityAnnouncement;
use crate::protocol::types::{Packet, PeerId};
use crate::protocol::MESSAGE_TYPE_ANNOUNCE;

/// Looks up the Ed25519 signing public key this gate trusts for a given
/// peer's already-known identity (populated from prior ANNOUNCE packets).
pub trait PeerRecordLookup: Send + Sync {
    fn signing_pubkey_for(&self, peer_id: &PeerId) -> Option<[u8; 32]>;
}

/// Content-addressed dedup key: `SHA-256(type || sender_id || timestamp_be64
/// || payload)` truncated to 16 bytes.
pub fn packet_key(packet: &Packet) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update([packet.message_type]);
    hasher.update(packet.sender_id);
    hasher.update(packet.timestamp_ms.to_be_bytes());
    hasher.update(&packet.payload);
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

struct SeenEntry {
    expires_at_ms: u64,
}

pub struct SecurityGate {
    my_peer_id: PeerId,
    seen: Mutex<LruCache<[u8; 16], SeenEntry>>,
    seen_ttl_ms: u64,
    max_ttl: u8,
}

impl SecurityGate {
    pub fn new(my_peer_id: PeerId, config: &MeshConfig) -> Self {
        let capacity = NonZeroUsize::new(config.seen_max_entries.max(1)).unwrap();
        Self {
            my_peer_id,
            seen: Mutex::new(LruCache::new(capacity)),
            seen_ttl_ms: config.seen_ttl_ms,
            max_ttl: config.message_ttl,
        }
    }

    /// Run every check in order. Returns `true` iff the packet should
    /// proceed to relay/session/gossip handling.
    pub fn admit(&self, packet: &Packet, now_ms: u64, lookup: &dyn PeerRecordLookup) -> bool {
        if packet.sender_id == self.my_peer_id {
            trace!("dropping self-echo");
            return false;
        }

        let Some(signature_bytes) = packet.signature else {
            warn!(reason = "unsigned", "dropping packet");
            return false;
        };

        let Some(signer) = self.acquire_signer(packet, lookup) else {
            warn!(reason = "unknown_signer", "dropping packet");
            return false;
        };

        let Ok(verifying_key) = VerifyingKey::from_bytes(&signer) else {
            warn!(reason = "malformed_signer_key", "dropping packet");
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            warn!(reason = "malformed_signature", "dropping packet");
            return false;
        };
        let Ok(signing_bytes) = Codec::signing_bytes(packet) else {
            warn!(reason = "reencode_failed", "dropping packet");
            return false;
        };
        if SigningKeyPair::verify(&verifying_key, &signing_bytes, &signature).is_err() {
            warn!(reason = "bad_signature", "dropping packet");
            return false;
        }

        let key = packet_key(packet);
        if !self.check_and_insert(packet, key, now_ms) {
            warn!(reason = "duplicate", "dropping packet");
            return false;
        }

        true
    }

    fn acquire_signer(&self, packet: &Packet, lookup: &dyn PeerRecordLookup) -> Option<[u8; 32]> {
        if packet.message_type == MESSAGE_TYPE_ANNOUNCE {
            IdentityAnnouncement::decode(&packet.payload)
                .ok()
                .map(|ann| ann.signing_pubkey)
        } else {
            lookup.signing_pubkey_for(&packet.sender_id)
        }
    }

    /// Consult and update the seen-packet table, applying the ANNOUNCE
    /// max-TTL retransmission exception. Returns `true` if the packet is
    /// novel (or an allowed retransmission) and was inserted/refreshed.
    fn check_and_insert(&self, packet: &Packet, key: [u8; 16], now_ms: u64) -> bool {
        let mut seen = self.seen.lock();

        if let Some(entry) = seen.get(&key) {
            let still_live = entry.expires_at_ms > now_ms;
            let is_fresh_announce_retransmission =
                packet.message_type == MESSAGE_TYPE_ANNOUNCE && packet.ttl == self.max_ttl;
            if still_live && !is_fresh_announce_retransmission {
                return false;
            }
        }

        seen.put(
            key,
            SeenEntry {
                expires_at_ms: now_ms + self.seen_ttl_ms,
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::protocol::constants::*;

    struct NoLookup;
    impl PeerRecordLookup for NoLookup {
        fn signing_pubkey_for(&self, _peer_id: &PeerId) -> Option<[u8; 32]> {
            None
        }
    }

    struct FixedLookup(PeerId, [u8; 32]);
    impl PeerRecordLookup for FixedLookup {
        fn signing_pubkey_for(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
            if *peer_id == self.0 {
                Some(self.1)
            } else {
                None
            }
        }
    }

    fn signed_message(identity: &Identity, sender_id: PeerId, ttl: u8, nonce: u8) -> Packet {
        let mut packet = Packet {
            version: PROTOCOL_VERSION_1,
            message_type: MESSAGE_TYPE_MESSAGE,
            ttl,
            timestamp_ms: nonce as u64,
            sender_id,
            recipient_id: Some(BROADCAST_PEER_ID),
            route: None,
            payload: b"hello".to_vec(),
            signature: None,
        };
        let signing_bytes = Codec::signing_bytes(&packet).unwrap();
        let sig = identity.signing_keypair.sign(&signing_bytes);
        packet.signature = Some(sig.to_bytes());
        packet
    }

    #[test]
    fn self_echo_is_rejected() {
        let config = MeshConfig::default();
        let gate = SecurityGate::new([1; 8], &config);
        let identity = Identity::generate();
        let packet = signed_message(&identity, [1; 8], 7, 1);
        assert!(!gate.admit(&packet, 0, &NoLookup));
    }

    #[test]
    fn unsigned_packet_is_rejected() {
        let config = MeshConfig::default();
        let gate = SecurityGate::new([1; 8], &config);
        let mut packet = signed_message(&Identity::generate(), [2; 8], 7, 1);
        packet.signature = None;
        assert!(!gate.admit(&packet, 0, &NoLookup));
    }

    #[test]
    fn unknown_signer_is_rejected() {
        let config = MeshConfig::default();
        let gate = SecurityGate::new([1; 8], &config);
        let packet = signed_message(&Identity::generate(), [2; 8], 7, 1);
        assert!(!gate.admit(&packet, 0, &NoLookup));
    }

    #[test]
    fn valid_signed_packet_is_admitted_once_and_duplicate_is_rejected() {
        let config = MeshConfig::default();
        let gate = SecurityGate::new([1; 8], &config);
        let identity = Identity::generate();
        let sender = [2; 8];
        let lookup = FixedLookup(sender, identity.signing_keypair.public_bytes());
        let packet = signed_message(&identity, sender, 7, 1);

        assert!(gate.admit(&packet, 0, &lookup));
        assert!(!gate.admit(&packet, 0, &lookup));
    }

    #[test]
    fn announce_retransmission_at_max_ttl_is_allowed() {
        let config = MeshConfig::default();
        let gate = SecurityGate::new([1; 8], &config);
        let identity = Identity::generate();
        let sender = [2; 8];
        let ann = IdentityAnnouncement {
            nickname: "alice".to_string(),
            noise_pubkey: [3u8; 32],
            signing_pubkey: identity.signing_keypair.public_bytes(),
        };
        let mut packet = Packet {
            version: PROTOCOL_VERSION_1,
            message_type: MESSAGE_TYPE_ANNOUNCE,
            ttl: config.message_ttl,
            timestamp_ms: 1,
            sender_id: sender,
            recipient_id: Some(BROADCAST_PEER_ID),
            route: None,
            payload: ann.encode(),
            signature: None,
        };
        let signing_bytes = Codec::signing_bytes(&packet).unwrap();
        packet.signature = Some(identity.signing_keypair.sign(&signing_bytes).to_bytes());

        assert!(gate.admit(&packet, 0, &NoLookup));
        assert!(gate.admit(&packet, 0, &NoLookup));
    }
}
