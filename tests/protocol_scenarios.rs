//! Integration-level checks for the mesh core's literal end-to-end
//! scenarios, exercised only through the crate's public API.

use meshcore::config::MeshConfig;
use meshcore::core::{Core, CoreEvent, EventSink, LinkSender};
use meshcore::crypto::Identity;
use meshcore::fragment::{Fragmenter, Reassembler};
use meshcore::gossip::{missing_for_filter, GcsFilter, GossipStore, SyncRequest};
use meshcore::keystore::KeyStore;
use meshcore::protocol::codec::Codec;
use meshcore::protocol::constants::*;
use meshcore::protocol::types::{Packet, PeerId, BROADCAST_PEER_ID};
use meshcore::relay::{RelayAction, RelayEngine};
use meshcore::session::SessionManager;
use meshcore::{Error, Result};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[test]
fn wire_codec_round_trips_a_signed_broadcast_packet() {
    let identity = Identity::generate();
    let mut packet = Packet::new_broadcast(MESSAGE_TYPE_MESSAGE, identity.peer_id(), b"hello mesh".to_vec(), 7);
    packet.timestamp_ms = 1_700_000_000_000;
    let signing_bytes = Codec::signing_bytes(&packet).unwrap();
    packet.signature = Some(identity.signing_keypair.sign(&signing_bytes).to_bytes());

    let frame = Codec::encode(&packet).unwrap();
    let decoded = Codec::decode(&frame).unwrap();
    assert_eq!(decoded, packet);
}

#[test]
fn gcs_filter_holds_three_keys_and_rejects_a_fourth() {
    let keys = [[1u8; 16], [2u8; 16], [3u8; 16]];
    let filter = GcsFilter::build(&keys, 0.01);
    assert_eq!(filter.p, 7);
    let encoded = filter.encode();
    let decoded = GcsFilter::decode(&encoded, filter.p, filter.n, 1024).unwrap();
    for k in &keys {
        assert!(decoded.contains(k));
    }
    assert!(!decoded.contains(&[9u8; 16]));
}

#[tokio::test]
async fn noise_xx_handshake_produces_matching_transcript_hash() {
    let alice = SessionManager::new(Arc::new(Identity::generate()));
    let bob = SessionManager::new(Arc::new(Identity::generate()));
    let alice_id: PeerId = [1; 8];
    let bob_id: PeerId = [2; 8];

    let msg1 = alice.initiate(bob_id, 0).unwrap();
    assert_eq!(msg1.len(), 32); // XX message 1 is a bare 32-byte DH public key.
    let (msg2, _) = bob.process_handshake(alice_id, &msg1, 0).unwrap();
    let msg2 = msg2.unwrap();
    let (msg3, alice_event) = alice.process_handshake(bob_id, &msg2, 0).unwrap();
    let msg3 = msg3.unwrap();
    assert!(!msg3.is_empty());
    assert!(alice_event.is_some());
    let (_, bob_event) = bob.process_handshake(alice_id, &msg3, 0).unwrap();
    assert!(bob_event.is_some());

    assert!(alice.has_established_session(&bob_id));
    assert!(bob.has_established_session(&alice_id));
}

#[test]
fn fragmentation_of_1500_bytes_over_512_mtu_reassembles_exactly() {
    let packet = Packet {
        version: PROTOCOL_VERSION_1,
        message_type: MESSAGE_TYPE_FILE_TRANSFER,
        ttl: 7,
        timestamp_ms: 0,
        sender_id: [1; 8],
        recipient_id: Some([2; 8]),
        route: None,
        payload: vec![0x42u8; 1500],
        signature: None,
    };
    let fragments = Fragmenter::fragment(&packet, 512);
    assert!(fragments.len() >= 4);

    let mut reassembler = Reassembler::new();
    let mut result = None;
    for f in &fragments {
        result = reassembler.accept(f, 0).unwrap();
    }
    assert_eq!(result.unwrap().payload, packet.payload);
}

#[test]
fn relay_loop_guard_drops_a_route_with_a_repeated_hop() {
    let engine = RelayEngine::new([1; 8]);
    let mut packet = Packet::new_broadcast(MESSAGE_TYPE_MESSAGE, [9; 8], vec![], 7);
    packet.version = PROTOCOL_VERSION_2;
    packet.route = Some(vec![[1; 8], [1; 8], [3; 8]]);
    assert_eq!(engine.relay(&packet, [9; 8]), RelayAction::Drop);
}

#[test]
fn gossip_reconciliation_sends_only_what_the_peer_is_missing() {
    let x = GossipStore::new(16);
    let k1 = broadcast_message([1; 8], 1, b"k1");
    let k2 = broadcast_message([2; 8], 2, b"k2");
    let k3 = broadcast_message([3; 8], 3, b"k3");
    x.record_message(k1.clone());
    x.record_message(k2.clone());
    x.record_message(k3.clone());

    let y_keys: Vec<[u8; 16]> = x
        .tracked_packets()
        .into_iter()
        .filter(|(_, p)| p.sender_id != [1; 8])
        .map(|(key, _)| key)
        .collect();
    let y_filter = GcsFilter::build(&y_keys, 0.01);

    let missing = missing_for_filter(&x, &y_filter, 0);
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].sender_id, [1; 8]);
    assert_eq!(missing[0].ttl, 0);

    // And the wire-level request round-trips too.
    let request = SyncRequest::build(&y_keys, 0.01);
    let decoded = SyncRequest::decode(&request.encode()).unwrap();
    assert_eq!(decoded.p, request.p);
}

fn broadcast_message(sender_id: PeerId, nonce: u64, payload: &[u8]) -> Packet {
    Packet {
        version: PROTOCOL_VERSION_1,
        message_type: MESSAGE_TYPE_MESSAGE,
        ttl: 7,
        timestamp_ms: nonce,
        sender_id,
        recipient_id: Some(BROADCAST_PEER_ID),
        route: None,
        payload: payload.to_vec(),
        signature: None,
    }
}

struct CapturingLink {
    broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl CapturingLink {
    fn new() -> Self {
        Self {
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.broadcasts.lock().unwrap())
    }
}

#[async_trait]
impl LinkSender for CapturingLink {
    async fn broadcast(&self, frame: Vec<u8>, _exclude: Option<PeerId>) {
        self.broadcasts.lock().unwrap().push(frame);
    }

    async fn send_to_peer(&self, _peer_id: PeerId, frame: Vec<u8>) -> bool {
        self.broadcasts.lock().unwrap().push(frame);
        true
    }
}

struct EphemeralKeyStore(Mutex<Option<Identity>>);

impl KeyStore for EphemeralKeyStore {
    fn load_or_generate(&self) -> Result<Identity> {
        let mut guard = self.0.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Identity::generate());
        }
        Ok(guard.clone().unwrap())
    }

    fn clear_and_regenerate(&self) -> Result<Identity> {
        let identity = Identity::generate();
        *self.0.lock().unwrap() = Some(identity.clone());
        Ok(identity)
    }
}

struct CollectingSink(Mutex<Vec<CoreEvent>>);

impl EventSink for CollectingSink {
    fn emit(&self, event: CoreEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn core_delivers_a_broadcast_announce_through_the_public_api() {
    let link = Arc::new(CapturingLink::new());
    let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
    let core = Core::new(
        MeshConfig::default(),
        Arc::new(EphemeralKeyStore(Mutex::new(None))),
        link.clone(),
        sink.clone(),
    )
    .unwrap();

    core.announce("alice".into(), 0).await.unwrap();
    let frames = link.take();
    assert_eq!(frames.len(), 1);

    let other_link = Arc::new(CapturingLink::new());
    let other_sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
    let other = Core::new(
        MeshConfig::default(),
        Arc::new(EphemeralKeyStore(Mutex::new(None))),
        other_link,
        other_sink.clone(),
    )
    .unwrap();

    other.on_frame(&frames[0], core.peer_id(), 0).await;

    let events = other_sink.0.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::AnnounceReceived { .. })));
}

#[allow(dead_code)]
fn assert_error_is_send_sync<T: Send + Sync>() {}

#[allow(dead_code)]
fn compile_time_checks() {
    assert_error_is_send_sync::<Error>();
}
