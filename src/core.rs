//! Core: the explicit handle threaded through every operation instead of
//! module-level singletons. Owns ingress dispatch (`on_frame`) and the
//! periodic maintenance hooks a host application drives on its own timers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::config::MeshConfig;
use crate::crypto::Identity;
use crate::error::{Error, Result};
use crate::fragment::{Fragmenter, Reassembler};
use crate::gossip::{missing_for_filter, GcsFilter, GossipStore, SyncRequest};
use crate::keystore::KeyStore;
use crate::protocol::codec::Codec;
use crate::protocol::constants::*;
use crate::protocol::tlv::{FilePacket, IdentityAnnouncement, PrivatePayload};
use crate::protocol::types::{Packet, PeerId};
use crate::relay::{RelayAction, RelayEngine};
use crate::security::{PeerRecordLookup, SecurityGate};
use crate::session::{SessionEvent, SessionManager};

/// The link layer primitives the core consumes to move frames. `broadcast`
/// takes an optional neighbor to exclude (the ingress of a relayed packet,
/// to avoid an immediate reflection); locally originated sends pass `None`.
#[async_trait]
pub trait LinkSender: Send + Sync {
    async fn broadcast(&self, frame: Vec<u8>, exclude: Option<PeerId>);
    async fn send_to_peer(&self, peer_id: PeerId, frame: Vec<u8>) -> bool;
}

/// Events surfaced to the embedder. Emission is synchronous from the core's
/// point of view; a channel-backed [`EventSink`] absorbs the async boundary.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    PeerAuthenticated {
        peer_id: PeerId,
        fingerprint: [u8; 32],
    },
    SessionClosed {
        peer_id: PeerId,
    },
    AnnounceReceived {
        peer_id: PeerId,
        announcement: IdentityAnnouncement,
    },
    MessageReceived {
        from: PeerId,
        payload: Vec<u8>,
    },
    PrivateMessageReceived {
        from: PeerId,
        payload: Vec<u8>,
    },
    FileReceived {
        from: PeerId,
        file: FilePacket,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

/// Bounded-channel event sink: the "thin async façade" the core's callback
/// model recommends for consumers outside the Session Manager.
pub struct ChannelEventSink {
    sender: tokio::sync::mpsc::Sender<CoreEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<CoreEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: CoreEvent) {
        if self.sender.try_send(event).is_err() {
            warn!("event sink is full or closed, dropping event");
        }
    }
}

/// Adapts the peer-record map to the Security Gate's signer lookup.
struct PeerRecordsView<'a>(&'a DashMap<PeerId, [u8; 32]>);

impl PeerRecordLookup for PeerRecordsView<'_> {
    fn signing_pubkey_for(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
        self.0.get(peer_id).map(|entry| *entry)
    }
}

/// The explicit core handle. No module-level state: every operation reads
/// its identity, session, and security state off `self`, so tests can
/// construct as many isolated cores as they like.
pub struct Core {
    config: MeshConfig,
    link: Arc<dyn LinkSender>,
    keystore: Arc<dyn KeyStore>,
    events: Arc<dyn EventSink>,
    identity: RwLock<Arc<Identity>>,
    sessions: RwLock<Arc<SessionManager>>,
    security: RwLock<Arc<SecurityGate>>,
    relay: RwLock<Arc<RelayEngine>>,
    peer_records: DashMap<PeerId, [u8; 32]>,
    reassembler: Mutex<Reassembler>,
    gossip: GossipStore,
}

impl Core {
    pub fn new(
        config: MeshConfig,
        keystore: Arc<dyn KeyStore>,
        link: Arc<dyn LinkSender>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let identity = Arc::new(keystore.load_or_generate()?);
        let my_peer_id = identity.peer_id();
        let message_capacity = config.seen_max_entries;
        Ok(Self {
            sessions: RwLock::new(Arc::new(SessionManager::new(identity.clone()))),
            security: RwLock::new(Arc::new(SecurityGate::new(my_peer_id, &config))),
            relay: RwLock::new(Arc::new(RelayEngine::new(my_peer_id))),
            gossip: GossipStore::new(message_capacity),
            identity: RwLock::new(identity),
            config,
            keystore,
            link,
            events,
            peer_records: DashMap::new(),
            reassembler: Mutex::new(Reassembler::new()),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.read().peer_id()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Dispatch an inbound wire frame received from `ingress_peer_id`.
    #[instrument(skip(self, frame))]
    pub async fn on_frame(&self, frame: &[u8], ingress_peer_id: PeerId, now_ms: u64) {
        let packet = match Codec::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(?e, "dropping undecodable frame");
                return;
            }
        };

        let security = self.security.read().clone();
        if !security.admit(&packet, now_ms, &PeerRecordsView(&self.peer_records)) {
            return;
        }

        if packet.message_type == MESSAGE_TYPE_REQUEST_SYNC {
            self.handle_request_sync(&packet, ingress_peer_id).await;
            return;
        }

        let identity = self.identity.read().clone();
        let sessions = self.sessions.read().clone();
        let my_peer_id = identity.peer_id();
        let for_me = packet.recipient_id == Some(my_peer_id);
        let forward = packet.is_broadcast() || !for_me;

        if packet.message_type == MESSAGE_TYPE_FRAGMENT {
            if packet.is_broadcast() || for_me {
                match self.reassembler.lock().accept(&packet, now_ms) {
                    Ok(Some(reassembled)) => {
                        self.dispatch_payload(reassembled, &identity, &sessions, now_ms)
                            .await;
                    }
                    Ok(None) => {}
                    Err(e) => debug!(?e, "dropping malformed fragment set"),
                }
            }
        } else {
            self.dispatch_payload(packet.clone(), &identity, &sessions, now_ms)
                .await;
        }

        if forward {
            self.forward(&packet, ingress_peer_id).await;
        }
    }

    async fn dispatch_payload(
        &self,
        packet: Packet,
        identity: &Identity,
        sessions: &SessionManager,
        now_ms: u64,
    ) {
        let my_peer_id = identity.peer_id();
        match packet.message_type {
            MESSAGE_TYPE_ANNOUNCE => {
                if let Ok(announcement) = IdentityAnnouncement::decode(&packet.payload) {
                    self.peer_records
                        .insert(packet.sender_id, announcement.signing_pubkey);
                    self.gossip.record_announcement(
                        packet.clone(),
                        now_ms,
                        self.config.stale_peer_timeout_ms,
                    );
                    self.events.emit(CoreEvent::AnnounceReceived {
                        peer_id: packet.sender_id,
                        announcement,
                    });
                }
            }
            MESSAGE_TYPE_MESSAGE => {
                if packet.is_broadcast() {
                    self.gossip.record_message(packet.clone());
                    self.events.emit(CoreEvent::MessageReceived {
                        from: packet.sender_id,
                        payload: packet.payload,
                    });
                }
            }
            MESSAGE_TYPE_LEAVE => {
                sessions.remove_session(&packet.sender_id);
                self.peer_records.remove(&packet.sender_id);
                self.events.emit(CoreEvent::SessionClosed {
                    peer_id: packet.sender_id,
                });
            }
            MESSAGE_TYPE_NOISE_HANDSHAKE if packet.recipient_id == Some(my_peer_id) => {
                match sessions.process_handshake(packet.sender_id, &packet.payload, now_ms) {
                    Ok((response, event)) => {
                        if let Some(event) = event {
                            self.emit_session_event(event);
                        }
                        if let Some(response_bytes) = response {
                            let _ = self
                                .send_handshake_response(
                                    packet.sender_id,
                                    response_bytes,
                                    identity,
                                    now_ms,
                                )
                                .await;
                        }
                    }
                    Err(e) => debug!(?e, "handshake processing failed"),
                }
            }
            MESSAGE_TYPE_NOISE_ENCRYPTED if packet.recipient_id == Some(my_peer_id) => {
                match sessions.decrypt(&packet.sender_id, &packet.payload) {
                    Ok(plaintext) => match PrivatePayload::decode(&plaintext) {
                        Ok(PrivatePayload::PrivateMessage { content, .. }) => {
                            self.events.emit(CoreEvent::PrivateMessageReceived {
                                from: packet.sender_id,
                                payload: content,
                            });
                        }
                        Ok(PrivatePayload::FileTransfer(file)) => {
                            self.events.emit(CoreEvent::FileReceived {
                                from: packet.sender_id,
                                file,
                            });
                        }
                        Ok(_other) => {}
                        Err(e) => debug!(?e, "malformed private payload"),
                    },
                    Err(e) => debug!(?e, "decryption failed"),
                }
            }
            MESSAGE_TYPE_FILE_TRANSFER => {
                if packet.is_broadcast() {
                    self.gossip.record_message(packet.clone());
                }
                if packet.is_broadcast() || packet.recipient_id == Some(my_peer_id) {
                    if let Ok(file) = FilePacket::decode(&packet.payload) {
                        self.events.emit(CoreEvent::FileReceived {
                            from: packet.sender_id,
                            file,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    fn emit_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::PeerAuthenticated {
                peer_id,
                fingerprint,
            } => self
                .events
                .emit(CoreEvent::PeerAuthenticated { peer_id, fingerprint }),
            SessionEvent::SessionClosed { peer_id } => {
                self.events.emit(CoreEvent::SessionClosed { peer_id })
            }
        }
    }

    async fn handle_request_sync(&self, packet: &Packet, ingress_peer_id: PeerId) {
        let request = match SyncRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(?e, "malformed REQUEST_SYNC, ignoring");
                return;
            }
        };
        let filter: GcsFilter = match request.decode_filter(self.config.gcs_accept_max_bytes) {
            Ok(filter) => filter,
            Err(e) => {
                debug!(?e, "oversized or malformed gossip filter, ignoring");
                return;
            }
        };

        for missing in missing_for_filter(&self.gossip, &filter, self.config.sync_ttl) {
            if let Ok(frame) = Codec::encode(&missing) {
                self.link.send_to_peer(ingress_peer_id, frame).await;
            }
        }
    }

    async fn forward(&self, packet: &Packet, ingress_peer_id: PeerId) {
        let relay = self.relay.read().clone();
        match relay.relay(packet, ingress_peer_id) {
            RelayAction::Drop => {}
            RelayAction::Unicast { next_hop, packet } => {
                if let Ok(frame) = Codec::encode(&packet) {
                    self.link.send_to_peer(next_hop, frame).await;
                }
            }
            RelayAction::Broadcast { exclude, packet } => {
                if let Ok(frame) = Codec::encode(&packet) {
                    self.link.broadcast(frame, Some(exclude)).await;
                }
            }
        }
    }

    /// Sign `packet`, fragmenting it first if its encoded size would exceed
    /// the configured threshold, and hand each resulting frame to the link.
    async fn send_signed(&self, packet: Packet, identity: &Identity) -> Result<()> {
        let signed = self.sign(packet, identity)?;
        let encoded = Codec::encode(&signed)?;

        let frames = if encoded.len() > self.config.fragment_size_threshold {
            Fragmenter::fragment(&signed, self.config.fragment_size_threshold)
                .into_iter()
                .map(|fragment| self.sign(fragment, identity))
                .collect::<Result<Vec<_>>>()?
                .into_iter()
                .map(|fragment| Codec::encode(&fragment))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![encoded]
        };

        for frame in frames {
            if let Some(route) = signed.route.as_ref().filter(|r| !r.is_empty()) {
                self.link.send_to_peer(route[0], frame).await;
            } else {
                self.link.broadcast(frame, None).await;
            }
        }
        Ok(())
    }

    fn sign(&self, mut packet: Packet, identity: &Identity) -> Result<Packet> {
        packet.signature = None;
        let signing_bytes = Codec::signing_bytes(&packet)?;
        packet.signature = Some(identity.signing_keypair.sign(&signing_bytes).to_bytes());
        Ok(packet)
    }

    pub async fn announce(&self, nickname: String, now_ms: u64) -> Result<()> {
        let identity = self.identity.read().clone();
        let announcement = IdentityAnnouncement {
            nickname,
            noise_pubkey: identity.noise_keypair.public_bytes(),
            signing_pubkey: identity.signing_keypair.public_bytes(),
        };
        let mut packet = Packet::new_broadcast(
            MESSAGE_TYPE_ANNOUNCE,
            identity.peer_id(),
            announcement.encode(),
            self.config.message_ttl,
        );
        packet.timestamp_ms = now_ms;
        self.send_signed(packet, &identity).await
    }

    pub async fn send_broadcast_message(&self, payload: Vec<u8>, now_ms: u64) -> Result<()> {
        let identity = self.identity.read().clone();
        let mut packet = Packet::new_broadcast(
            MESSAGE_TYPE_MESSAGE,
            identity.peer_id(),
            payload,
            self.config.message_ttl,
        );
        packet.timestamp_ms = now_ms;
        self.send_signed(packet, &identity).await
    }

    pub async fn leave(&self, now_ms: u64) -> Result<()> {
        let identity = self.identity.read().clone();
        let mut packet = Packet::new_broadcast(
            MESSAGE_TYPE_LEAVE,
            identity.peer_id(),
            vec![],
            self.config.message_ttl,
        );
        packet.timestamp_ms = now_ms;
        self.send_signed(packet, &identity).await
    }

    pub async fn initiate_handshake(&self, peer_id: PeerId, now_ms: u64) -> Result<()> {
        let identity = self.identity.read().clone();
        let sessions = self.sessions.read().clone();
        let message1 = sessions.initiate(peer_id, now_ms)?;
        let packet = Packet {
            version: PROTOCOL_VERSION_1,
            message_type: MESSAGE_TYPE_NOISE_HANDSHAKE,
            ttl: self.config.message_ttl,
            timestamp_ms: now_ms,
            sender_id: identity.peer_id(),
            recipient_id: Some(peer_id),
            route: None,
            payload: message1,
            signature: None,
        };
        self.send_signed(packet, &identity).await
    }

    async fn send_handshake_response(
        &self,
        peer_id: PeerId,
        response: Vec<u8>,
        identity: &Identity,
        now_ms: u64,
    ) -> Result<()> {
        let packet = Packet {
            version: PROTOCOL_VERSION_1,
            message_type: MESSAGE_TYPE_NOISE_HANDSHAKE,
            ttl: self.config.message_ttl,
            timestamp_ms: now_ms,
            sender_id: identity.peer_id(),
            recipient_id: Some(peer_id),
            route: None,
            payload: response,
            signature: None,
        };
        self.send_signed(packet, identity).await
    }

    pub async fn send_private_message(
        &self,
        peer_id: PeerId,
        message_id: Vec<u8>,
        content: Vec<u8>,
        now_ms: u64,
    ) -> Result<()> {
        let identity = self.identity.read().clone();
        let sessions = self.sessions.read().clone();
        if !sessions.has_established_session(&peer_id) {
            return Err(Error::NoSessionForPeer);
        }
        let inner = PrivatePayload::PrivateMessage {
            message_id,
            content,
            mentions: None,
        }
        .encode();
        let ciphertext = sessions.encrypt(&peer_id, &inner)?;
        let packet = Packet {
            version: PROTOCOL_VERSION_1,
            message_type: MESSAGE_TYPE_NOISE_ENCRYPTED,
            ttl: self.config.message_ttl,
            timestamp_ms: now_ms,
            sender_id: identity.peer_id(),
            recipient_id: Some(peer_id),
            route: None,
            payload: ciphertext,
            signature: None,
        };
        self.send_signed(packet, &identity).await
    }

    /// Broadcast a REQUEST_SYNC covering every packet key this core holds.
    pub async fn run_sync(&self, now_ms: u64) -> Result<()> {
        let identity = self.identity.read().clone();
        let keys: Vec<[u8; 16]> = self
            .gossip
            .tracked_packets()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let request = SyncRequest::build(&keys, self.config.gcs_default_fpr);
        let mut packet = Packet::new_broadcast(
            MESSAGE_TYPE_REQUEST_SYNC,
            identity.peer_id(),
            request.encode(),
            self.config.sync_ttl,
        );
        packet.timestamp_ms = now_ms;
        self.send_signed(packet, &identity).await
    }

    pub fn prune_gossip(&self, now_ms: u64) {
        self.gossip.prune(now_ms, self.config.stale_peer_timeout_ms);
    }

    pub fn sweep_fragments(&self, now_ms: u64) {
        self.reassembler
            .lock()
            .sweep(now_ms, self.config.fragment_timeout_ms);
    }

    pub fn sessions_needing_rekey(&self, now_ms: u64) -> Vec<PeerId> {
        self.sessions.read().sessions_needing_rekey(
            now_ms,
            self.config.rekey_time_limit_ms,
            self.config.rekey_messages_session,
        )
    }

    pub fn close_session(&self, peer_id: PeerId) {
        self.sessions.read().remove_session(&peer_id);
        self.events.emit(CoreEvent::SessionClosed { peer_id });
    }

    /// Drop all sessions (zeroing ciphers and replay windows), regenerate
    /// both static and signing keys, and re-initialize the Session Manager,
    /// Security Gate, and Relay Engine (whose `my_peer_id` changes along
    /// with it). Synchronous; holds the core-wide locks for its duration.
    pub fn clear_identity(&self) -> Result<()> {
        let identity = Arc::new(self.keystore.clear_and_regenerate()?);
        let my_peer_id = identity.peer_id();

        *self.sessions.write() = Arc::new(SessionManager::new(identity.clone()));
        *self.security.write() = Arc::new(SecurityGate::new(my_peer_id, &self.config));
        *self.relay.write() = Arc::new(RelayEngine::new(my_peer_id));
        *self.identity.write() = identity;
        *self.reassembler.lock() = Reassembler::new();
        self.peer_records.clear();
        Ok(())
    }
}
