//! Session Manager: owns the peer_id -> NoiseSession map, dispatches
//! handshake bytes, routes encrypt/decrypt requests, and surfaces
//! authentication events.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::crypto::{Identity, NoiseSession, NoiseState};
use crate::error::{NoiseError, Result};
use crate::protocol::PeerId;

/// Events the Session Manager surfaces to its owner (the Core handle).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer's handshake completed; its Noise static key fingerprint is
    /// included for the fingerprint-to-peer-id registry.
    PeerAuthenticated {
        peer_id: PeerId,
        fingerprint: [u8; 32],
    },
    /// A session was torn down (rekey or explicit removal).
    SessionClosed { peer_id: PeerId },
}

/// Owns all per-peer Noise sessions, the fingerprint registry, and
/// dispatches handshake/encrypt/decrypt calls to them.
pub struct SessionManager {
    identity: Arc<Identity>,
    sessions: DashMap<PeerId, Arc<NoiseSession>>,
    fingerprints: DashMap<[u8; 32], PeerId>,
}

impl SessionManager {
    pub fn new(identity: Arc<Identity>) -> Self {
        Self {
            identity,
            sessions: DashMap::new(),
            fingerprints: DashMap::new(),
        }
    }

    /// Start a fresh initiator session for `peer_id`, destroying any
    /// existing session first. Returns the first handshake message.
    #[instrument(skip(self))]
    pub fn initiate(&self, peer_id: PeerId, now_ms: u64) -> Result<Vec<u8>> {
        self.sessions.remove(&peer_id);
        let private = self.identity.noise_keypair.private_bytes();
        let (session, message) = NoiseSession::initiate(peer_id, &private, now_ms)?;
        self.sessions.insert(peer_id, Arc::new(session));
        Ok(message)
    }

    /// Feed inbound handshake bytes for `peer_id`. Creates a responder
    /// session if none exists (compare-and-set: concurrent inbound
    /// handshakes for the same peer do not race onto two sessions).
    /// Returns the response bytes, and emits `PeerAuthenticated` via the
    /// returned `SessionEvent` once the handshake completes.
    #[instrument(skip(self, bytes))]
    pub fn process_handshake(
        &self,
        peer_id: PeerId,
        bytes: &[u8],
        now_ms: u64,
    ) -> Result<(Option<Vec<u8>>, Option<SessionEvent>)> {
        let session = match self.sessions.entry(peer_id) {
            Entry::Occupied(entry) => {
                let session = entry.get().clone();
                if session.state() == NoiseState::Established {
                    // Treat as a fresh handshake attempt from the peer.
                    drop(entry);
                    let private = self.identity.noise_keypair.private_bytes();
                    let (session, response) = NoiseSession::respond(peer_id, &private, bytes, now_ms)?;
                    let session = Arc::new(session);
                    self.sessions.insert(peer_id, session.clone());
                    return self.finish_handshake_response(peer_id, session, Some(response));
                }
                session
            }
            Entry::Vacant(entry) => {
                let private = self.identity.noise_keypair.private_bytes();
                let (session, response) = NoiseSession::respond(peer_id, &private, bytes, now_ms)?;
                let session = Arc::new(session);
                entry.insert(session.clone());
                return self.finish_handshake_response(peer_id, session, Some(response));
            }
        };

        let response = session.advance_handshake(bytes)?;
        self.finish_handshake_response(peer_id, session, response)
    }

    fn finish_handshake_response(
        &self,
        peer_id: PeerId,
        session: Arc<NoiseSession>,
        response: Option<Vec<u8>>,
    ) -> Result<(Option<Vec<u8>>, Option<SessionEvent>)> {
        if session.state() == NoiseState::Established {
            let remote_static = session.remote_static_pubkey();
            if let Some(remote_static) = remote_static {
                let fingerprint: [u8; 32] = Sha256::digest(remote_static).into();
                self.fingerprints.insert(fingerprint, peer_id);
                debug!(?peer_id, "noise handshake established");
                return Ok((
                    response,
                    Some(SessionEvent::PeerAuthenticated {
                        peer_id,
                        fingerprint,
                    }),
                ));
            }
        }
        Ok((response, None))
    }

    pub fn encrypt(&self, peer_id: &PeerId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let session = self.sessions.get(peer_id).ok_or(NoiseError::HandshakeRequired)?;
        session.encrypt(plaintext)
    }

    pub fn decrypt(&self, peer_id: &PeerId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let session = self.sessions.get(peer_id).ok_or(NoiseError::HandshakeRequired)?;
        session.decrypt(ciphertext)
    }

    pub fn has_established_session(&self, peer_id: &PeerId) -> bool {
        self.sessions
            .get(peer_id)
            .map(|s| s.state() == NoiseState::Established)
            .unwrap_or(false)
    }

    pub fn remove_session(&self, peer_id: &PeerId) {
        if self.sessions.remove(peer_id).is_some() {
            warn!(?peer_id, "session removed");
        }
    }

    pub fn peer_id_for_fingerprint(&self, fingerprint: &[u8; 32]) -> Option<PeerId> {
        self.fingerprints.get(fingerprint).map(|entry| *entry)
    }

    /// Peers whose sessions have crossed the rekey thresholds; the caller
    /// is expected to tear down and re-initiate each.
    pub fn sessions_needing_rekey(
        &self,
        now_ms: u64,
        time_limit_ms: u64,
        message_limit: u64,
    ) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().needs_rekey(now_ms, time_limit_ms, message_limit))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
