//! Noise_XX_25519_ChaChaPoly_SHA256 session: handshake state machine,
//! transport encryption framed with an explicit 4-byte nonce, and a
//! 1024-slot sliding-window anti-replay filter.

use parking_lot::Mutex;
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};

use crate::error::{NoiseError, Result};
use crate::protocol::PeerId;

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";
const REPLAY_WINDOW_BITS: usize = 1024;
const REPLAY_WINDOW_BYTES: usize = REPLAY_WINDOW_BITS / 8;

fn params() -> NoiseParams {
    NOISE_PATTERN
        .parse()
        .expect("static noise pattern string is valid")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseState {
    Uninit,
    Handshaking,
    Established,
    Failed,
}

struct SessionData {
    state: NoiseState,
    handshake: Option<HandshakeState>,
    transport: Option<TransportState>,
    messages_sent: u32,
    /// Set once the nonce `u32::MAX` has been consumed. `messages_sent`
    /// cannot represent "one past `u32::MAX`", so exhaustion is tracked
    /// separately rather than by incrementing past the type's range.
    nonce_exhausted: bool,
    highest_recv_nonce: Option<u64>,
    replay_window: [u8; REPLAY_WINDOW_BYTES],
    remote_static_pubkey: Option<[u8; 32]>,
    handshake_hash: Option<Vec<u8>>,
}

impl Drop for SessionData {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.replay_window.zeroize();
        if let Some(hash) = self.handshake_hash.as_mut() {
            hash.zeroize();
        }
    }
}

/// One peer's Noise session. Lifecycle transitions and cipher operations
/// share a single lock, so a transition (e.g. handshake completing) is
/// atomic with respect to any concurrent encrypt/decrypt attempt.
pub struct NoiseSession {
    pub peer_id: PeerId,
    pub role: Role,
    pub created_at_ms: u64,
    data: Mutex<SessionData>,
}

impl NoiseSession {
    /// Start a fresh initiator session, returning the 32-byte first
    /// handshake message (`e`).
    pub fn initiate(
        peer_id: PeerId,
        local_private_key: &[u8; 32],
        created_at_ms: u64,
    ) -> Result<(Self, Vec<u8>)> {
        let mut handshake = Builder::new(params())
            .local_private_key(local_private_key)
            .build_initiator()
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;

        let mut buffer = vec![0u8; 1024];
        let len = handshake
            .write_message(&[], &mut buffer)
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
        buffer.truncate(len);

        let session = Self {
            peer_id,
            role: Role::Initiator,
            created_at_ms,
            data: Mutex::new(SessionData {
                state: NoiseState::Handshaking,
                handshake: Some(handshake),
                transport: None,
                messages_sent: 0,
                nonce_exhausted: false,
                highest_recv_nonce: None,
                replay_window: [0u8; REPLAY_WINDOW_BYTES],
                remote_static_pubkey: None,
                handshake_hash: None,
            }),
        };
        Ok((session, buffer))
    }

    /// Process an inbound handshake message 1 with no prior session, acting
    /// as responder. Returns the session and the 96-byte response message.
    pub fn respond(
        peer_id: PeerId,
        local_private_key: &[u8; 32],
        incoming: &[u8],
        created_at_ms: u64,
    ) -> Result<(Self, Vec<u8>)> {
        let mut handshake = Builder::new(params())
            .local_private_key(local_private_key)
            .build_responder()
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;

        let mut scratch = vec![0u8; 1024];
        handshake
            .read_message(incoming, &mut scratch)
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;

        let mut response = vec![0u8; 1024];
        let len = handshake
            .write_message(&[], &mut response)
            .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
        response.truncate(len);

        let session = Self {
            peer_id,
            role: Role::Responder,
            created_at_ms,
            data: Mutex::new(SessionData {
                state: NoiseState::Handshaking,
                handshake: Some(handshake),
                transport: None,
                messages_sent: 0,
                nonce_exhausted: false,
                highest_recv_nonce: None,
                replay_window: [0u8; REPLAY_WINDOW_BYTES],
                remote_static_pubkey: None,
                handshake_hash: None,
            }),
        };
        Ok((session, response))
    }

    /// Feed the next inbound handshake message. Returns `Some(bytes)` when
    /// this side has a message to write back, `None` once established with
    /// nothing further to send (the responder's final step).
    pub fn advance_handshake(&self, incoming: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut data = self.data.lock();
        {
            let handshake = data
                .handshake
                .as_mut()
                .ok_or(NoiseError::HandshakeRequired)?;
            let mut scratch = vec![0u8; 1024];
            if handshake.read_message(incoming, &mut scratch).is_err() {
                data.state = NoiseState::Failed;
                return Err(NoiseError::HandshakeFailed("invalid handshake message".into()).into());
            }
        }

        let mut outgoing = None;
        {
            let handshake = data.handshake.as_mut().expect("handshake present");
            if !handshake.is_handshake_finished() {
                let mut buffer = vec![0u8; 1024];
                let len = handshake.write_message(&[], &mut buffer).map_err(|e| {
                    NoiseError::HandshakeFailed(e.to_string())
                })?;
                buffer.truncate(len);
                outgoing = Some(buffer);
            }
        }

        let finished = data
            .handshake
            .as_ref()
            .expect("handshake present")
            .is_handshake_finished();
        if finished {
            let handshake = data.handshake.take().expect("handshake present");
            let remote_static = handshake
                .get_remote_static()
                .and_then(|s| <[u8; 32]>::try_from(s).ok());
            let handshake_hash = handshake.get_handshake_hash().to_vec();
            let transport = handshake
                .into_transport_mode()
                .map_err(|e| NoiseError::HandshakeFailed(e.to_string()))?;
            data.transport = Some(transport);
            data.remote_static_pubkey = remote_static;
            data.handshake_hash = Some(handshake_hash);
            data.state = NoiseState::Established;
        }

        Ok(outgoing)
    }

    pub fn state(&self) -> NoiseState {
        self.data.lock().state
    }

    pub fn remote_static_pubkey(&self) -> Option<[u8; 32]> {
        self.data.lock().remote_static_pubkey
    }

    pub fn handshake_hash(&self) -> Option<Vec<u8>> {
        self.data.lock().handshake_hash.clone()
    }

    pub fn messages_sent(&self) -> u32 {
        self.data.lock().messages_sent
    }

    /// Encrypt `plaintext`, producing `nonce(4B big-endian) || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut data = self.data.lock();
        if data.state != NoiseState::Established {
            return Err(NoiseError::NotEstablished.into());
        }
        if data.nonce_exhausted {
            return Err(NoiseError::NonceExceeded.into());
        }
        // `TransportState::write_message` nonces its own messages 0, 1, 2, ...
        // internally; since `encrypt` always performs exactly one write per
        // call and `messages_sent` starts at 0 in lockstep, the counter we
        // track here always equals the nonce the transport just used.
        let nonce = data.messages_sent;
        let transport = data.transport.as_mut().expect("established session has transport");
        let mut buffer = vec![0u8; plaintext.len() + 16];
        let len = transport
            .write_message(plaintext, &mut buffer)
            .map_err(|_| NoiseError::EncryptionFailed)?;
        buffer.truncate(len);
        // Nonce `u32::MAX` is usable exactly once: record exhaustion instead
        // of incrementing past it so the *next* call fails, not this one.
        if nonce == u32::MAX {
            data.nonce_exhausted = true;
        } else {
            data.messages_sent += 1;
        }

        let mut framed = Vec::with_capacity(4 + buffer.len());
        framed.extend_from_slice(&nonce.to_be_bytes());
        framed.extend_from_slice(&buffer);
        Ok(framed)
    }

    /// Decrypt a `nonce(4B) || ciphertext` frame, enforcing the sliding
    /// window anti-replay filter.
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>> {
        if framed.len() < 4 {
            return Err(NoiseError::DecryptionFailed.into());
        }
        let nonce = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as u64;
        let ciphertext = &framed[4..];

        let mut data = self.data.lock();
        if data.state != NoiseState::Established {
            return Err(NoiseError::NotEstablished.into());
        }
        if !replay_accept(data.highest_recv_nonce, &data.replay_window, nonce) {
            return Err(NoiseError::DecryptionFailed.into());
        }

        let transport = data.transport.as_mut().expect("established session has transport");
        transport.set_receiving_nonce(nonce);
        let mut buffer = vec![0u8; ciphertext.len()];
        let len = transport
            .read_message(ciphertext, &mut buffer)
            .map_err(|_| NoiseError::DecryptionFailed)?;
        buffer.truncate(len);

        let (highest, window) = (data.highest_recv_nonce, data.replay_window);
        let (new_highest, new_window) = replay_record(highest, window, nonce);
        data.highest_recv_nonce = Some(new_highest);
        data.replay_window = new_window;

        Ok(buffer)
    }

    /// Whether this session needs a rekey: wall-clock age beyond the
    /// configured limit, or message count beyond the configured limit.
    pub fn needs_rekey(&self, now_ms: u64, time_limit_ms: u64, message_limit: u64) -> bool {
        let age = now_ms.saturating_sub(self.created_at_ms);
        age > time_limit_ms || self.messages_sent() as u64 > message_limit
    }
}

/// Accept nonce `n` iff it falls within the 1024-slot window ahead of
/// `highest` and has not already been marked received.
fn replay_accept(highest: Option<u64>, window: &[u8; REPLAY_WINDOW_BYTES], n: u64) -> bool {
    let Some(h) = highest else {
        return true;
    };
    if n > h {
        return true;
    }
    let offset = h - n;
    if offset as usize >= REPLAY_WINDOW_BITS {
        return false;
    }
    let offset = offset as usize;
    (window[offset / 8] >> (offset % 8)) & 1 == 0
}

/// Record nonce `n` as received, shifting the window if `n` advances it.
fn replay_record(
    highest: Option<u64>,
    mut window: [u8; REPLAY_WINDOW_BYTES],
    n: u64,
) -> (u64, [u8; REPLAY_WINDOW_BYTES]) {
    match highest {
        None => {
            window = [0u8; REPLAY_WINDOW_BYTES];
            window[0] |= 1;
            (n, window)
        }
        Some(h) if n > h => {
            let shift = n - h;
            window = shift_left(window, shift);
            window[0] |= 1;
            (n, window)
        }
        Some(h) => {
            let offset = (h - n) as usize;
            window[offset / 8] |= 1 << (offset % 8);
            (h, window)
        }
    }
}

/// Shift a little-endian (bit 0 = byte 0's LSB) bitmap left by `shift`
/// positions, discarding bits past the top, equivalent to the bitmap value
/// `window << shift` truncated to its byte width.
fn shift_left(window: [u8; REPLAY_WINDOW_BYTES], shift: u64) -> [u8; REPLAY_WINDOW_BYTES] {
    if shift >= REPLAY_WINDOW_BITS as u64 {
        return [0u8; REPLAY_WINDOW_BYTES];
    }
    let shift = shift as usize;
    let byte_shift = shift / 8;
    let bit_shift = shift % 8;
    let mut out = [0u8; REPLAY_WINDOW_BYTES];
    for i in (byte_shift..REPLAY_WINDOW_BYTES).rev() {
        let src = i - byte_shift;
        let mut value = window[src] << bit_shift;
        if bit_shift > 0 && src > 0 {
            value |= window[src - 1] >> (8 - bit_shift);
        }
        out[i] = value;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priv_key(seed: u8) -> [u8; 32] {
        [seed; 32]
    }

    #[test]
    fn full_xx_handshake_reaches_established_with_matching_hash() {
        let (initiator, msg1) = NoiseSession::initiate([1; 8], &priv_key(1), 0).unwrap();
        let (responder, msg2) = NoiseSession::respond([2; 8], &priv_key(2), &msg1, 0).unwrap();
        let msg3 = initiator.advance_handshake(&msg2).unwrap().unwrap();
        let none = responder.advance_handshake(&msg3).unwrap();

        assert!(none.is_none());
        assert_eq!(initiator.state(), NoiseState::Established);
        assert_eq!(responder.state(), NoiseState::Established);
        assert_eq!(initiator.handshake_hash(), responder.handshake_hash());
    }

    #[test]
    fn transport_round_trips_in_order() {
        let (initiator, msg1) = NoiseSession::initiate([1; 8], &priv_key(1), 0).unwrap();
        let (responder, msg2) = NoiseSession::respond([2; 8], &priv_key(2), &msg1, 0).unwrap();
        let msg3 = initiator.advance_handshake(&msg2).unwrap().unwrap();
        responder.advance_handshake(&msg3).unwrap();

        for i in 0..16u32 {
            let plaintext = format!("message {i}");
            let ciphertext = initiator.encrypt(plaintext.as_bytes()).unwrap();
            assert_eq!(&ciphertext[0..4], &i.to_be_bytes());
            let decrypted = responder.decrypt(&ciphertext).unwrap();
            assert_eq!(decrypted, plaintext.as_bytes());
        }
    }

    #[test]
    fn replayed_nonce_is_rejected_after_reordered_delivery() {
        let (initiator, msg1) = NoiseSession::initiate([1; 8], &priv_key(1), 0).unwrap();
        let (responder, msg2) = NoiseSession::respond([2; 8], &priv_key(2), &msg1, 0).unwrap();
        let msg3 = initiator.advance_handshake(&msg2).unwrap().unwrap();
        responder.advance_handshake(&msg3).unwrap();

        let c0 = initiator.encrypt(b"zero").unwrap();
        let c1 = initiator.encrypt(b"one").unwrap();

        responder.decrypt(&c1).unwrap();
        responder.decrypt(&c0).unwrap();
        assert!(responder.decrypt(&c0).is_err());
    }

    #[test]
    fn nonce_one_past_the_window_is_rejected() {
        let highest = Some(2000u64);
        let window = [0u8; REPLAY_WINDOW_BYTES];
        assert!(!replay_accept(highest, &window, 2000 - 1024));
        assert!(replay_accept(highest, &window, 2000 - 1023));
    }

    #[test]
    fn encrypting_at_nonce_u32_max_succeeds_and_the_next_call_fails() {
        let (initiator, msg1) = NoiseSession::initiate([1; 8], &priv_key(1), 0).unwrap();
        let (responder, msg2) = NoiseSession::respond([2; 8], &priv_key(2), &msg1, 0).unwrap();
        let msg3 = initiator.advance_handshake(&msg2).unwrap().unwrap();
        responder.advance_handshake(&msg3).unwrap();

        initiator.data.lock().messages_sent = u32::MAX;
        let last = initiator.encrypt(b"last one").unwrap();
        assert_eq!(&last[0..4], &u32::MAX.to_be_bytes());
        assert_eq!(initiator.messages_sent(), u32::MAX);

        match initiator.encrypt(b"one too many") {
            Err(crate::error::Error::Noise(NoiseError::NonceExceeded)) => {}
            other => panic!("expected NonceExceeded, got {other:?}"),
        }
    }
}
