//! Wire-level constants: message type tags, flag bits, and size limits.

/// Opaque 8-byte peer handle.
pub const PEER_ID_SIZE: usize = 8;
/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;
/// Fixed fragment sub-header size (fragment_id + index + total + original_type).
pub const FRAGMENT_HEADER_SIZE: usize = 13;

pub const PROTOCOL_VERSION_1: u8 = 1;
pub const PROTOCOL_VERSION_2: u8 = 2;

/// Header size through sender_id, excluding optional fields, for v1 (2-byte length).
pub const HEADER_SIZE_V1: usize = 1 + 1 + 1 + 8 + 1 + 2 + PEER_ID_SIZE;
/// Header size through sender_id, excluding optional fields, for v2 (4-byte length).
pub const HEADER_SIZE_V2: usize = 1 + 1 + 1 + 8 + 1 + 4 + PEER_ID_SIZE;

pub const MESSAGE_TYPE_ANNOUNCE: u8 = 0x01;
pub const MESSAGE_TYPE_MESSAGE: u8 = 0x02;
pub const MESSAGE_TYPE_LEAVE: u8 = 0x03;
pub const MESSAGE_TYPE_NOISE_HANDSHAKE: u8 = 0x10;
pub const MESSAGE_TYPE_NOISE_ENCRYPTED: u8 = 0x11;
pub const MESSAGE_TYPE_FRAGMENT: u8 = 0x20;
pub const MESSAGE_TYPE_REQUEST_SYNC: u8 = 0x21;
pub const MESSAGE_TYPE_FILE_TRANSFER: u8 = 0x22;

pub const FLAG_HAS_RECIPIENT: u8 = 0x01;
pub const FLAG_HAS_SIGNATURE: u8 = 0x02;
pub const FLAG_IS_COMPRESSED: u8 = 0x04;
pub const FLAG_HAS_ROUTE: u8 = 0x08;

/// Padding block sizes the codec pads up to.
pub const PADDING_BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];
/// Frames larger than this (post-encode, pre-signature accounting) are left unpadded.
pub const MAX_PADDED_SIZE: usize = 2048;
/// Reserve subtracted from the target block when choosing a padding size.
pub const PADDING_RESERVE: usize = 16;

/// Minimum payload size, in bytes, at which compression is attempted.
pub const COMPRESSION_MIN_SIZE: usize = 100;
/// Unique-byte-ratio threshold below which payload is considered compressible.
pub const COMPRESSION_ENTROPY_THRESHOLD: f64 = 0.9;

/// Standard payload ceiling (ANNOUNCE, MESSAGE, LEAVE, REQUEST_SYNC, handshake).
pub const MAX_STANDARD_PAYLOAD: usize = 64 * 1024;
/// Large payload ceiling (FILE_TRANSFER, NOISE_ENCRYPTED).
pub const MAX_LARGE_PAYLOAD: usize = 1024 * 1024;
/// Decompression bomb guard: maximum allowed compression ratio.
pub const MAX_DECOMPRESSION_RATIO: u64 = 50_000;

pub fn message_type_is_large_payload(message_type: u8) -> bool {
    matches!(
        message_type,
        MESSAGE_TYPE_FILE_TRANSFER | MESSAGE_TYPE_NOISE_ENCRYPTED
    )
}

pub fn message_type_is_compressible(message_type: u8) -> bool {
    matches!(
        message_type,
        MESSAGE_TYPE_MESSAGE
            | MESSAGE_TYPE_ANNOUNCE
            | MESSAGE_TYPE_LEAVE
            | MESSAGE_TYPE_REQUEST_SYNC
    )
}
