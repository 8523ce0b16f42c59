//! Error taxonomy for the mesh messaging core.
//!
//! Mirrors the component boundaries in the design: each subsystem gets its
//! own small `thiserror` enum, composed into the top-level [`Error`]. Decode,
//! authentication, fragment and gossip failures are recoverable by
//! construction (the caller drops the frame); only [`Error::Fatal`] should
//! ever stop the core.

use thiserror::Error;

/// Errors from [`crate::protocol::codec`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame too small: need at least {need}, got {got}")]
    TooSmall { need: usize, got: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("payload exceeds size limit: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid padding")]
    InvalidPadding,

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("decompression ratio exceeds bomb-guard limit")]
    DecompressionBomb,

    #[error("route present with v1 packet")]
    RouteOnV1,

    #[error("route contains duplicate hops")]
    DuplicateRouteHop,

    #[error("truncated frame")]
    Truncated,
}

/// Errors from [`crate::fragment`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("inconsistent fragment metadata for fragment set")]
    InconsistentMetadata,

    #[error("fragment index {index} out of bounds for total {total}")]
    IndexOutOfBounds { index: u16, total: u16 },

    #[error("reassembled payload exceeds size limit")]
    ReassembledTooLarge,

    #[error("reassembly timed out with missing fragments")]
    TimedOut,

    #[error("fragment set incomplete")]
    Incomplete,
}

/// Errors from [`crate::crypto::noise`], per the spec's named crypto error kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NoiseError {
    #[error("handshake required before this operation")]
    HandshakeRequired,

    #[error("session is not established")]
    NotEstablished,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("nonce space exhausted, rekey required")]
    NonceExceeded,
}

/// Errors from [`crate::gossip`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    #[error("malformed TLV in REQUEST_SYNC payload")]
    MalformedTlv,

    #[error("filter exceeds accepted size: {len} > {max}")]
    FilterTooLarge { len: usize, max: usize },

    #[error("golomb-rice parameter P out of range")]
    InvalidParameter,
}

/// Errors constructing or loading [`crate::config::MeshConfig`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Top-level error type for the core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Fragment(#[from] FragmentError),

    #[error(transparent)]
    Noise(#[from] NoiseError),

    #[error(transparent)]
    Gossip(#[from] GossipError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no session exists for peer, cannot send private message")]
    NoSessionForPeer,

    #[error("identity key store failure: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
