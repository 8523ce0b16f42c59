//! Wire protocol: packet types, constants, the binary codec, and the TLV
//! structures carried inside payloads.

pub mod codec;
pub mod constants;
pub mod tlv;
pub mod types;

pub use codec::Codec;
pub use constants::*;
pub use types::{peer_id_hex, Packet, PeerId, BROADCAST_PEER_ID};
