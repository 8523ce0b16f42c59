//! Cryptographic primitives: static identity key pairs and the Noise
//! session built on top of them.

pub mod keys;
pub mod noise;

pub use keys::{Identity, NoiseKeyPair, SigningKeyPair};
pub use noise::{NoiseSession, NoiseState, Role};
