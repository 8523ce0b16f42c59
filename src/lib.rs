//! meshcore - the messaging core of a decentralized, peer-to-peer mesh chat
//! system.
//!
//! This crate implements the wire protocol, cryptographic sessions, relay
//! and gossip logic that a host application (owning the actual radio link)
//! drives through the [`core::Core`] handle.

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod fragment;
pub mod gossip;
pub mod keystore;
pub mod protocol;
pub mod relay;
pub mod security;
pub mod session;

#[cfg(test)]
mod proptests;

pub use config::MeshConfig;
pub use core::{ChannelEventSink, Core, CoreEvent, EventSink, LinkSender};
pub use error::{Error, Result};
pub use keystore::{FileKeyStore, KeyStore};
