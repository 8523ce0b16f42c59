//! Runtime configuration for the mesh messaging core.
//!
//! A single flat struct of the knobs enumerated in the design, with a
//! [`Default`] impl seeding the documented defaults. Loadable from TOML so
//! embedders can ship a config file alongside the host application.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// All tunable knobs for the mesh core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeshConfig {
    /// TTL assigned to ANNOUNCE, LEAVE, and broadcast MESSAGE packets at origin.
    pub message_ttl: u8,
    /// TTL assigned to REQUEST_SYNC packets (neighbor-only, never relayed).
    pub sync_ttl: u8,
    /// Maximum number of entries in the seen-packet dedup table.
    pub seen_max_entries: usize,
    /// Expiry, in milliseconds, of seen-packet table entries.
    pub seen_ttl_ms: u64,
    /// Inactivity timeout, in milliseconds, for an incomplete fragment set.
    pub fragment_timeout_ms: u64,
    /// Interval, in milliseconds, between fragment-reassembly GC sweeps.
    pub fragment_cleanup_interval_ms: u64,
    /// Wall-clock age, in milliseconds, after which a Noise session needs rekey.
    pub rekey_time_limit_ms: u64,
    /// Message count after which a Noise session needs rekey.
    pub rekey_messages_session: u64,
    /// Message count after which the encryption service recommends rekey.
    pub rekey_messages_service: u64,
    /// Message count at which a nonce-exhaustion warning is logged.
    pub noise_nonce_warn_threshold: u64,
    /// Default target size, in bytes, for a gossip GCS filter.
    pub gcs_default_bytes: usize,
    /// Default target false-positive rate for a gossip GCS filter.
    pub gcs_default_fpr: f64,
    /// Maximum filter size, in bytes, a receiver will accept.
    pub gcs_accept_max_bytes: usize,
    /// Age, in milliseconds, after which an announcement (and its tracked
    /// messages) is considered stale and pruned.
    pub stale_peer_timeout_ms: u64,
    /// Encoded-size threshold, in bytes, above which a packet is fragmented.
    pub fragment_size_threshold: usize,
    /// Maximum concurrently tracked neighbors for broadcast fan-out.
    pub max_neighbors: usize,
    /// Cap on the number of neighbors a single broadcast relays to.
    pub relay_fanout_limit: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            message_ttl: 7,
            sync_ttl: 0,
            seen_max_entries: 10_000,
            seen_ttl_ms: 300_000,
            fragment_timeout_ms: 30_000,
            fragment_cleanup_interval_ms: 10_000,
            rekey_time_limit_ms: 3_600_000,
            rekey_messages_session: 10_000,
            rekey_messages_service: 1_000,
            noise_nonce_warn_threshold: 1_000_000_000,
            gcs_default_bytes: 256,
            gcs_default_fpr: 0.01,
            gcs_accept_max_bytes: 1024,
            stale_peer_timeout_ms: 180_000,
            fragment_size_threshold: 512,
            max_neighbors: 64,
            relay_fanout_limit: 64,
        }
    }
}

impl MeshConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.message_ttl, 7);
        assert_eq!(cfg.sync_ttl, 0);
        assert_eq!(cfg.seen_max_entries, 10_000);
        assert_eq!(cfg.fragment_timeout_ms, 30_000);
        assert_eq!(cfg.rekey_time_limit_ms, 3_600_000);
        assert_eq!(cfg.gcs_default_fpr, 0.01);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = MeshConfig::default();
        let s = toml::to_string(&cfg).unwrap();
        let parsed = MeshConfig::from_toml(&s).unwrap();
        assert_eq!(cfg, parsed);
    }
}
