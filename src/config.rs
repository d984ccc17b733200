//! Engine tunables.
//!
//! All the knobs that bound memory and pace retries, with protocol defaults.
//! Embedders can deserialize these from YAML; every field is optional.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{PEER_ALIVE_TIMEOUT, WHOIS_RETRY_DELAY};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Reassembly cache bounds (`defrag.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefragConfig {
    /// Reassembly deadline for one packet, in milliseconds (`defrag.timeout_ms`).
    #[serde(default = "DefragConfig::default_timeout_ms")]
    pub timeout_ms: i64,
    /// Global cap on in-flight partial packets (`defrag.max_in_flight`).
    #[serde(default = "DefragConfig::default_max_in_flight")]
    pub max_in_flight: usize,
    /// Cap on partial packets bound to one path (`defrag.max_per_path`).
    #[serde(default = "DefragConfig::default_max_per_path")]
    pub max_per_path: usize,
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1500,
            max_in_flight: 128,
            max_per_path: 64,
        }
    }
}

impl DefragConfig {
    fn default_timeout_ms() -> i64 {
        1500
    }
    fn default_max_in_flight() -> usize {
        128
    }
    fn default_max_per_path() -> usize {
        64
    }
}

/// Identity lookup queue pacing (`whois.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoisConfig {
    /// Minimum delay between lookup retries per address (`whois.retry_delay_ms`).
    #[serde(default = "WhoisConfig::default_retry_delay_ms")]
    pub retry_delay_ms: i64,
    /// Ring size of datagrams parked per unknown address (`whois.max_waiting_packets`).
    #[serde(default = "WhoisConfig::default_max_waiting_packets")]
    pub max_waiting_packets: usize,
}

impl Default for WhoisConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: WHOIS_RETRY_DELAY,
            max_waiting_packets: 8,
        }
    }
}

impl WhoisConfig {
    fn default_retry_delay_ms() -> i64 {
        WHOIS_RETRY_DELAY
    }
    fn default_max_waiting_packets() -> usize {
        8
    }
}

/// Peer lifecycle limits (`peer.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLimitsConfig {
    /// Idle time after which a non-root peer is collected (`peer.alive_timeout_ms`).
    #[serde(default = "PeerLimitsConfig::default_alive_timeout_ms")]
    pub alive_timeout_ms: i64,
    /// Paths remembered per peer (`peer.max_paths`).
    #[serde(default = "PeerLimitsConfig::default_max_paths")]
    pub max_paths: usize,
}

impl Default for PeerLimitsConfig {
    fn default() -> Self {
        Self {
            alive_timeout_ms: PEER_ALIVE_TIMEOUT,
            max_paths: 16,
        }
    }
}

impl PeerLimitsConfig {
    fn default_alive_timeout_ms() -> i64 {
        PEER_ALIVE_TIMEOUT
    }
    fn default_max_paths() -> usize {
        16
    }
}

/// Root configuration structure for the packet engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub defrag: DefragConfig,

    #[serde(default)]
    pub whois: WhoisConfig,

    #[serde(default)]
    pub peer: PeerLimitsConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document; absent fields keep their defaults.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config = EngineConfig::from_yaml_str("whois:\n  retry_delay_ms: 250\n").unwrap();
        assert_eq!(config.whois.retry_delay_ms, 250);
        assert_eq!(
            config.whois.max_waiting_packets,
            WhoisConfig::default().max_waiting_packets
        );
        assert_eq!(config.defrag.max_in_flight, 128);
        assert_eq!(config.peer.alive_timeout_ms, PEER_ALIVE_TIMEOUT);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.peer.max_paths, 16);
    }
}
