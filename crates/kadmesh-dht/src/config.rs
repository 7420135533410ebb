//! DHT configuration
//!
//! All tunables live in [`DhtConfig`]. Every field has a serde default so a
//! partial TOML section deserializes into a complete configuration.

use crate::db::diversify::DiversificationPolicy;
use crate::error::DhtError;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Bucket capacity (Kademlia K)
pub const DEFAULT_K: usize = 20;

/// Split depth granularity
pub const DEFAULT_B: usize = 5;

/// Parallel requests per lookup
pub const DEFAULT_ALPHA: usize = 5;

/// Hard upper bound on value lifetime
pub const MAX_VALUE_LIFETIME: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// HTTP tunnel to a seed node that cannot be reached over UDP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// UDP address of the seed; FIND_NODE requests to it use the tunnel
    pub seed: SocketAddr,
    /// HTTP endpoint accepting `?data=<base32 packet>`
    pub url: String,
}

/// DHT configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Logical network id written on every packet
    pub network: u32,
    /// UDP bind address
    pub bind_addr: SocketAddr,
    /// Address advertised to other nodes, if different from the bind address
    pub external_addr: Option<SocketAddr>,
    /// Bootstrap node addresses
    pub bootstrap: Vec<SocketAddr>,
    /// Optional HTTP tunnel to a seed node
    pub tunnel: Option<TunnelConfig>,

    /// Bucket capacity
    pub k: usize,
    /// Split depth granularity
    pub b: usize,
    /// Replacement cache size per bucket
    pub max_replacements: usize,
    /// Outstanding requests per lookup
    pub alpha: usize,
    /// Lookups allowed to run at once
    pub max_concurrent_lookups: usize,
    /// Failures before a contact that has answered before is evicted
    pub max_fails_live: u32,
    /// Failures before a never-answered contact is evicted
    pub max_fails_unknown: u32,

    /// RPC timeout in milliseconds
    pub rpc_timeout_ms: u64,
    /// Low-priority RPCs allowed in flight per transport
    pub max_low_priority_outstanding: usize,

    /// Interval at which originators republish their values
    pub original_republish_secs: u64,
    /// Interval at which cache holders re-propagate values
    pub cache_republish_secs: u64,
    /// Closest non-holders that receive a copy after a successful get
    pub cache_at_closest_n: usize,
    /// Expiry sweep interval
    pub expiry_check_secs: u64,
    /// Router maintenance tick
    pub router_tick_secs: u64,
    /// Untouched buckets are refreshed after this long
    pub bucket_refresh_secs: u64,
    /// Contacts silent for this long become ping candidates
    pub ping_stale_secs: u64,

    /// Alien-detection window rotation period
    pub alien_window_secs: u64,
    /// Cells per alien-detection filter
    pub alien_window_cells: usize,

    /// Remote value storage limit in bytes
    pub max_db_bytes: usize,
    /// Values accepted per source address and key within one window
    pub max_values_per_source: u32,
    /// Diversification thresholds
    pub diversification: DiversificationPolicy,
    /// Hex ed25519 public key allowed to sign key-blocks
    pub key_block_authority: Option<String>,

    /// Contacts written by state export
    pub max_export_contacts: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            network: 0,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 6881)),
            external_addr: None,
            bootstrap: Vec::new(),
            tunnel: None,
            k: DEFAULT_K,
            b: DEFAULT_B,
            max_replacements: 5,
            alpha: DEFAULT_ALPHA,
            max_concurrent_lookups: 10,
            max_fails_live: 3,
            max_fails_unknown: 1,
            rpc_timeout_ms: 10_000,
            max_low_priority_outstanding: 64,
            original_republish_secs: 8 * 60 * 60,
            cache_republish_secs: 30 * 60,
            cache_at_closest_n: 1,
            expiry_check_secs: 60,
            router_tick_secs: 10,
            bucket_refresh_secs: 15 * 60,
            ping_stale_secs: 5 * 60,
            alien_window_secs: 10 * 60,
            alien_window_cells: 32_000,
            max_db_bytes: 4 * 1024 * 1024,
            max_values_per_source: 8,
            diversification: DiversificationPolicy::default(),
            key_block_authority: None,
            max_export_contacts: 256,
        }
    }
}

impl DhtConfig {
    /// RPC timeout
    #[must_use]
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Original republish interval
    #[must_use]
    pub fn original_republish_interval(&self) -> Duration {
        Duration::from_secs(self.original_republish_secs)
    }

    /// Cache republish interval
    #[must_use]
    pub fn cache_republish_interval(&self) -> Duration {
        Duration::from_secs(self.cache_republish_secs)
    }

    /// Expiry sweep interval
    #[must_use]
    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_secs)
    }

    /// Router maintenance tick
    #[must_use]
    pub fn router_tick(&self) -> Duration {
        Duration::from_secs(self.router_tick_secs)
    }

    /// Bucket refresh interval
    #[must_use]
    pub fn bucket_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.bucket_refresh_secs)
    }

    /// Silence after which a contact is worth pinging
    #[must_use]
    pub fn ping_stale_after(&self) -> Duration {
        Duration::from_secs(self.ping_stale_secs)
    }

    /// Alien-detection window period
    #[must_use]
    pub fn alien_window_period(&self) -> Duration {
        Duration::from_secs(self.alien_window_secs)
    }

    /// Parse the configured key-block authority key
    ///
    /// # Errors
    ///
    /// Returns `DhtError::InvalidConfig` if the key is not 32 hex-encoded
    /// bytes of a valid ed25519 point
    pub fn key_block_authority(&self) -> Result<Option<VerifyingKey>, DhtError> {
        let Some(hex_key) = &self.key_block_authority else {
            return Ok(None);
        };
        let bytes: [u8; 32] = hex::decode(hex_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DhtError::InvalidConfig("key_block_authority must be 32 hex bytes".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| DhtError::InvalidConfig(format!("key_block_authority: {e}").into()))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `DhtError::InvalidConfig` describing the first invalid field
    pub fn validate(&self) -> Result<(), DhtError> {
        if self.k == 0 {
            return Err(DhtError::InvalidConfig("k must be at least 1".into()));
        }
        if self.b == 0 {
            return Err(DhtError::InvalidConfig("b must be at least 1".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::InvalidConfig("alpha must be at least 1".into()));
        }
        if self.max_concurrent_lookups == 0 {
            return Err(DhtError::InvalidConfig(
                "max_concurrent_lookups must be at least 1".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(DhtError::InvalidConfig("rpc_timeout_ms must be non-zero".into()));
        }
        if self.max_low_priority_outstanding == 0 {
            return Err(DhtError::InvalidConfig(
                "max_low_priority_outstanding must be at least 1".into(),
            ));
        }
        if self.alien_window_cells == 0 || self.alien_window_secs == 0 {
            return Err(DhtError::InvalidConfig("alien window must be non-empty".into()));
        }
        if let Some(tunnel) = &self.tunnel {
            if !tunnel.url.starts_with("http://") && !tunnel.url.starts_with("https://") {
                return Err(DhtError::InvalidConfig(
                    format!("tunnel url must be http(s): {}", tunnel.url).into(),
                ));
            }
        }
        self.key_block_authority()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DhtConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.k, DEFAULT_K);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = DhtConfig {
            k: 0,
            ..DhtConfig::default()
        };
        assert!(matches!(config.validate(), Err(DhtError::InvalidConfig(_))));

        let config = DhtConfig {
            tunnel: Some(TunnelConfig {
                seed: "192.0.2.1:6881".parse().unwrap(),
                url: "ftp://seed".to_string(),
            }),
            ..DhtConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_block_authority_parsing() {
        let config = DhtConfig {
            key_block_authority: Some("abcd".to_string()),
            ..DhtConfig::default()
        };
        assert!(config.key_block_authority().is_err());

        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let config = DhtConfig {
            key_block_authority: Some(hex::encode(signing.verifying_key().to_bytes())),
            ..DhtConfig::default()
        };
        assert_eq!(
            config.key_block_authority().unwrap(),
            Some(signing.verifying_key())
        );
    }
}
