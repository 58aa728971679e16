//! Mesh configuration.

use std::time::Duration;

use agora_transport::{IceServer, SessionConfig};

use crate::decision::DEFAULT_TARGET_CONSENSUS;
use crate::error::{Error, Result};

/// Default label of the management byte-channel.
pub const DEFAULT_CHANNEL_LABEL: &str = "__rtc-management";

/// Configuration for a mesh peer.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Passed to the transport factory for every new session
    pub session: SessionConfig,

    /// Label of the management byte-channel
    pub channel_label: String,

    /// Minimum affirmative fraction for a decision to pass
    pub target_consensus: f64,

    /// Bound on response collection for a proposed attempt.
    /// `None` leaves attempts pending until every expected vote arrives.
    pub decision_timeout: Option<Duration>,

    /// Capacity of the mesh event broadcast channel
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            target_consensus: DEFAULT_TARGET_CONSENSUS,
            decision_timeout: None,
            event_capacity: 1024,
        }
    }
}

impl MeshConfig {
    /// Create config from environment variables with sensible defaults.
    ///
    /// - `AGORA_ICE_SERVERS`: comma separated server URLs
    /// - `AGORA_TARGET_CONSENSUS`: fraction in `(0, 1]`
    /// - `AGORA_DECISION_TIMEOUT_MS`: response collection bound
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(servers) = std::env::var("AGORA_ICE_SERVERS") {
            config.session.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServer::new)
                .collect();
        }

        if let Ok(value) = std::env::var("AGORA_TARGET_CONSENSUS") {
            config.target_consensus = value
                .parse()
                .map_err(|_| Error::Config(format!("AGORA_TARGET_CONSENSUS={value}")))?;
        }

        if let Ok(value) = std::env::var("AGORA_DECISION_TIMEOUT_MS") {
            let ms: u64 = value
                .parse()
                .map_err(|_| Error::Config(format!("AGORA_DECISION_TIMEOUT_MS={value}")))?;
            config.decision_timeout = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(self.target_consensus > 0.0 && self.target_consensus <= 1.0) {
            return Err(Error::Config(format!(
                "target consensus {} outside (0, 1]",
                self.target_consensus
            )));
        }
        if self.channel_label.is_empty() {
            return Err(Error::Config("empty channel label".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Set the relay/reflection servers.
    #[must_use]
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.session.ice_servers = servers;
        self
    }

    /// Set the consensus threshold.
    #[must_use]
    pub fn with_target_consensus(mut self, target: f64) -> Self {
        self.target_consensus = target;
        self
    }

    /// Bound response collection for proposed attempts.
    #[must_use]
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = Some(timeout);
        self
    }

    /// Set the management channel label.
    #[must_use]
    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = label.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_label, "__rtc-management");
        assert!((config.target_consensus - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!(config.decision_timeout.is_none());
    }

    #[test]
    fn consensus_range_checked() {
        assert!(MeshConfig::default().with_target_consensus(0.0).validate().is_err());
        assert!(MeshConfig::default().with_target_consensus(1.5).validate().is_err());
        assert!(MeshConfig::default().with_target_consensus(f64::NAN).validate().is_err());
        assert!(MeshConfig::default().with_target_consensus(1.0).validate().is_ok());
    }

    #[test]
    fn builders_apply() {
        let config = MeshConfig::default()
            .with_ice_servers(vec![IceServer::new("stun:stun.example.org")])
            .with_decision_timeout(Duration::from_secs(5))
            .with_channel_label("ctl");
        assert_eq!(config.session.ice_servers.len(), 1);
        assert_eq!(config.decision_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.channel_label, "ctl");
        assert!(MeshConfig::default().with_channel_label("").validate().is_err());
    }
}
