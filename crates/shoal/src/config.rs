//! Daemon configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a shoal daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding all daemon state: sockets, certificates, the trust
    /// store and the database.
    pub state_dir: PathBuf,
    /// Group granted access to the unix control socket. Empty means the
    /// process group.
    pub socket_group: String,
    /// Version string served at `GET /1.0`.
    pub version: String,
    /// How long listeners wait for in-flight requests on shutdown.
    /// Zero means force-close.
    pub drain_timeout_secs: u64,
    /// Lifetime of an issued join token.
    pub token_ttl_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/shoal"),
            socket_group: String::new(),
            version: String::from("unknown"),
            drain_timeout_secs: 30,
            token_ttl_secs: 3600,
        }
    }
}

impl DaemonConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Rejects configurations that cannot produce a working daemon.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(crate::error::ClusterError::internal("missing state directory"));
        }
        if self.version.is_empty() {
            return Err(crate::error::ClusterError::internal(
                "version is required at daemon start",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_one_hour_token_ttl() {
        let config = DaemonConfig::default();
        assert_eq!(config.token_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_validate_rejects_empty_version() {
        let config = DaemonConfig {
            version: String::new(),
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_state_dir() {
        let config = DaemonConfig {
            state_dir: PathBuf::new(),
            version: "1".to_string(),
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
