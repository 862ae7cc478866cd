use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("daemon not yet ready")]
    NotReady,

    #[error("cluster is already initialized")]
    AlreadyInitialized,

    #[error("invalid join token: {reason}")]
    InvalidToken { reason: String },

    #[error("trust store conflict: {reason}")]
    TrustStoreConflict { reason: String },

    #[error("membership change rejected: {reason}")]
    MembershipInvariant { reason: String },

    #[error("database quorum unavailable")]
    QuorumUnavailable,

    #[error("invalid recovery tarball: {reason}")]
    TarballInvalid { reason: String },

    #[error("local cluster member missing from incoming node list")]
    IdentityMissing,

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("{reason}")]
    Internal { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    /// Clients may retry the request after a short delay.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClusterError::NotReady | ClusterError::QuorumUnavailable)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        ClusterError::Internal {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        ClusterError::Transport {
            reason: reason.into(),
        }
    }

    pub fn invalid_token(reason: impl Into<String>) -> Self {
        ClusterError::InvalidToken {
            reason: reason.into(),
        }
    }

    /// Stable kind string carried in error response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::NotReady => "not_ready",
            ClusterError::AlreadyInitialized => "already_initialized",
            ClusterError::InvalidToken { .. } => "invalid_token",
            ClusterError::TrustStoreConflict { .. } => "trust_store_conflict",
            ClusterError::MembershipInvariant { .. } => "membership_invariant",
            ClusterError::QuorumUnavailable => "quorum_unavailable",
            ClusterError::TarballInvalid { .. } => "tarball_invalid",
            ClusterError::IdentityMissing => "identity_missing",
            ClusterError::Transport { .. } => "transport",
            ClusterError::PermissionDenied { .. } => "permission_denied",
            ClusterError::Internal { .. } => "internal",
            ClusterError::Io(_) => "io",
            ClusterError::Serialization(_) => "serialization",
        }
    }

    /// Reconstructs an error from a kind string received over the wire.
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "not_ready" => ClusterError::NotReady,
            "already_initialized" => ClusterError::AlreadyInitialized,
            "invalid_token" => ClusterError::InvalidToken { reason: message },
            "trust_store_conflict" => ClusterError::TrustStoreConflict { reason: message },
            "membership_invariant" => ClusterError::MembershipInvariant { reason: message },
            "quorum_unavailable" => ClusterError::QuorumUnavailable,
            "tarball_invalid" => ClusterError::TarballInvalid { reason: message },
            "identity_missing" => ClusterError::IdentityMissing,
            "transport" => ClusterError::Transport { reason: message },
            "permission_denied" => ClusterError::PermissionDenied { reason: message },
            _ => ClusterError::Internal { reason: message },
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ClusterError {
    fn from(err: serde_yaml::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_is_retriable() {
        assert!(ClusterError::NotReady.is_retriable());
        assert!(ClusterError::QuorumUnavailable.is_retriable());
    }

    #[test]
    fn test_token_and_membership_errors_are_not_retriable() {
        let token = ClusterError::invalid_token("expired");
        let membership = ClusterError::MembershipInvariant {
            reason: "id changed".to_string(),
        };
        assert!(!token.is_retriable());
        assert!(!membership.is_retriable());
    }

    #[test]
    fn test_io_error_preserves_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = ClusterError::from(io);
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_kind_round_trip() {
        let err = ClusterError::invalid_token("expired");
        let back = ClusterError::from_kind(err.kind(), "expired".to_string());
        assert!(matches!(back, ClusterError::InvalidToken { .. }));

        let back = ClusterError::from_kind("not_ready", String::new());
        assert!(matches!(back, ClusterError::NotReady));
    }
}
