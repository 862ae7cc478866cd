//! Join tokens.
//!
//! A token authorizes exactly one prospective member, by name, to join the
//! cluster. Records live in the replicated database; the wire form is an
//! opaque base64 envelope carrying no private key material.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{ClusterError, Result};
use crate::truststore::TrustStore;

const SECRET_LEN: usize = 32;

/// A token record as stored in the replicated database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRecord {
    pub name: String,
    /// Hex encoding of 32 CSPRNG bytes.
    pub secret: String,
    /// Absolute expiry, seconds since the unix epoch.
    pub expires_at: u64,
    /// Addresses of the members that existed when the token was issued.
    pub join_addresses: Vec<String>,
    /// Fingerprint joiners pin the cluster certificate to.
    pub cluster_cert_fingerprint: String,
}

impl TokenRecord {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        unix_seconds(now) >= self.expires_at
    }
}

/// The decoded wire form of a join token.
///
/// Field order is the compatibility surface: the envelope is the standard
/// base64 encoding of this struct serialized as JSON in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinToken {
    pub name: String,
    pub secret: String,
    pub join_addresses: Vec<String>,
    pub fingerprint: String,
}

impl JoinToken {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    pub fn decode(envelope: &str) -> Result<Self> {
        let json = BASE64
            .decode(envelope.trim())
            .map_err(|e| ClusterError::invalid_token(format!("not base64: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| ClusterError::invalid_token(format!("malformed envelope: {e}")))
    }
}

/// Issues a token for a prospective member called `name`.
///
/// Fails when a record with that name already exists, or when the name is
/// already taken by a cluster member.
pub async fn issue(
    db: &dyn Database,
    trust: &TrustStore,
    name: &str,
    ttl: Duration,
    cluster_cert_fingerprint: &str,
) -> Result<String> {
    if name.is_empty() {
        return Err(ClusterError::invalid_token("token name cannot be empty"));
    }
    if trust.get(name).is_some() {
        return Err(ClusterError::TrustStoreConflict {
            reason: format!("a cluster member named {name:?} already exists"),
        });
    }

    let record = TokenRecord {
        name: name.to_string(),
        secret: new_secret(),
        expires_at: unix_seconds(SystemTime::now() + ttl),
        join_addresses: trust.addresses(),
        cluster_cert_fingerprint: cluster_cert_fingerprint.to_string(),
    };

    db.insert_token(record.clone()).await?;

    JoinToken {
        name: record.name,
        secret: record.secret,
        join_addresses: record.join_addresses,
        fingerprint: record.cluster_cert_fingerprint,
    }
    .encode()
}

/// Returns all token records that have not yet expired.
pub async fn list(db: &dyn Database) -> Result<Vec<TokenRecord>> {
    let now = SystemTime::now();
    let records = db.list_tokens().await?;
    Ok(records.into_iter().filter(|r| !r.is_expired(now)).collect())
}

/// Deletes the record stored under `name`. Missing is an error.
pub async fn revoke(db: &dyn Database, name: &str) -> Result<()> {
    db.delete_token(name).await
}

fn new_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let token = JoinToken {
            name: "n2".to_string(),
            secret: "ab".repeat(32),
            join_addresses: vec!["10.0.0.1:7000".to_string()],
            fingerprint: "cd".repeat(32),
        };
        let envelope = token.encode().unwrap();
        assert_eq!(JoinToken::decode(&envelope).unwrap(), token);
    }

    #[test]
    fn test_envelope_field_order_is_stable() {
        let token = JoinToken {
            name: "n2".to_string(),
            secret: "s".to_string(),
            join_addresses: vec![],
            fingerprint: "f".to_string(),
        };
        let json = String::from_utf8(BASE64.decode(token.encode().unwrap()).unwrap()).unwrap();
        let name_at = json.find("\"name\"").unwrap();
        let secret_at = json.find("\"secret\"").unwrap();
        let addresses_at = json.find("\"join_addresses\"").unwrap();
        let fingerprint_at = json.find("\"fingerprint\"").unwrap();
        assert!(name_at < secret_at && secret_at < addresses_at && addresses_at < fingerprint_at);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(JoinToken::decode("not-base64!!!").is_err());
        let nonsense = BASE64.encode(b"{\"wrong\": true}");
        assert!(JoinToken::decode(&nonsense).is_err());
    }

    #[test]
    fn test_secret_is_64_hex_chars() {
        let secret = new_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, new_secret());
    }

    #[test]
    fn test_expiry_boundary() {
        let now = SystemTime::now();
        let record = TokenRecord {
            name: "n2".to_string(),
            secret: String::new(),
            expires_at: unix_seconds(now) + 10,
            join_addresses: vec![],
            cluster_cert_fingerprint: String::new(),
        };
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::from_secs(11)));
    }
}
