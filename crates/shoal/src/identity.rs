//! Node and cluster key material.
//!
//! Every node carries a self-signed server certificate whose CN is the node
//! name. Bootstrapping additionally mints the cluster certificate, the
//! long-lived identity the HTTPS listener presents and joiners pin by
//! fingerprint.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, SystemTime};

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair as RcgenKeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::paths::{validate_keypair_name, StateDir};

const SERVER_CERT_VALIDITY_DAYS: u64 = 365;
const CLUSTER_CERT_VALIDITY_DAYS: u64 = 3650;

/// A PEM-encoded certificate plus private key, optionally with a CA.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    pub cert_pem: String,
    pub key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,
}

impl KeyPair {
    /// SHA-256 fingerprint of the certificate, lowercase hex over the DER
    /// encoding.
    pub fn fingerprint(&self) -> Result<String> {
        cert_fingerprint(&self.cert_pem)
    }
}

/// Generates a self-signed server certificate with CN set to the node name.
pub fn generate_server_keypair(name: &str) -> Result<KeyPair> {
    let key_pair = RcgenKeyPair::generate()
        .map_err(|e| ClusterError::internal(format!("failed to generate server key: {e}")))?;

    let mut params = CertificateParams::new(vec![name.to_string()])
        .map_err(|e| ClusterError::internal(format!("failed to create cert params: {e}")))?;
    params.not_after = validity_end(SERVER_CERT_VALIDITY_DAYS).into();

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, name);
    params.distinguished_name = distinguished_name;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ClusterError::internal(format!("failed to sign server certificate: {e}")))?;

    Ok(KeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        ca_pem: None,
    })
}

/// Generates the cluster certificate minted once at bootstrap.
pub fn generate_cluster_keypair(cluster_name: &str) -> Result<KeyPair> {
    let key_pair = RcgenKeyPair::generate()
        .map_err(|e| ClusterError::internal(format!("failed to generate cluster key: {e}")))?;

    let mut params = CertificateParams::new(vec![cluster_name.to_string()])
        .map_err(|e| ClusterError::internal(format!("failed to create cert params: {e}")))?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_after = validity_end(CLUSTER_CERT_VALIDITY_DAYS).into();

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, cluster_name);
    params.distinguished_name = distinguished_name;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| ClusterError::internal(format!("failed to sign cluster certificate: {e}")))?;

    Ok(KeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        ca_pem: None,
    })
}

fn validity_end(days: u64) -> SystemTime {
    SystemTime::now()
        .checked_add(Duration::from_secs(days * 24 * 60 * 60))
        .unwrap_or(SystemTime::UNIX_EPOCH + Duration::from_secs(86400 * 365 * 20))
}

/// Writes `<name>.crt` and `<name>.key` (and `<name>.ca` when present) to
/// the state directory. Each file goes to a sibling temp file first and is
/// renamed into place, so readers never observe a partial keypair file.
pub fn write_keypair(paths: &StateDir, name: &str, keypair: &KeyPair) -> Result<()> {
    validate_keypair_name(name)?;

    write_atomic(&paths.cert(name), keypair.cert_pem.as_bytes(), 0o644)?;
    write_atomic(&paths.key(name), keypair.key_pem.as_bytes(), 0o600)?;
    if let Some(ca) = &keypair.ca_pem {
        write_atomic(&paths.ca(name), ca.as_bytes(), 0o644)?;
    }

    debug!(name, "wrote keypair to state directory");
    Ok(())
}

/// Loads a named keypair from the state directory.
pub fn load_keypair(paths: &StateDir, name: &str) -> Result<KeyPair> {
    validate_keypair_name(name)?;

    let cert_pem = std::fs::read_to_string(paths.cert(name))?;
    let key_pem = std::fs::read_to_string(paths.key(name))?;
    let ca_path = paths.ca(name);
    let ca_pem = if ca_path.exists() {
        Some(std::fs::read_to_string(ca_path)?)
    } else {
        None
    };

    Ok(KeyPair {
        cert_pem,
        key_pem,
        ca_pem,
    })
}

fn write_atomic(path: &std::path::Path, contents: &[u8], mode: u32) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(mode);
        std::fs::set_permissions(&tmp, perms)?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// SHA-256 of the DER encoding of the first certificate in `pem`,
/// rendered as lowercase hex.
pub fn cert_fingerprint(pem: &str) -> Result<String> {
    let der = pem_to_der(pem)?;
    Ok(format_sha256_hex(&der))
}

/// Extracts the DER bytes of the first certificate in a PEM bundle.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| ClusterError::internal("no certificate found in PEM data"))?
        .map_err(|e| ClusterError::internal(format!("failed to parse PEM certificate: {e}")))?;
    Ok(cert.as_ref().to_vec())
}

pub fn format_sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_keypair_is_pem() {
        let keypair = generate_server_keypair("n1").unwrap();
        assert!(keypair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(keypair.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        let keypair = generate_server_keypair("n1").unwrap();
        let fp = keypair.fingerprint().unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_distinct_nodes_get_distinct_fingerprints() {
        let a = generate_server_keypair("n1").unwrap();
        let b = generate_server_keypair("n2").unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StateDir::create(dir.path()).unwrap();
        let keypair = generate_server_keypair("n1").unwrap();
        write_keypair(&paths, "server", &keypair).unwrap();

        let loaded = load_keypair(&paths, "server").unwrap();
        assert_eq!(loaded, keypair);

        let mode = std::fs::metadata(paths.key("server"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_write_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StateDir::create(dir.path()).unwrap();
        let keypair = generate_server_keypair("n1").unwrap();
        assert!(write_keypair(&paths, "../evil", &keypair).is_err());
    }
}
