//! On-disk trust store: one YAML file per known remote.
//!
//! The trust store is the authoritative local view of cluster membership
//! for TLS purposes. It is not internally locked; callers serialize access
//! through the cluster state lock.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::identity::cert_fingerprint;

/// A trusted cluster member: name, address and server certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub address: String,
    /// PEM-encoded X.509 certificate; fingerprints are computed over the
    /// DER form.
    pub certificate: String,
}

impl Remote {
    pub fn fingerprint(&self) -> Result<String> {
        cert_fingerprint(&self.certificate)
    }
}

/// Directory-backed set of remotes, keyed by name. Addresses are unique too.
#[derive(Debug)]
pub struct TrustStore {
    dir: PathBuf,
    remotes: BTreeMap<String, Remote>,
}

impl TrustStore {
    /// Reads every `<name>.yaml` under `dir`, rejecting duplicate names or
    /// addresses.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut remotes = BTreeMap::new();

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }

            let contents = std::fs::read_to_string(&path)?;
            let remote: Remote = serde_yaml::from_str(&contents)?;

            if remote.name.is_empty() {
                return Err(ClusterError::TrustStoreConflict {
                    reason: format!("remote in {path:?} has an empty name"),
                });
            }

            check_no_conflict(&remotes, &remote)?;
            remotes.insert(remote.name.clone(), remote);
        }

        Ok(Self { dir, remotes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Remote> {
        self.remotes.get(name)
    }

    pub fn by_address(&self, address: &str) -> Option<&Remote> {
        self.remotes.values().find(|r| r.address == address)
    }

    pub fn remotes(&self) -> impl Iterator<Item = &Remote> {
        self.remotes.values()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.remotes.values().map(|r| r.address.clone()).collect()
    }

    /// Server certificate fingerprints of every trusted remote.
    pub fn fingerprints(&self) -> Result<Vec<String>> {
        self.remotes.values().map(|r| r.fingerprint()).collect()
    }

    /// Adds a remote, failing on a name or address collision. The entry is
    /// written to a sibling temp file, fsynced, then renamed into place.
    pub fn add(&mut self, remote: Remote) -> Result<()> {
        if remote.name.is_empty() {
            return Err(ClusterError::TrustStoreConflict {
                reason: "remote name cannot be empty".to_string(),
            });
        }
        check_no_conflict(&self.remotes, &remote)?;

        write_remote(&self.dir, &remote)?;
        debug!(name = %remote.name, address = %remote.address, "added remote to trust store");
        self.remotes.insert(remote.name.clone(), remote);
        Ok(())
    }

    /// Removes a remote by name. A missing entry is a hard error.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.remotes.remove(name).is_none() {
            return Err(ClusterError::TrustStoreConflict {
                reason: format!("no remote named {name:?}"),
            });
        }

        std::fs::remove_file(self.dir.join(format!("{name}.yaml")))?;
        debug!(name, "removed remote from trust store");
        Ok(())
    }

    /// Atomically re-populates the store from `remotes` via a staging
    /// directory swap. On any failure the previous directory is left as-is.
    pub fn replace(&mut self, remotes: Vec<Remote>) -> Result<()> {
        let mut staged = BTreeMap::new();
        for remote in remotes {
            check_no_conflict(&staged, &remote)?;
            staged.insert(remote.name.clone(), remote);
        }

        let staging = self.dir.with_extension("staging");
        let retired = self.dir.with_extension("retired");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        for remote in staged.values() {
            write_remote(&staging, remote)?;
        }

        if retired.exists() {
            std::fs::remove_dir_all(&retired)?;
        }
        std::fs::rename(&self.dir, &retired)?;
        std::fs::rename(&staging, &self.dir)?;
        std::fs::remove_dir_all(&retired)?;

        debug!(count = staged.len(), "replaced trust store contents");
        self.remotes = staged;
        Ok(())
    }
}

fn check_no_conflict(existing: &BTreeMap<String, Remote>, candidate: &Remote) -> Result<()> {
    if existing.contains_key(&candidate.name) {
        return Err(ClusterError::TrustStoreConflict {
            reason: format!("remote named {:?} already exists", candidate.name),
        });
    }
    if let Some(clash) = existing.values().find(|r| r.address == candidate.address) {
        return Err(ClusterError::TrustStoreConflict {
            reason: format!(
                "address {:?} already registered to {:?}",
                candidate.address, clash.name
            ),
        });
    }
    Ok(())
}

fn write_remote(dir: &Path, remote: &Remote) -> Result<()> {
    let path = dir.join(format!("{}.yaml", remote.name));
    let tmp = dir.join(format!("{}.yaml.tmp", remote.name));

    let contents = serde_yaml::to_string(remote)?;
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
