//! State directory layout.
//!
//! All daemon state lives under a single directory:
//!
//! ```text
//! control.socket              unix control socket
//! server.crt, server.key      node server mTLS identity
//! cluster.crt, cluster.key    cluster certificate (active nodes)
//! <name>.crt, <name>.key      additional named keypairs
//! truststore/<name>.yaml      one file per trusted remote
//! database/                   owned by the database engine
//! recovery_db.tar.gz          operator-placed recovery trigger
//! ```

use std::path::{Path, PathBuf};

use crate::error::{ClusterError, Result};

pub const RECOVERY_TARBALL: &str = "recovery_db.tar.gz";
pub const NODE_INFO_FILE: &str = "info.yaml";
pub const NODE_LIST_FILE: &str = "cluster.yaml";

/// Resolved state directory with helpers for every well-known path.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Resolves `root` to an absolute path and creates the directory
    /// skeleton if it does not exist yet.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };

        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join("truststore"))?;
        std::fs::create_dir_all(root.join("database"))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn control_socket(&self) -> PathBuf {
        self.root.join("control.socket")
    }

    pub fn trust_dir(&self) -> PathBuf {
        self.root.join("truststore")
    }

    pub fn database_dir(&self) -> PathBuf {
        self.root.join("database")
    }

    pub fn node_list(&self) -> PathBuf {
        self.database_dir().join(NODE_LIST_FILE)
    }

    pub fn node_info(&self) -> PathBuf {
        self.database_dir().join(NODE_INFO_FILE)
    }

    pub fn recovery_tarball(&self) -> PathBuf {
        self.root.join(RECOVERY_TARBALL)
    }

    /// Certificate path for a named keypair, e.g. `server.crt`.
    pub fn cert(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.crt"))
    }

    /// Private key path for a named keypair, e.g. `server.key`.
    pub fn key(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.key"))
    }

    /// Optional CA path for a named keypair, e.g. `server.ca`.
    pub fn ca(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.ca"))
    }

    /// True once a cluster certificate exists, meaning this directory has
    /// been bootstrapped or joined before.
    pub fn is_initialized(&self) -> bool {
        self.cert("cluster").exists()
    }

    /// Removes everything written by a failed bootstrap or join so the
    /// daemon can return to a pristine pre-init state.
    pub fn wipe(&self) -> Result<()> {
        for name in ["server", "cluster"] {
            for path in [self.cert(name), self.key(name), self.ca(name)] {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
            }
        }

        std::fs::remove_dir_all(self.trust_dir())?;
        std::fs::create_dir_all(self.trust_dir())?;
        std::fs::remove_dir_all(self.database_dir())?;
        std::fs::create_dir_all(self.database_dir())?;

        Ok(())
    }
}

/// Rejects keypair names that could escape the state directory.
pub fn validate_keypair_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ClusterError::internal(format!(
            "certificate name {name:?} cannot be a path"
        )));
    }
    Ok(())
}
