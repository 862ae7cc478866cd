//! shoal: embeddable clustering for small, strongly-consistent services.
//!
//! Applications embed this library to obtain a bootstrap/join lifecycle
//! for cluster members, a replicated database shared by every member, a
//! mutual-TLS control plane between them, and an operator-driven recovery
//! procedure for quorum loss.
//!
//! The entry point is [`Shoal`]: construct it over a state directory,
//! [`Shoal::start`] the daemon, then drive it through the local control
//! socket with the client methods, exactly like an operator would.

pub mod api;
pub mod client;
pub mod config;
pub mod daemon;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod identity;
pub mod nodestore;
pub mod paths;
pub mod recovery;
pub mod state;
pub mod tls;
pub mod tokens;
pub mod truststore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub use crate::client::{CertificatePut, ControlClient};
pub use crate::config::DaemonConfig;
pub use crate::db::{Database, LocalEngine, SchemaUpdate};
pub use crate::error::{ClusterError, Result};
pub use crate::identity::KeyPair;
pub use crate::nodestore::{Member, NodeInfo, Role};
pub use crate::state::{Hook, HookContext, Hooks, Phase, Status};
pub use crate::tokens::TokenRecord;
pub use crate::truststore::{Remote, TrustStore};

/// Handle to an embedded cluster member.
///
/// Cheap to construct; nothing is touched on disk until [`Shoal::start`]
/// or one of the offline recovery methods runs.
#[derive(Debug, Clone)]
pub struct Shoal {
    config: DaemonConfig,
}

impl Shoal {
    /// Validates `config` and returns a handle over its state directory.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The daemon configuration this handle was built with.
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Path of the unix control socket.
    pub fn control_socket(&self) -> PathBuf {
        self.config.state_dir.join("control.socket")
    }

    /// Starts the daemon and runs it to completion.
    ///
    /// Only the control socket is available at first; no database exists
    /// yet. `schema` lists the application's schema updates in the order
    /// they apply; `hooks` trigger at lifecycle transition points.
    pub async fn start(&self, schema: Vec<SchemaUpdate>, hooks: Hooks) -> Result<()> {
        daemon::run(self.config.clone(), schema, hooks).await
    }

    /// Client for the local control socket.
    pub fn local_client(&self) -> ControlClient {
        ControlClient::new(self.control_socket())
    }

    /// Waits until the daemon reports it is ready for bootstrap or join.
    pub async fn ready(&self, timeout: Option<Duration>) -> Result<()> {
        self.local_client().wait_ready(timeout).await
    }

    /// Basic status of this member.
    pub async fn status(&self) -> Result<Status> {
        self.local_client().status().await
    }

    /// Bootstraps a brand new cluster with this daemon as its only
    /// member.
    pub async fn new_cluster(
        &self,
        name: &str,
        address: &str,
        init_config: HashMap<String, String>,
    ) -> Result<()> {
        self.local_client().bootstrap(name, address, init_config).await
    }

    /// Joins an existing cluster using a token issued by one of its
    /// members.
    pub async fn join_cluster(
        &self,
        name: &str,
        address: &str,
        token: &str,
        init_config: HashMap<String, String>,
    ) -> Result<()> {
        self.local_client().join(token, name, address, init_config).await
    }

    /// Creates a join token for a prospective member called `name`.
    pub async fn new_join_token(&self, name: &str) -> Result<String> {
        self.local_client().new_join_token(name).await
    }

    /// Lists the join tokens currently available for use.
    pub async fn list_join_tokens(&self) -> Result<Vec<TokenRecord>> {
        self.local_client().list_join_tokens().await
    }

    /// Revokes the token record stored under `name`.
    pub async fn revoke_join_token(&self, name: &str) -> Result<()> {
        self.local_client().revoke_join_token(name).await
    }

    /// Lists the cluster members as the daemon sees them.
    pub async fn members(&self) -> Result<Vec<Member>> {
        self.local_client().members().await
    }

    /// Gracefully removes the member called `name` from the cluster.
    pub async fn remove_member(&self, name: &str) -> Result<()> {
        self.local_client().remove_member(name).await
    }

    /// Updates the named keypair on every member; `cluster` hot-reloads
    /// the HTTPS listeners.
    pub async fn update_certificate(&self, name: &str, keypair: CertificatePut) -> Result<()> {
        self.local_client().update_certificate(name, &keypair).await
    }

    /// Runs `.dump`, `.schema` or an arbitrary query against the
    /// replicated database.
    pub async fn sql(&self, query: &str) -> Result<String> {
        self.local_client().sql(query).await
    }

    /// Reads the current membership from the local trust store and node
    /// list without starting the database. Pair with
    /// [`Shoal::recover_from_quorum_loss`].
    pub fn current_cluster_members(&self) -> Result<Vec<Member>> {
        let paths = paths::StateDir::create(&self.config.state_dir)?;
        recovery::current_members(&paths)
    }

    /// Recovers database access after a quorum of members is permanently
    /// lost.
    ///
    /// Requires that every member's database is stopped and that this
    /// member holds the most up-to-date log; both are operator-attested
    /// and cannot be verified from here. Invoke exactly once for the
    /// entire cluster, then copy the returned tarball into the state
    /// directory of every other member and restart them.
    pub fn recover_from_quorum_loss(&self, members: Vec<Member>) -> Result<PathBuf> {
        let paths = paths::StateDir::create(&self.config.state_dir)?;
        recovery::recover_from_quorum_loss(&paths, members)
    }
}
