//! Cluster lifecycle state machine.
//!
//! A node moves through `Uninitialized -> PreInit -> {Bootstrapping |
//! Joining} -> Active`, and from `Active` to `Leaving` on graceful
//! removal. Transitions are serialized by the single lock wrapping
//! [`ClusterState`]; they are not re-entrant.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::client;
use crate::config::DaemonConfig;
use crate::db::{Database, LocalEngine, SchemaUpdate};
use crate::error::{ClusterError, Result};
use crate::identity::{self, KeyPair};
use crate::nodestore::{self, NodeInfo, Role};
use crate::paths::StateDir;
use crate::tls::HotSwapCertResolver;
use crate::truststore::{Remote, TrustStore};

/// Lifecycle phase of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Uninitialized,
    PreInit,
    Bootstrapping,
    Joining,
    Active,
    Leaving,
    Recovering,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Uninitialized => "Uninitialized",
            Phase::PreInit => "PreInit",
            Phase::Bootstrapping => "Bootstrapping",
            Phase::Joining => "Joining",
            Phase::Active => "Active",
            Phase::Leaving => "Leaving",
            Phase::Recovering => "Recovering",
        };
        write!(f, "{s}")
    }
}

/// Context handed to application hooks.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub name: String,
    pub address: String,
    pub init_config: HashMap<String, String>,
}

/// An application hook invoked at a lifecycle transition point.
pub type Hook =
    Box<dyn Fn(HookContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Application hooks around lifecycle transitions. All optional.
#[derive(Default)]
pub struct Hooks {
    pub pre_bootstrap: Option<Hook>,
    pub post_bootstrap: Option<Hook>,
    pub post_join: Option<Hook>,
    pub pre_remove: Option<Hook>,
    pub post_remove: Option<Hook>,
}

impl Hooks {
    async fn run(hook: &Option<Hook>, ctx: &HookContext) -> Result<()> {
        if let Some(hook) = hook {
            hook(ctx.clone()).await?;
        }
        Ok(())
    }
}

/// Commands the state machine sends to the daemon run loop. The daemon
/// owns the listeners; the state machine owns this channel. This is the
/// only direction control flows, so neither side holds the other alive.
#[derive(Debug)]
pub enum RuntimeCommand {
    /// Bring up the HTTPS cluster socket on `address`.
    ActivateNetwork { address: String },
    /// Stop the daemon. `lazy` lets the triggering request finish writing
    /// its response before its own connection is closed.
    Shutdown { lazy: bool },
}

pub type RuntimeSender = tokio::sync::mpsc::UnboundedSender<RuntimeCommand>;

/// Status served at `GET /1.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub address: String,
    pub phase: String,
    pub version: String,
    pub members: usize,
}

/// Shared, lock-guarded state of one cluster member.
pub struct ClusterState {
    pub(crate) config: DaemonConfig,
    pub(crate) paths: StateDir,
    pub(crate) db: Arc<dyn Database>,
    pub(crate) trust: TrustStore,
    pub(crate) cert_resolver: Arc<HotSwapCertResolver>,
    pub(crate) schema: Vec<SchemaUpdate>,
    hooks: Hooks,
    runtime: RuntimeSender,
    phase: Phase,
    name: Option<String>,
    address: Option<String>,
}

impl ClusterState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DaemonConfig,
        paths: StateDir,
        db: Arc<dyn Database>,
        trust: TrustStore,
        cert_resolver: Arc<HotSwapCertResolver>,
        schema: Vec<SchemaUpdate>,
        hooks: Hooks,
        runtime: RuntimeSender,
    ) -> Self {
        Self {
            config,
            paths,
            db,
            trust,
            cert_resolver,
            schema,
            hooks,
            runtime,
            phase: Phase::Uninitialized,
            name: None,
            address: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// True once the control socket is serving and bootstrap or join may
    /// be attempted.
    pub fn is_ready(&self) -> bool {
        self.phase != Phase::Uninitialized
    }

    pub fn status(&self) -> Status {
        Status {
            name: self.name.clone().unwrap_or_default(),
            address: self.address.clone().unwrap_or_default(),
            phase: self.phase.to_string(),
            version: self.config.version.clone(),
            members: self.trust.len(),
        }
    }

    /// Fingerprint of the cluster certificate on disk.
    pub fn cluster_fingerprint(&self) -> Result<String> {
        identity::load_keypair(&self.paths, "cluster")?.fingerprint()
    }

    /// Marks the control socket as up. Called once by the daemon.
    pub fn mark_pre_init(&mut self) {
        if self.phase == Phase::Uninitialized {
            self.phase = Phase::PreInit;
        }
    }

    /// Resumes an already-initialized member directly into Active.
    pub async fn resume(&mut self) -> Result<()> {
        let info = nodestore::read_node_info(&self.paths.database_dir())?;
        let remote = self
            .trust
            .by_address(&info.address)
            .ok_or_else(|| {
                ClusterError::internal(format!(
                    "node address {:?} has no trust store entry",
                    info.address
                ))
            })?
            .clone();

        self.db.start().await?;
        self.cert_resolver
            .reload(&identity::load_keypair(&self.paths, "cluster")?)?;

        self.name = Some(remote.name.clone());
        self.address = Some(remote.address.clone());
        self.phase = Phase::Active;
        self.activate_network(&remote.address);
        info!(name = %remote.name, address = %remote.address, "resumed cluster member");
        Ok(())
    }

    fn guard_pre_init(&self) -> Result<()> {
        match self.phase {
            Phase::Uninitialized => Err(ClusterError::NotReady),
            Phase::PreInit => Ok(()),
            _ => Err(ClusterError::AlreadyInitialized),
        }
    }

    fn guard_active(&self) -> Result<()> {
        match self.phase {
            Phase::Uninitialized => Err(ClusterError::NotReady),
            Phase::Active => Ok(()),
            _ => Err(ClusterError::internal(format!(
                "operation requires an active member, phase is {}",
                self.phase
            ))),
        }
    }

    fn activate_network(&self, address: &str) {
        let _ = self.runtime.send(RuntimeCommand::ActivateNetwork {
            address: address.to_string(),
        });
    }

    /// Bootstraps a brand new cluster with this node as its only member.
    pub async fn bootstrap(
        &mut self,
        name: &str,
        address: &str,
        init_config: HashMap<String, String>,
    ) -> Result<()> {
        self.guard_pre_init()?;
        if self.paths.is_initialized() {
            return Err(ClusterError::AlreadyInitialized);
        }
        if name.is_empty() || address.is_empty() {
            return Err(ClusterError::internal("bootstrap requires a name and an address"));
        }

        self.phase = Phase::Bootstrapping;
        info!(name, address, "bootstrapping new cluster");

        match self.bootstrap_inner(name, address, init_config).await {
            Ok(()) => {
                self.name = Some(name.to_string());
                self.address = Some(address.to_string());
                self.phase = Phase::Active;
                self.activate_network(address);
                info!(name, "cluster bootstrapped");
                Ok(())
            }
            Err(err) => {
                error!(name, error = %err, "bootstrap failed, reverting");
                self.rollback().await;
                Err(err)
            }
        }
    }

    async fn bootstrap_inner(
        &mut self,
        name: &str,
        address: &str,
        init_config: HashMap<String, String>,
    ) -> Result<()> {
        let server = identity::generate_server_keypair(name)?;
        let cluster = identity::generate_cluster_keypair(name)?;
        identity::write_keypair(&self.paths, "server", &server)?;
        identity::write_keypair(&self.paths, "cluster", &cluster)?;
        self.cert_resolver.reload(&cluster)?;

        let remote = Remote {
            name: name.to_string(),
            address: address.to_string(),
            certificate: server.cert_pem.clone(),
        };
        self.trust.add(remote.clone())?;

        let ctx = HookContext {
            name: name.to_string(),
            address: address.to_string(),
            init_config,
        };
        Hooks::run(&self.hooks.pre_bootstrap, &ctx).await?;

        self.db
            .bootstrap(NodeInfo {
                id: LocalEngine::node_id_for(address),
                address: address.to_string(),
                role: Role::Voter,
            })
            .await?;
        self.db.record_remote(remote).await?;
        self.db.migrate(&self.schema).await?;

        Hooks::run(&self.hooks.post_bootstrap, &ctx).await?;
        Ok(())
    }

    /// Joins an existing cluster using a token issued by one of its
    /// members.
    pub async fn join(
        &mut self,
        token_envelope: &str,
        name: &str,
        address: &str,
        init_config: HashMap<String, String>,
    ) -> Result<()> {
        self.guard_pre_init()?;
        if self.paths.is_initialized() {
            return Err(ClusterError::AlreadyInitialized);
        }

        let token = crate::tokens::JoinToken::decode(token_envelope)?;
        if token.name != name {
            return Err(ClusterError::invalid_token(format!(
                "token was issued for {:?}, not {name:?}",
                token.name
            )));
        }

        self.phase = Phase::Joining;
        info!(name, address, "joining existing cluster");

        match self.join_inner(&token, name, address, init_config).await {
            Ok(()) => {
                self.name = Some(name.to_string());
                self.address = Some(address.to_string());
                self.phase = Phase::Active;
                self.activate_network(address);
                info!(name, "joined cluster");
                Ok(())
            }
            Err(err) => {
                error!(name, error = %err, "join failed, wiping local state");
                self.rollback().await;
                Err(err)
            }
        }
    }

    async fn join_inner(
        &mut self,
        token: &crate::tokens::JoinToken,
        name: &str,
        address: &str,
        init_config: HashMap<String, String>,
    ) -> Result<()> {
        let server = identity::generate_server_keypair(name)?;
        identity::write_keypair(&self.paths, "server", &server)?;

        let request = client::JoinRequest {
            name: name.to_string(),
            address: address.to_string(),
            secret: token.secret.clone(),
            certificate: server.cert_pem.clone(),
        };

        let mut response = None;
        let mut last_err = ClusterError::transport("token carries no join addresses");
        for join_address in &token.join_addresses {
            match client::send_join_request(join_address, &server, &token.fingerprint, &request).await
            {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(err) => {
                    warn!(join_address, error = %err, "join attempt failed, trying next address");
                    last_err = err;
                }
            }
        }
        let response = response.ok_or(last_err)?;

        identity::write_keypair(&self.paths, "cluster", &response.cluster)?;
        self.cert_resolver.reload(&response.cluster)?;
        self.trust.replace(response.remotes.clone())?;

        let cluster_addresses: Vec<String> = response
            .remotes
            .iter()
            .map(|r| r.address.clone())
            .collect();
        self.db
            .join(
                NodeInfo {
                    id: LocalEngine::node_id_for(address),
                    address: address.to_string(),
                    role: Role::Spare,
                },
                cluster_addresses,
            )
            .await?;
        self.db.migrate(&self.schema).await?;

        let ctx = HookContext {
            name: name.to_string(),
            address: address.to_string(),
            init_config,
        };
        Hooks::run(&self.hooks.post_join, &ctx).await?;
        Ok(())
    }

    /// Admits a joiner on this active member. The token consume and the
    /// member insert commit in one database transaction before the local
    /// trust store is touched.
    pub async fn handle_join_request(
        &mut self,
        request: client::JoinRequest,
    ) -> Result<client::JoinResponse> {
        self.guard_active()?;

        let joiner = Remote {
            name: request.name.clone(),
            address: request.address.clone(),
            certificate: request.certificate.clone(),
        };

        let remotes = self
            .db
            .consume_token(&request.name, &request.secret, joiner.clone())
            .await?;

        // Database transaction committed; now mirror to the local disk
        // trust store and notify the other members.
        self.trust.add(joiner.clone())?;
        self.notify_members_of_join(&joiner).await;

        let cluster = identity::load_keypair(&self.paths, "cluster")?;
        info!(name = %request.name, address = %request.address, "admitted new member");
        Ok(client::JoinResponse { remotes, cluster })
    }

    async fn notify_members_of_join(&self, joiner: &Remote) {
        let self_address = self.address.clone().unwrap_or_default();
        let identity = match identity::load_keypair(&self.paths, "server") {
            Ok(k) => k,
            Err(err) => {
                warn!(error = %err, "cannot load server identity for member notification");
                return;
            }
        };
        let fingerprint = match self.cluster_fingerprint() {
            Ok(f) => f,
            Err(err) => {
                warn!(error = %err, "cannot load cluster fingerprint for member notification");
                return;
            }
        };

        for remote in self.trust.remotes() {
            if remote.address == self_address || remote.address == joiner.address {
                continue;
            }
            if let Err(err) = client::notify_new_member(
                &remote.address,
                &identity,
                &fingerprint,
                &self_address,
                joiner,
            )
            .await
            {
                warn!(peer = %remote.address, error = %err, "failed to notify member of join");
            }
        }
    }

    /// Records a remote announced by another member's join notification.
    pub fn import_remote(&mut self, remote: Remote) -> Result<()> {
        if self.trust.get(&remote.name).is_some() {
            return Ok(());
        }
        self.trust.add(remote)
    }

    /// Reconciles the local trust store with the replicated member table.
    /// The local store may briefly be a superset while joins are in
    /// flight; the database is authoritative once transactions commit.
    pub async fn reconcile_trust_store(&mut self) -> Result<()> {
        self.guard_active()?;
        let replicated = self.db.replicated_remotes().await?;
        if replicated.is_empty() {
            return Ok(());
        }

        let known: Vec<String> = self.trust.remotes().map(|r| r.name.clone()).collect();
        let replicated_names: Vec<&str> = replicated.iter().map(|r| r.name.as_str()).collect();
        let changed = known.len() != replicated.len()
            || known.iter().any(|n| !replicated_names.contains(&n.as_str()));
        if changed {
            self.trust.replace(replicated)?;
        }
        Ok(())
    }

    /// Gracefully removes the member called `name`. Removing self walks
    /// the Leaving transition and shuts the daemon down.
    pub async fn remove_member(&mut self, name: &str) -> Result<()> {
        self.guard_active()?;

        if self.name.as_deref() == Some(name) {
            return self.leave().await;
        }

        let address = self
            .trust
            .get(name)
            .map(|r| r.address.clone())
            .ok_or_else(|| ClusterError::internal(format!("no cluster member named {name:?}")))?;

        self.db.delete_remote(name).await?;
        self.db.remove_node(&address).await?;
        self.trust.remove(name)?;
        info!(name, address, "removed cluster member");
        Ok(())
    }

    /// Leaves the cluster: demote and remove this node from the consensus
    /// configuration, delete the local Remote for self last, then clear
    /// the state directory.
    async fn leave(&mut self) -> Result<()> {
        let name = self.name.clone().unwrap_or_default();
        let address = self.address.clone().unwrap_or_default();
        self.phase = Phase::Leaving;
        info!(name, "leaving cluster");

        let ctx = HookContext {
            name: name.clone(),
            address: address.clone(),
            init_config: HashMap::new(),
        };
        Hooks::run(&self.hooks.pre_remove, &ctx).await?;

        self.db.delete_remote(&name).await?;
        self.db.remove_node(&address).await?;
        self.db.stop().await?;
        self.trust.remove(&name)?;
        self.paths.wipe()?;
        self.trust = TrustStore::load(self.paths.trust_dir())?;

        Hooks::run(&self.hooks.post_remove, &ctx).await?;

        self.name = None;
        self.address = None;
        self.phase = Phase::Uninitialized;
        let _ = self.runtime.send(RuntimeCommand::Shutdown { lazy: true });
        Ok(())
    }

    /// Writes a named keypair to the state directory, hot-reloading the
    /// HTTPS listener when the cluster certificate changes.
    pub fn update_certificate(&mut self, name: &str, keypair: &KeyPair) -> Result<()> {
        identity::write_keypair(&self.paths, name, keypair)?;
        if name == "cluster" {
            self.cert_resolver.reload(keypair)?;
        }
        Ok(())
    }

    /// Best-effort revert of a failed bootstrap or join.
    async fn rollback(&mut self) {
        if let Err(err) = self.db.stop().await {
            warn!(error = %err, "failed to stop database during rollback");
        }
        if let Err(err) = self.paths.wipe() {
            warn!(error = %err, "failed to wipe state directory during rollback");
        }
        match TrustStore::load(self.paths.trust_dir()) {
            Ok(trust) => self.trust = trust,
            Err(err) => warn!(error = %err, "failed to reload trust store during rollback"),
        }
        self.name = None;
        self.address = None;
        self.phase = Phase::PreInit;
    }
}
