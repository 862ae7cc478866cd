//! Database engine contract.
//!
//! The replicated SQL engine is an external collaborator. This module pins
//! down the contract the cluster core relies on: a node list persisted
//! under the database directory, and a handful of operations over the
//! replicated member and token tables, each executing as one serializable
//! transaction.
//!
//! [`LocalEngine`] is a single-process stand-in that honors the contract
//! (transactional mutations, node list, schema versioning) without any
//! replication. It exists so the daemon and the test-suite run without an
//! out-of-process consensus engine.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::nodestore::{read_node_info, read_node_list, write_node_info, write_node_list, NodeInfo, Role};
use crate::tokens::TokenRecord;
use crate::truststore::Remote;

/// One schema migration, applied in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaUpdate {
    /// Unique name recorded once the update has been applied.
    pub name: String,
    /// Statement text handed to the engine.
    pub statement: String,
}

/// Contract between the cluster core and the database engine.
///
/// Mutating operations over the member and token tables each run as a
/// single serializable transaction: concurrent calls observe mutual
/// exclusion across the cluster.
#[async_trait]
pub trait Database: Send + Sync {
    /// Starts this engine as a brand new single-node cluster.
    async fn bootstrap(&self, info: NodeInfo) -> Result<()>;

    /// Starts this engine pointed at an existing cluster.
    async fn join(&self, info: NodeInfo, cluster: Vec<String>) -> Result<()>;

    /// Resumes a previously initialized engine.
    async fn start(&self) -> Result<()>;

    /// Stops the engine, flushing state to the database directory.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Errors with [`ClusterError::QuorumUnavailable`] when the database
    /// cannot currently serve transactions.
    async fn is_open(&self) -> Result<()>;

    /// Address of the current leader.
    async fn leader(&self) -> Result<String>;

    async fn cluster_members(&self) -> Result<Vec<NodeInfo>>;

    /// Demotes and removes the node at `address` from the configuration.
    async fn remove_node(&self, address: &str) -> Result<()>;

    /// Applies any not-yet-applied updates, returning the schema version.
    async fn migrate(&self, updates: &[SchemaUpdate]) -> Result<u64>;

    async fn schema_version(&self) -> Result<u64>;

    /// Records a member in the replicated member table.
    async fn record_remote(&self, remote: Remote) -> Result<()>;

    async fn replicated_remotes(&self) -> Result<Vec<Remote>>;

    async fn delete_remote(&self, name: &str) -> Result<()>;

    async fn insert_token(&self, record: TokenRecord) -> Result<()>;

    async fn list_tokens(&self) -> Result<Vec<TokenRecord>>;

    async fn delete_token(&self, name: &str) -> Result<()>;

    /// Consumes a join token and admits the joiner, all in one transaction:
    /// the record must exist, be unexpired, match `secret`, and the
    /// joiner's certificate fingerprint must not already be trusted. On
    /// success the record is gone, the joiner is in the member table, and
    /// the full member set is returned. Any failure leaves both untouched.
    async fn consume_token(&self, name: &str, secret: &str, joiner: Remote) -> Result<Vec<Remote>>;

    /// `.dump` / `.schema` output for the SQL pass-through endpoint.
    async fn dump(&self, schema_only: bool) -> Result<String>;

    /// Arbitrary query pass-through.
    async fn query(&self, query: &str) -> Result<String>;
}

const DATA_FILE: &str = "data.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct EngineData {
    applied_updates: Vec<String>,
    remotes: BTreeMap<String, Remote>,
    tokens: BTreeMap<String, TokenRecord>,
}

/// Single-process engine behind the [`Database`] contract.
///
/// Provides serializable transactions through one lock and persists every
/// commit to `database/data.json`. It does not replicate; leadership is
/// always the sole voter.
pub struct LocalEngine {
    database_dir: PathBuf,
    running: AtomicBool,
    data: tokio::sync::Mutex<EngineData>,
}

impl LocalEngine {
    pub fn new(database_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_dir: database_dir.into(),
            running: AtomicBool::new(false),
            data: tokio::sync::Mutex::new(EngineData::default()),
        }
    }

    fn data_file(&self) -> PathBuf {
        self.database_dir.join(DATA_FILE)
    }

    fn persist(&self, data: &EngineData) -> Result<()> {
        let path = self.data_file();
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(data)?;
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ClusterError::QuorumUnavailable);
        }
        Ok(())
    }

    /// Synthesizes a stable non-zero node id from an address.
    pub fn node_id_for(address: &str) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in address.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash.max(1)
    }
}

#[async_trait]
impl Database for LocalEngine {
    async fn bootstrap(&self, info: NodeInfo) -> Result<()> {
        std::fs::create_dir_all(&self.database_dir)?;
        write_node_info(&self.database_dir, &info)?;
        write_node_list(&self.database_dir, std::slice::from_ref(&info))?;

        let mut data = self.data.lock().await;
        *data = EngineData::default();
        self.persist(&data)?;
        self.running.store(true, Ordering::SeqCst);
        debug!(id = info.id, address = %info.address, "engine bootstrapped as single-node cluster");
        Ok(())
    }

    async fn join(&self, info: NodeInfo, cluster: Vec<String>) -> Result<()> {
        if cluster.is_empty() {
            return Err(ClusterError::QuorumUnavailable);
        }

        std::fs::create_dir_all(&self.database_dir)?;
        write_node_info(&self.database_dir, &info)?;

        // Stand-in: a real engine learns the node list from the quorum.
        let mut nodes: Vec<NodeInfo> = cluster
            .iter()
            .filter(|a| **a != info.address)
            .map(|address| NodeInfo {
                id: Self::node_id_for(address),
                address: address.clone(),
                role: Role::Voter,
            })
            .collect();
        nodes.push(info.clone());
        write_node_list(&self.database_dir, &nodes)?;

        let mut data = self.data.lock().await;
        *data = EngineData::default();
        self.persist(&data)?;
        self.running.store(true, Ordering::SeqCst);
        debug!(id = info.id, address = %info.address, "engine joined existing cluster");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        read_node_info(&self.database_dir)?;

        let mut data = self.data.lock().await;
        let path = self.data_file();
        *data = if path.exists() {
            let contents = std::fs::read(&path)?;
            serde_json::from_slice(&contents)?
        } else {
            EngineData::default()
        };
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            let data = self.data.lock().await;
            self.persist(&data)?;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn is_open(&self) -> Result<()> {
        self.check_open()
    }

    async fn leader(&self) -> Result<String> {
        self.check_open()?;
        let nodes = read_node_list(&self.database_dir)?;
        nodes
            .iter()
            .find(|n| n.role == Role::Voter)
            .map(|n| n.address.clone())
            .ok_or(ClusterError::QuorumUnavailable)
    }

    async fn cluster_members(&self) -> Result<Vec<NodeInfo>> {
        read_node_list(&self.database_dir)
    }

    async fn remove_node(&self, address: &str) -> Result<()> {
        self.check_open()?;
        let nodes = read_node_list(&self.database_dir)?;
        let remaining: Vec<NodeInfo> = nodes
            .iter()
            .filter(|n| n.address != address)
            .cloned()
            .collect();
        if remaining.len() == nodes.len() {
            return Err(ClusterError::internal(format!(
                "no cluster node at address {address:?}"
            )));
        }
        write_node_list(&self.database_dir, &remaining)?;
        Ok(())
    }

    async fn migrate(&self, updates: &[SchemaUpdate]) -> Result<u64> {
        self.check_open()?;
        let mut data = self.data.lock().await;
        for update in updates {
            if !data.applied_updates.contains(&update.name) {
                debug!(name = %update.name, "applying schema update");
                data.applied_updates.push(update.name.clone());
            }
        }
        self.persist(&data)?;
        Ok(data.applied_updates.len() as u64)
    }

    async fn schema_version(&self) -> Result<u64> {
        let data = self.data.lock().await;
        Ok(data.applied_updates.len() as u64)
    }

    async fn record_remote(&self, remote: Remote) -> Result<()> {
        self.check_open()?;
        let mut data = self.data.lock().await;
        if data.remotes.contains_key(&remote.name) {
            return Err(ClusterError::TrustStoreConflict {
                reason: format!("member {:?} already recorded", remote.name),
            });
        }
        data.remotes.insert(remote.name.clone(), remote);
        self.persist(&data)
    }

    async fn replicated_remotes(&self) -> Result<Vec<Remote>> {
        self.check_open()?;
        let data = self.data.lock().await;
        Ok(data.remotes.values().cloned().collect())
    }

    async fn delete_remote(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let mut data = self.data.lock().await;
        if data.remotes.remove(name).is_none() {
            return Err(ClusterError::internal(format!("no recorded member {name:?}")));
        }
        self.persist(&data)
    }

    async fn insert_token(&self, record: TokenRecord) -> Result<()> {
        self.check_open()?;
        let mut data = self.data.lock().await;
        if data.tokens.contains_key(&record.name) {
            return Err(ClusterError::invalid_token(format!(
                "a token for {:?} already exists",
                record.name
            )));
        }
        data.tokens.insert(record.name.clone(), record);
        self.persist(&data)
    }

    async fn list_tokens(&self) -> Result<Vec<TokenRecord>> {
        self.check_open()?;
        let data = self.data.lock().await;
        Ok(data.tokens.values().cloned().collect())
    }

    async fn delete_token(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let mut data = self.data.lock().await;
        if data.tokens.remove(name).is_none() {
            return Err(ClusterError::invalid_token(format!("no token for {name:?}")));
        }
        self.persist(&data)
    }

    async fn consume_token(&self, name: &str, secret: &str, joiner: Remote) -> Result<Vec<Remote>> {
        self.check_open()?;
        let mut data = self.data.lock().await;

        let record = data
            .tokens
            .get(name)
            .ok_or_else(|| ClusterError::invalid_token(format!("no token for {name:?}")))?;

        if record.is_expired(std::time::SystemTime::now()) {
            return Err(ClusterError::invalid_token(format!("token for {name:?} has expired")));
        }
        if record.secret != secret {
            return Err(ClusterError::invalid_token("secret mismatch"));
        }

        let presented = joiner.fingerprint()?;
        for remote in data.remotes.values() {
            if remote.fingerprint()? == presented {
                return Err(ClusterError::invalid_token(
                    "certificate fingerprint is already trusted",
                ));
            }
        }
        if data.remotes.contains_key(&joiner.name)
            || data.remotes.values().any(|r| r.address == joiner.address)
        {
            return Err(ClusterError::TrustStoreConflict {
                reason: format!("member {:?} conflicts with an existing member", joiner.name),
            });
        }

        data.tokens.remove(name);
        data.remotes.insert(joiner.name.clone(), joiner);
        self.persist(&data)?;

        Ok(data.remotes.values().cloned().collect())
    }

    async fn dump(&self, schema_only: bool) -> Result<String> {
        self.check_open()?;
        if schema_only {
            return Ok("members(name, address, certificate)\ntokens(name, secret, expires_at, join_addresses, cluster_cert_fingerprint)".to_string());
        }
        let data = self.data.lock().await;
        serde_json::to_string_pretty(&*data).map_err(Into::into)
    }

    async fn query(&self, query: &str) -> Result<String> {
        self.check_open()?;
        match query.trim() {
            ".dump" => self.dump(false).await,
            ".schema" => self.dump(true).await,
            other => Err(ClusterError::internal(format!(
                "query pass-through is not supported by the local engine: {other:?}"
            ))),
        }
    }
}
