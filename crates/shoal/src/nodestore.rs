//! Node list persisted by the database engine.
//!
//! `database/cluster.yaml` holds the full node list (id, address, role);
//! `database/info.yaml` holds only this node's id and address and is never
//! replicated to other members.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};
use crate::paths::{NODE_INFO_FILE, NODE_LIST_FILE};
use crate::truststore::TrustStore;

/// Role of a node in the consensus configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Voter,
    StandBy,
    Spare,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Voter => write!(f, "voter"),
            Role::StandBy => write!(f, "stand-by"),
            Role::Spare => write!(f, "spare"),
        }
    }
}

/// One entry of the consensus node list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Role")]
    pub role: Role,
}

/// A cluster member as operators see it: node-list entry joined with the
/// trust store name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub address: String,
    pub role: Role,
}

/// Reads the node list from `database/cluster.yaml` under `database_dir`.
pub fn read_node_list(database_dir: &Path) -> Result<Vec<NodeInfo>> {
    let path = database_dir.join(NODE_LIST_FILE);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| ClusterError::internal(format!("failed to read {path:?}: {e}")))?;
    let nodes: Vec<NodeInfo> = serde_yaml::from_str(&contents)?;
    Ok(nodes)
}

/// Writes the node list. Used by normal engine startup and by recovery.
pub fn write_node_list(database_dir: &Path, nodes: &[NodeInfo]) -> Result<()> {
    let contents = serde_yaml::to_string(nodes)?;
    std::fs::write(database_dir.join(NODE_LIST_FILE), contents)?;
    Ok(())
}

/// Reads this node's identity from `database/info.yaml`.
pub fn read_node_info(database_dir: &Path) -> Result<NodeInfo> {
    let path = database_dir.join(NODE_INFO_FILE);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| ClusterError::internal(format!("failed to read {path:?}: {e}")))?;
    let info: NodeInfo =
        serde_yaml::from_str(&contents).map_err(|_| ClusterError::internal(format!("invalid {path:?}")))?;
    Ok(info)
}

/// Writes this node's identity file.
pub fn write_node_info(database_dir: &Path, info: &NodeInfo) -> Result<()> {
    let contents = serde_yaml::to_string(info)?;
    std::fs::write(database_dir.join(NODE_INFO_FILE), contents)?;
    Ok(())
}

/// Joins the on-disk node list with the trust store to produce the member
/// view used by status reporting and recovery. Not thread safe; callers
/// hold the cluster state lock.
pub fn current_members(trust: &TrustStore, database_dir: &Path) -> Result<Vec<Member>> {
    let nodes = read_node_list(database_dir)?;

    let mut members = Vec::new();
    for remote in trust.remotes() {
        for node in &nodes {
            if remote.address == node.address {
                members.push(Member {
                    id: node.id,
                    name: remote.name.clone(),
                    address: node.address.clone(),
                    role: node.role,
                });
            }
        }
    }

    Ok(members)
}
