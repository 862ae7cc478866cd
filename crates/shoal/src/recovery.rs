//! Quorum-loss recovery.
//!
//! When fewer than a quorum of voters remain, an operator runs the
//! recovery procedure on the surviving member with the most recent log:
//! the node list is rewritten to the operator-supplied membership and the
//! database directory is packaged into `recovery_db.tar.gz` for manual
//! distribution. Every other member unpacks the tarball at next start.
//!
//! Two preconditions cannot be verified from here and are the operator's
//! responsibility: every member's database engine must be stopped, and
//! the invoking node must hold the most up-to-date log. The only local
//! evidence available is the control socket; a live daemon refuses the
//! procedure.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{info, warn};

use crate::error::{ClusterError, Result};
use crate::nodestore::{self, Member, NodeInfo};
use crate::paths::{StateDir, NODE_INFO_FILE, NODE_LIST_FILE};
use crate::truststore::TrustStore;

/// Reads the current membership from the trust store and the on-disk node
/// list, without starting the database engine.
pub fn current_members(paths: &StateDir) -> Result<Vec<Member>> {
    let trust = TrustStore::load(paths.trust_dir())?;
    nodestore::current_members(&trust, &paths.database_dir())
}

/// Compares the operator-supplied member set against the current one.
/// The sets must have the same length and every new entry must match an
/// existing entry by id, name and address; only roles may change.
pub fn validate_member_changes(old: &[Member], new: &[Member]) -> Result<()> {
    if new.len() != old.len() {
        return Err(ClusterError::MembershipInvariant {
            reason: "members cannot be added or removed".to_string(),
        });
    }

    for candidate in new {
        let matched = old.iter().any(|existing| {
            existing.id == candidate.id
                && existing.name == candidate.name
                && existing.address == candidate.address
        });
        if !matched {
            return Err(ClusterError::MembershipInvariant {
                reason: format!("ID or address changed for member {}", candidate.name),
            });
        }
    }

    Ok(())
}

/// Rebuilds the consensus configuration on this node and packages the
/// database directory for the other members. Returns the tarball path.
///
/// Invoke exactly once per recovery, on one node only. A database backup
/// is taken before anything is rewritten.
pub fn recover_from_quorum_loss(paths: &StateDir, members: Vec<Member>) -> Result<PathBuf> {
    ensure_daemon_stopped(paths)?;

    let old = current_members(paths)?;
    validate_member_changes(&old, &members)?;

    create_database_backup(paths)?;

    let nodes: Vec<NodeInfo> = members
        .iter()
        .map(|m| NodeInfo {
            id: m.id,
            address: m.address.clone(),
            role: m.role,
        })
        .collect();
    nodestore::write_node_list(&paths.database_dir(), &nodes)?;

    let tarball = create_recovery_tarball(paths)?;
    info!(tarball = %tarball.display(), "recovery tarball ready for distribution");
    Ok(tarball)
}

/// A connectable control socket means the daemon, and with it the
/// database engine, is still running locally.
fn ensure_daemon_stopped(paths: &StateDir) -> Result<()> {
    let socket = paths.control_socket();
    if std::os::unix::net::UnixStream::connect(&socket).is_ok() {
        return Err(ClusterError::internal(
            "the daemon is still running; stop every cluster member before recovery",
        ));
    }
    Ok(())
}

/// Packages the database directory, excluding the per-node identity file,
/// into `recovery_db.tar.gz` in the state directory.
fn create_recovery_tarball(paths: &StateDir) -> Result<PathBuf> {
    let tarball = paths.recovery_tarball();
    let database_dir = paths.database_dir();

    // info.yaml carries this member's id and address and must never be
    // replicated to the others; each target regenerates it after unpack.
    let files = list_files(&database_dir)?
        .into_iter()
        .filter(|name| name != NODE_INFO_FILE)
        .collect::<Vec<_>>();

    create_tarball(&tarball, &database_dir, None, &files)?;
    Ok(tarball)
}

/// Writes `db_backup.<timestamp>.tar.gz` of the database directory into
/// the state directory. The timestamp is ISO-8601 basic: tar interprets
/// `:` as a remote drive, so colons are omitted.
pub fn create_database_backup(paths: &StateDir) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y-%m-%dT%H%M%S%z");
    let backup = paths.root().join(format!("db_backup.{stamp}.tar.gz"));
    info!(archive = %backup.display(), "creating database backup");

    let files = list_files(&paths.database_dir())?;
    create_tarball(&backup, &paths.database_dir(), Some("database"), &files)?;
    Ok(backup)
}

/// Checks for a recovery tarball in the state directory and, when one is
/// present, replaces the database directory with its contents. Returns
/// true when a recovery was performed.
///
/// The tarball is deleted afterwards so a restart does not unpack twice.
pub fn maybe_unpack_recovery_tarball(paths: &StateDir) -> Result<bool> {
    let tarball = paths.recovery_tarball();
    if !tarball.exists() {
        return Ok(false);
    }

    warn!(tarball = %tarball.display(), "recovery tarball located, attempting database recovery");

    let unpack_dir = paths.root().join("recovery_db");
    if unpack_dir.exists() {
        std::fs::remove_dir_all(&unpack_dir)?;
    }
    unpack_tarball(&tarball, &unpack_dir)?;

    let incoming = read_incoming_node_list(&unpack_dir)?;

    // Preserve this member's id: the local identity file is carried over
    // into the incoming directory byte for byte.
    let local_info_path = paths.node_info();
    let local_info = nodestore::read_node_info(&paths.database_dir())?;
    if !incoming.iter().any(|node| node.id == local_info.id) {
        return Err(ClusterError::IdentityMissing);
    }
    std::fs::copy(&local_info_path, unpack_dir.join(NODE_INFO_FILE))?;

    create_database_backup(paths)?;

    let database_dir = paths.database_dir();
    std::fs::remove_dir_all(&database_dir)?;
    std::fs::rename(&unpack_dir, &database_dir)?;

    std::fs::remove_file(&tarball)?;
    info!("database recovered from tarball");
    Ok(true)
}

fn read_incoming_node_list(unpack_dir: &Path) -> Result<Vec<NodeInfo>> {
    let path = unpack_dir.join(NODE_LIST_FILE);
    let contents = std::fs::read_to_string(&path).map_err(|_| ClusterError::TarballInvalid {
        reason: format!("missing {NODE_LIST_FILE} in recovery tarball"),
    })?;
    let nodes: Vec<NodeInfo> =
        serde_yaml::from_str(&contents).map_err(|_| ClusterError::TarballInvalid {
            reason: format!("unreadable {NODE_LIST_FILE} in recovery tarball"),
        })?;
    if nodes.is_empty() {
        return Err(ClusterError::TarballInvalid {
            reason: format!("empty {NODE_LIST_FILE} in recovery tarball"),
        });
    }
    Ok(nodes)
}

fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

/// Creates a gzipped tarball of `files` from `dir`. Entry names are the
/// bare file names, optionally under `prefix`. Subdirectories are not
/// handled; the database directory is flat.
fn create_tarball(
    tarball_path: &Path,
    dir: &Path,
    prefix: Option<&str>,
    files: &[String],
) -> Result<()> {
    let tarball = File::create(tarball_path)?;
    let encoder = GzEncoder::new(tarball, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for filename in files {
        let mut file = File::open(dir.join(filename))?;
        let entry_name = match prefix {
            Some(prefix) => format!("{prefix}/{filename}"),
            None => filename.clone(),
        };
        builder
            .append_file(&entry_name, &mut file)
            .map_err(|e| ClusterError::internal(format!("failed to archive {filename:?}: {e}")))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| ClusterError::internal(format!("failed to finish archive: {e}")))?;
    let tarball = encoder
        .finish()
        .map_err(|e| ClusterError::internal(format!("failed to finish compression: {e}")))?;
    tarball.sync_all()?;
    Ok(())
}

/// Unpacks a flat tarball into `dest_root`, rejecting any entry whose
/// name contains `..` (CWE-22) and any entry whose written byte count
/// does not match its header size.
fn unpack_tarball(tarball_path: &Path, dest_root: &Path) -> Result<()> {
    let tarball = File::open(tarball_path)?;
    let decoder = GzDecoder::new(tarball);
    let mut archive = tar::Archive::new(decoder);

    std::fs::create_dir_all(dest_root)?;

    for entry in archive
        .entries()
        .map_err(|e| ClusterError::TarballInvalid {
            reason: format!("unreadable archive: {e}"),
        })?
    {
        let mut entry = entry.map_err(|e| ClusterError::TarballInvalid {
            reason: format!("unreadable archive entry: {e}"),
        })?;

        let name = entry
            .path()
            .map_err(|e| ClusterError::TarballInvalid {
                reason: format!("unreadable entry name: {e}"),
            })?
            .into_owned();
        let name_str = name.to_string_lossy();
        if name_str.split('/').any(|part| part == "..") {
            return Err(ClusterError::TarballInvalid {
                reason: format!("invalid sequence `..` in recovery tarball entry {name_str:?}"),
            });
        }

        let size = entry.header().size().map_err(|e| ClusterError::TarballInvalid {
            reason: format!("unreadable entry size: {e}"),
        })?;

        let dest = dest_root.join(&name);
        let mut file = File::create(&dest)?;
        let written = copy_entry(&mut entry, &mut file)?;
        if written != size {
            return Err(ClusterError::TarballInvalid {
                reason: format!(
                    "mismatched written ({written}) and size ({size}) for entry {name_str:?}"
                ),
            });
        }
    }

    Ok(())
}

fn copy_entry(reader: &mut impl Read, writer: &mut impl Write) -> Result<u64> {
    let mut buffer = [0u8; 8192];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            return Ok(written);
        }
        writer.write_all(&buffer[..n])?;
        written += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodestore::Role;

    fn member(id: u64, name: &str, address: &str, role: Role) -> Member {
        Member {
            id,
            name: name.to_string(),
            address: address.to_string(),
            role,
        }
    }

    fn seeded_state_dir() -> (tempfile::TempDir, StateDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StateDir::create(dir.path()).unwrap();
        std::fs::write(paths.database_dir().join("data.json"), b"{\"tables\":1}").unwrap();
        nodestore::write_node_list(
            &paths.database_dir(),
            &[
                NodeInfo {
                    id: 1,
                    address: "10.0.0.1:7000".to_string(),
                    role: Role::Voter,
                },
                NodeInfo {
                    id: 2,
                    address: "10.0.0.2:7000".to_string(),
                    role: Role::Voter,
                },
            ],
        )
        .unwrap();
        nodestore::write_node_info(
            &paths.database_dir(),
            &NodeInfo {
                id: 1,
                address: "10.0.0.1:7000".to_string(),
                role: Role::Voter,
            },
        )
        .unwrap();
        (dir, paths)
    }

    #[test]
    fn test_validate_allows_role_changes_only() {
        let old = vec![
            member(1, "n1", "10.0.0.1:7000", Role::Voter),
            member(2, "n2", "10.0.0.2:7000", Role::Voter),
        ];
        let new = vec![
            member(1, "n1", "10.0.0.1:7000", Role::Voter),
            member(2, "n2", "10.0.0.2:7000", Role::Spare),
        ];
        assert!(validate_member_changes(&old, &new).is_ok());
    }

    #[test]
    fn test_validate_rejects_added_or_removed_members() {
        let old = vec![member(1, "n1", "10.0.0.1:7000", Role::Voter)];
        let new = vec![
            member(1, "n1", "10.0.0.1:7000", Role::Voter),
            member(3, "n3", "10.0.0.3:7000", Role::Voter),
        ];
        let err = validate_member_changes(&old, &new).unwrap_err();
        assert!(matches!(err, ClusterError::MembershipInvariant { .. }));
    }

    #[test]
    fn test_validate_rejects_address_change() {
        let old = vec![member(1, "n1", "10.0.0.1:7000", Role::Voter)];
        let new = vec![member(1, "n1", "10.9.9.9:7000", Role::Voter)];
        let err = validate_member_changes(&old, &new).unwrap_err();
        assert!(matches!(err, ClusterError::MembershipInvariant { .. }));
    }

    #[test]
    fn test_validate_rejects_renamed_member() {
        let old = vec![member(1, "n1", "10.0.0.1:7000", Role::Voter)];
        let new = vec![member(1, "n4", "10.0.0.1:7000", Role::Voter)];
        assert!(validate_member_changes(&old, &new).is_err());
    }

    #[test]
    fn test_recovery_tarball_excludes_node_info() {
        let (_guard, paths) = seeded_state_dir();
        let tarball = create_recovery_tarball(&paths).unwrap();

        let unpack = paths.root().join("check");
        unpack_tarball(&tarball, &unpack).unwrap();
        assert!(unpack.join(NODE_LIST_FILE).exists());
        assert!(unpack.join("data.json").exists());
        assert!(!unpack.join(NODE_INFO_FILE).exists());
    }

    #[test]
    fn test_pack_unpack_preserves_contents() {
        let (_guard, paths) = seeded_state_dir();
        let tarball = create_recovery_tarball(&paths).unwrap();

        let unpack = paths.root().join("check");
        unpack_tarball(&tarball, &unpack).unwrap();
        let original = std::fs::read(paths.database_dir().join("data.json")).unwrap();
        let roundtrip = std::fs::read(unpack.join("data.json")).unwrap();
        assert_eq!(original, roundtrip);
    }

    #[test]
    fn test_unpack_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let tarball_path = dir.path().join("recovery_db.tar.gz");

        let tarball = File::create(&tarball_path).unwrap();
        let encoder = GzEncoder::new(tarball, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let payload = b"owned";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "../../evil", payload.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.path().join("unpack");
        let err = unpack_tarball(&tarball_path, &dest).unwrap_err();
        assert!(matches!(err, ClusterError::TarballInvalid { .. }));
        assert!(!dir.path().parent().unwrap().join("evil").exists());
    }

    #[test]
    fn test_unpack_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let tarball_path = dir.path().join("recovery_db.tar.gz");

        // Hand-craft an archive whose header promises ten bytes but whose
        // stream ends after three.
        let mut header = tar::Header::new_gnu();
        header.set_path("data.json").unwrap();
        header.set_size(10);
        header.set_cksum();
        let mut raw = Vec::new();
        raw.extend_from_slice(header.as_bytes());
        raw.extend_from_slice(b"abc");

        let tarball = File::create(&tarball_path).unwrap();
        let mut encoder = GzEncoder::new(tarball, Compression::default());
        encoder.write_all(&raw).unwrap();
        encoder.finish().unwrap();

        let dest = dir.path().join("unpack");
        let err = unpack_tarball(&tarball_path, &dest).unwrap_err();
        assert!(matches!(err, ClusterError::TarballInvalid { .. }));
    }

    #[test]
    fn test_recover_rejects_membership_change() {
        let (_guard, paths) = seeded_state_dir();
        let trust_cert = crate::identity::generate_server_keypair("n1").unwrap().cert_pem;
        let mut trust = TrustStore::load(paths.trust_dir()).unwrap();
        trust
            .add(crate::truststore::Remote {
                name: "n1".to_string(),
                address: "10.0.0.1:7000".to_string(),
                certificate: trust_cert,
            })
            .unwrap();
        let cert2 = crate::identity::generate_server_keypair("n2").unwrap().cert_pem;
        trust
            .add(crate::truststore::Remote {
                name: "n2".to_string(),
                address: "10.0.0.2:7000".to_string(),
                certificate: cert2,
            })
            .unwrap();

        let err = recover_from_quorum_loss(
            &paths,
            vec![
                member(1, "n1", "10.0.0.1:7000", Role::Voter),
                member(4, "n4", "10.0.0.4:7000", Role::Spare),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::MembershipInvariant { .. }));
        assert!(!paths.recovery_tarball().exists());
    }

    #[test]
    fn test_recover_then_unpack_on_second_node() {
        // Node n1 performs the recovery.
        let (_guard1, n1) = seeded_state_dir();
        let mut trust = TrustStore::load(n1.trust_dir()).unwrap();
        for (name, address) in [("n1", "10.0.0.1:7000"), ("n2", "10.0.0.2:7000")] {
            trust
                .add(crate::truststore::Remote {
                    name: name.to_string(),
                    address: address.to_string(),
                    certificate: crate::identity::generate_server_keypair(name).unwrap().cert_pem,
                })
                .unwrap();
        }

        let tarball = recover_from_quorum_loss(
            &n1,
            vec![
                member(1, "n1", "10.0.0.1:7000", Role::Voter),
                member(2, "n2", "10.0.0.2:7000", Role::Spare),
            ],
        )
        .unwrap();
        assert!(tarball.exists());

        // A backup was taken before the rewrite.
        let backups: Vec<_> = std::fs::read_dir(n1.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("db_backup."))
            .collect();
        assert_eq!(backups.len(), 1);

        // Node n2 receives the tarball in its state directory.
        let (_guard2, n2) = seeded_state_dir();
        nodestore::write_node_info(
            &n2.database_dir(),
            &NodeInfo {
                id: 2,
                address: "10.0.0.2:7000".to_string(),
                role: Role::Voter,
            },
        )
        .unwrap();
        let n2_info_before = std::fs::read(n2.node_info()).unwrap();
        std::fs::copy(&tarball, n2.recovery_tarball()).unwrap();

        assert!(maybe_unpack_recovery_tarball(&n2).unwrap());

        // Local identity preserved bit for bit, new node list applied,
        // tarball deleted so a restart is a no-op.
        assert_eq!(std::fs::read(n2.node_info()).unwrap(), n2_info_before);
        let nodes = nodestore::read_node_list(&n2.database_dir()).unwrap();
        assert_eq!(nodes[1].role, Role::Spare);
        assert!(!n2.recovery_tarball().exists());
        assert!(!maybe_unpack_recovery_tarball(&n2).unwrap());
    }

    #[test]
    fn test_unpack_aborts_when_local_id_missing() {
        let (_guard1, n1) = seeded_state_dir();
        let mut trust = TrustStore::load(n1.trust_dir()).unwrap();
        for (name, address) in [("n1", "10.0.0.1:7000"), ("n2", "10.0.0.2:7000")] {
            trust
                .add(crate::truststore::Remote {
                    name: name.to_string(),
                    address: address.to_string(),
                    certificate: crate::identity::generate_server_keypair(name).unwrap().cert_pem,
                })
                .unwrap();
        }
        let tarball = recover_from_quorum_loss(
            &n1,
            vec![
                member(1, "n1", "10.0.0.1:7000", Role::Voter),
                member(2, "n2", "10.0.0.2:7000", Role::Spare),
            ],
        )
        .unwrap();

        // A node whose id is not in the incoming list must refuse.
        let (_guard3, stranger) = seeded_state_dir();
        nodestore::write_node_info(
            &stranger.database_dir(),
            &NodeInfo {
                id: 99,
                address: "10.0.0.9:7000".to_string(),
                role: Role::Voter,
            },
        )
        .unwrap();
        std::fs::copy(&tarball, stranger.recovery_tarball()).unwrap();

        let err = maybe_unpack_recovery_tarball(&stranger).unwrap_err();
        assert!(matches!(err, ClusterError::IdentityMissing));
    }

    #[test]
    fn test_backup_name_has_basic_iso8601_stamp() {
        let (_guard, paths) = seeded_state_dir();
        let backup = create_database_backup(&paths).unwrap();
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("db_backup."));
        assert!(name.ends_with(".tar.gz"));
        assert!(!name.contains(':'));
    }
}
