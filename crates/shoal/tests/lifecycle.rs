//! End-to-end lifecycle tests: real daemons over real unix and TLS
//! sockets in temporary state directories.

use std::collections::HashMap;
use std::time::Duration;

use shoal::{ClusterError, DaemonConfig, Hooks, Shoal};

struct Node {
    app: Shoal,
    dir: tempfile::TempDir,
    daemon: tokio::task::JoinHandle<()>,
    address: String,
}

impl Node {
    async fn start() -> Node {
        let dir = tempfile::tempdir().unwrap();
        Self::start_in(dir).await
    }

    async fn start_in(dir: tempfile::TempDir) -> Node {
        let config = DaemonConfig {
            state_dir: dir.path().to_path_buf(),
            version: "1.0.0".to_string(),
            drain_timeout_secs: 1,
            ..DaemonConfig::default()
        };
        let app = Shoal::new(config).unwrap();
        let daemon_app = app.clone();
        let daemon = tokio::spawn(async move {
            daemon_app
                .start(Vec::new(), Hooks::default())
                .await
                .expect("daemon failed");
        });

        app.ready(Some(Duration::from_secs(10))).await.unwrap();

        Node {
            app,
            dir,
            daemon,
            address: format!("127.0.0.1:{}", free_port()),
        }
    }

    /// Waits until the HTTPS cluster socket accepts connections.
    async fn wait_network(&self) {
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(&self.address).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("cluster socket on {} never came up", self.address);
    }

    fn stop(self) -> tempfile::TempDir {
        self.daemon.abort();
        self.dir
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_bootstrap_then_status() {
    let node = Node::start().await;

    let status = node.app.status().await.unwrap();
    assert_eq!(status.phase, "PreInit");

    node.app
        .new_cluster("n1", &node.address, HashMap::new())
        .await
        .unwrap();

    let status = node.app.status().await.unwrap();
    assert_eq!(status.name, "n1");
    assert_eq!(status.address, node.address);
    assert_eq!(status.phase, "Active");
    assert_eq!(status.members, 1);
}

#[tokio::test]
async fn test_issue_token_and_join_then_reuse_fails() {
    let n1 = Node::start().await;
    n1.app
        .new_cluster("n1", &n1.address, HashMap::new())
        .await
        .unwrap();
    n1.wait_network().await;

    let token = n1.app.new_join_token("n2").await.unwrap();

    let n2 = Node::start().await;
    n2.app
        .join_cluster("n2", &n2.address, &token, HashMap::new())
        .await
        .unwrap();

    let status = n2.app.status().await.unwrap();
    assert_eq!(status.phase, "Active");
    assert_eq!(status.members, 2);
    let status = n1.app.status().await.unwrap();
    assert_eq!(status.members, 2);

    // The token was consumed with the join; a third node cannot reuse it.
    let n3 = Node::start().await;
    let err = n3
        .app
        .join_cluster("n2", &n3.address, &token, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidToken { .. }));
    assert_eq!(n3.app.status().await.unwrap().phase, "PreInit");
}

#[tokio::test]
async fn test_revoked_token_cannot_join() {
    let n1 = Node::start().await;
    n1.app
        .new_cluster("n1", &n1.address, HashMap::new())
        .await
        .unwrap();
    n1.wait_network().await;

    let token = n1.app.new_join_token("n3").await.unwrap();
    assert_eq!(n1.app.list_join_tokens().await.unwrap().len(), 1);

    n1.app.revoke_join_token("n3").await.unwrap();
    assert!(n1.app.list_join_tokens().await.unwrap().is_empty());

    let n3 = Node::start().await;
    let err = n3
        .app
        .join_cluster("n3", &n3.address, &token, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::InvalidToken { .. }));
}

#[tokio::test]
async fn test_certificate_update_fans_out_to_peers() {
    let n1 = Node::start().await;
    n1.app
        .new_cluster("n1", &n1.address, HashMap::new())
        .await
        .unwrap();
    n1.wait_network().await;

    let token = n1.app.new_join_token("n2").await.unwrap();
    let n2 = Node::start().await;
    n2.app
        .join_cluster("n2", &n2.address, &token, HashMap::new())
        .await
        .unwrap();
    n2.wait_network().await;

    let replacement = shoal::identity::generate_cluster_keypair("n1").unwrap();
    n1.app
        .update_certificate(
            "cluster",
            shoal::CertificatePut {
                cert_pem: replacement.cert_pem.clone(),
                key_pem: replacement.key_pem.clone(),
                ca_pem: None,
            },
        )
        .await
        .unwrap();

    // Every member holds the same keypair after one round of forwarding.
    let n1_cert = std::fs::read_to_string(n1.dir.path().join("cluster.crt")).unwrap();
    let n2_cert = std::fs::read_to_string(n2.dir.path().join("cluster.crt")).unwrap();
    assert_eq!(n1_cert, replacement.cert_pem);
    assert_eq!(n2_cert, replacement.cert_pem);
}

#[tokio::test]
async fn test_recovery_tarball_unpacks_exactly_once_on_restart() {
    let node = Node::start().await;
    node.app
        .new_cluster("n1", &node.address, HashMap::new())
        .await
        .unwrap();

    let members = node.app.members().await.unwrap();
    assert_eq!(members.len(), 1);

    // Stop the daemon, then run the offline recovery procedure.
    let app = node.app.clone();
    let dir = node.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let tarball = app.recover_from_quorum_loss(members).unwrap();
    assert!(tarball.exists());

    let backups = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("db_backup."))
        .count();
    assert_eq!(backups, 1);

    // Restarting applies the tarball once and comes back Active.
    let node = Node::start_in(dir).await;
    let status = node.app.status().await.unwrap();
    assert_eq!(status.phase, "Active");
    assert_eq!(status.name, "n1");
    assert!(!node.dir.path().join("recovery_db.tar.gz").exists());
}

#[tokio::test]
async fn test_recovery_refuses_while_daemon_runs() {
    let node = Node::start().await;
    node.app
        .new_cluster("n1", &node.address, HashMap::new())
        .await
        .unwrap();

    let members = node.app.members().await.unwrap();
    let err = node.app.recover_from_quorum_loss(members).unwrap_err();
    assert!(err.to_string().contains("still running"));
}
