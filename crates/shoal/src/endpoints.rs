//! Control-plane listeners.
//!
//! The unix control socket comes up first and stays up for the daemon's
//! whole life; the HTTPS cluster socket starts once the node is active.
//! Shutdown stops accepting immediately and gives in-flight requests a
//! bounded drain window. The lazy variant runs the drain in a background
//! task so the request that triggered the shutdown can still write its
//! response; without it a failed bootstrap or join would close the
//! caller's connection before the error reaches it.

use std::ffi::CString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::AbortHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::api::RequestOrigin;
use crate::error::{ClusterError, Result};
use crate::identity::format_sha256_hex;

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A serving listener with its in-flight connection bookkeeping.
#[derive(Debug)]
pub struct Endpoint {
    name: &'static str,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
    active: Arc<AtomicUsize>,
    connections: Arc<Mutex<Vec<AbortHandle>>>,
    socket_path: Option<PathBuf>,
}

impl Endpoint {
    /// Stops accepting connections immediately, then drains in-flight
    /// requests for up to `drain`. A zero drain force-closes. When `lazy`,
    /// the drain runs in a background task and this returns at once.
    pub async fn shutdown(self, drain: Duration, lazy: bool) {
        info!(endpoint = self.name, "stopping listener");
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();

        let name = self.name;
        let active = self.active;
        let connections = self.connections;
        let socket_path = self.socket_path;

        let drain_task = async move {
            if !drain.is_zero() {
                let deadline = Instant::now() + drain;
                while active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
                    tokio::time::sleep(DRAIN_CHECK_INTERVAL).await;
                }
                let leftover = active.load(Ordering::SeqCst);
                if leftover > 0 {
                    warn!(endpoint = name, leftover, "drain window elapsed, force closing");
                }
            }

            let handles = match connections.lock() {
                Ok(mut handles) => std::mem::take(&mut *handles),
                Err(_) => Vec::new(),
            };
            for handle in handles {
                handle.abort();
            }

            if let Some(path) = socket_path {
                let _ = std::fs::remove_file(path);
            }
            debug!(endpoint = name, "listener stopped");
        };

        if lazy {
            tokio::spawn(drain_task);
        } else {
            drain_task.await;
        }
    }
}

fn track_connection(connections: &Arc<Mutex<Vec<AbortHandle>>>, handle: AbortHandle) {
    if let Ok(mut connections) = connections.lock() {
        // Opportunistically drop handles of finished tasks.
        connections.retain(|h| !h.is_finished());
        connections.push(handle);
    }
}

/// Binds the unix control socket, sets 0660 permissions and the
/// configured group, and serves `router` on it.
pub async fn serve_unix(path: &Path, group: &str, router: Router) -> Result<Endpoint> {
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(ClusterError::internal(format!(
            "unix socket at {path:?} is already running"
        )));
    }
    if path.exists() {
        debug!("removing stale control socket");
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| ClusterError::internal(format!("cannot bind control socket: {e}")))?;
    set_socket_access(path, group)?;
    info!(socket = %path.display(), "control socket listening");

    let router = router.layer(Extension(RequestOrigin::Unix));
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let active = Arc::new(AtomicUsize::new(0));
    let connections: Arc<Mutex<Vec<AbortHandle>>> = Arc::new(Mutex::new(Vec::new()));

    let accept_active = active.clone();
    let accept_connections = connections.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(err) => {
                            error!(error = %err, "control socket accept failed");
                            continue;
                        }
                    };

                    accept_active.fetch_add(1, Ordering::SeqCst);
                    let guard_counter = accept_active.clone();
                    let service = TowerToHyperService::new(router.clone());
                    let handle = tokio::spawn(async move {
                        let _guard = ActiveGuard(guard_counter);
                        let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                        if let Err(err) = result {
                            debug!(error = %err, "control socket connection ended with error");
                        }
                    });
                    track_connection(&accept_connections, handle.abort_handle());
                }
            }
        }
    });

    Ok(Endpoint {
        name: "control",
        shutdown_tx,
        accept_task,
        active,
        connections,
        socket_path: Some(path.to_path_buf()),
    })
}

/// Serves `router` over mutual TLS on an already-bound TCP listener.
/// Each connection is tagged with the fingerprint of the client
/// certificate it presented; handlers authorize against the trust store.
pub fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, router: Router) -> Endpoint {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let active = Arc::new(AtomicUsize::new(0));
    let connections: Arc<Mutex<Vec<AbortHandle>>> = Arc::new(Mutex::new(Vec::new()));

    let accept_active = active.clone();
    let accept_connections = connections.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!(error = %err, "cluster socket accept failed");
                            continue;
                        }
                    };

                    accept_active.fetch_add(1, Ordering::SeqCst);
                    let guard_counter = accept_active.clone();
                    let acceptor = acceptor.clone();
                    let router = router.clone();
                    let handle = tokio::spawn(async move {
                        let _guard = ActiveGuard(guard_counter);
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                debug!(peer = %peer, error = %err, "TLS handshake failed");
                                return;
                            }
                        };

                        let fingerprint = tls_stream
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .map(|cert| format_sha256_hex(cert.as_ref()));
                        let service = TowerToHyperService::new(
                            router.layer(Extension(RequestOrigin::Tls { fingerprint })),
                        );

                        let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await;
                        if let Err(err) = result {
                            debug!(peer = %peer, error = %err, "cluster connection ended with error");
                        }
                    });
                    track_connection(&accept_connections, handle.abort_handle());
                }
            }
        }
    });

    Endpoint {
        name: "cluster",
        shutdown_tx,
        accept_task,
        active,
        connections,
        socket_path: None,
    }
}

/// Restricts the control socket to the process user and the configured
/// group (or the process group when none is configured), mode 0660.
fn set_socket_access(path: &Path, group: &str) -> Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(0o660);
    std::fs::set_permissions(path, permissions)?;

    let gid = if group.is_empty() {
        unsafe { libc::getgid() }
    } else {
        lookup_group(group)?
    };

    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| ClusterError::internal("socket path contains a NUL byte"))?;
    let rc = unsafe { libc::chown(c_path.as_ptr(), libc::getuid(), gid) };
    if rc != 0 {
        return Err(ClusterError::internal(format!(
            "cannot change ownership on local socket: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn lookup_group(name: &str) -> Result<libc::gid_t> {
    let c_name = CString::new(name)
        .map_err(|_| ClusterError::internal("group name contains a NUL byte"))?;
    let group = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if group.is_null() {
        return Err(ClusterError::internal(format!(
            "cannot get group ID of {name:?}"
        )));
    }
    Ok(unsafe { (*group).gr_gid })
}
