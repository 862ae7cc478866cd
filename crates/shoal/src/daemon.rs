//! Daemon composition root.
//!
//! Owns the listeners and the run loop. The state machine owns the
//! shutdown channel and only ever sends commands here, so the cyclic
//! server-holds-state / state-stops-server ownership is broken into one
//! direction plus a channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::DaemonConfig;
use crate::db::{Database, LocalEngine, SchemaUpdate};
use crate::endpoints::{self, Endpoint};
use crate::error::{ClusterError, Result};
use crate::paths::StateDir;
use crate::recovery;
use crate::state::{ClusterState, Hooks, RuntimeCommand};
use crate::tls::{self, HotSwapCertResolver};
use crate::truststore::TrustStore;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Runs the daemon until a shutdown signal or a graceful removal.
///
/// Comes up with only the unix control socket; an operator drives the
/// node into a cluster through it. A recovery tarball present in the
/// state directory is applied before anything else starts.
pub async fn run(config: DaemonConfig, schema: Vec<SchemaUpdate>, hooks: Hooks) -> Result<()> {
    config.validate()?;
    let paths = StateDir::create(&config.state_dir)?;

    recovery::maybe_unpack_recovery_tarball(&paths)?;

    let db: Arc<dyn Database> = Arc::new(LocalEngine::new(paths.database_dir()));
    let trust = TrustStore::load(paths.trust_dir())?;
    let cert_resolver = Arc::new(HotSwapCertResolver::new());
    let (runtime_tx, mut runtime_rx) = tokio::sync::mpsc::unbounded_channel();

    let state = ClusterState::new(
        config.clone(),
        paths.clone(),
        db.clone(),
        trust,
        cert_resolver.clone(),
        schema,
        hooks,
        runtime_tx,
    );
    let app = AppState {
        state: Arc::new(tokio::sync::Mutex::new(state)),
    };
    let router = api::router(app.clone());

    let control = endpoints::serve_unix(&paths.control_socket(), &config.socket_group, router.clone()).await?;
    app.state.lock().await.mark_pre_init();
    info!(state_dir = %paths.root().display(), "daemon ready");

    // A previously initialized member resumes straight into Active.
    if paths.is_initialized() {
        let mut state = app.state.lock().await;
        if let Err(err) = state.resume().await {
            error!(error = %err, "failed to resume existing cluster member");
            return Err(err);
        }
    }

    let heartbeat = spawn_heartbeat(app.clone());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    ignore_sighup()?;
    #[cfg(target_os = "linux")]
    let mut sigpwr = signal(SignalKind::from_raw(libc::SIGPWR))?;
    #[cfg(not(target_os = "linux"))]
    let mut sigpwr = signal(SignalKind::terminate())?;

    let mut network: Option<Endpoint> = None;
    let mut lazy_shutdown = false;

    loop {
        tokio::select! {
            _ = sigterm.recv() => { info!("received SIGTERM, shutting down"); break; }
            _ = sigint.recv() => { info!("received SIGINT, shutting down"); break; }
            _ = sigquit.recv() => { info!("received SIGQUIT, shutting down"); break; }
            _ = sigpwr.recv() => { info!("received SIGPWR, shutting down"); break; }
            command = runtime_rx.recv() => {
                match command {
                    Some(RuntimeCommand::ActivateNetwork { address }) => {
                        if network.is_some() {
                            continue;
                        }
                        match start_network(&address, cert_resolver.clone(), router.clone()).await {
                            Ok(endpoint) => network = Some(endpoint),
                            Err(err) => error!(address, error = %err, "failed to start cluster socket"),
                        }
                    }
                    Some(RuntimeCommand::Shutdown { lazy }) => {
                        lazy_shutdown = lazy;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    heartbeat.abort();

    let drain = config.drain_timeout();
    if let Some(network) = network {
        network.shutdown(drain, lazy_shutdown).await;
    }
    control.shutdown(drain, lazy_shutdown).await;
    if lazy_shutdown {
        // Give the background drains a moment to flush the response of
        // the request that triggered this shutdown.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if let Err(err) = db.stop().await {
        warn!(error = %err, "database engine did not stop cleanly");
    }

    info!("daemon stopped");
    Ok(())
}

async fn start_network(
    address: &str,
    cert_resolver: Arc<HotSwapCertResolver>,
    router: axum::Router,
) -> Result<Endpoint> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| ClusterError::transport(format!("cannot bind cluster socket on {address}: {e}")))?;
    let server_config = tls::server_config(cert_resolver)?;
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    info!(address, "cluster socket listening");
    Ok(endpoints::serve_tls(listener, acceptor, router))
}

/// Periodically reconciles the local trust store with the replicated
/// member table while the node is active.
fn spawn_heartbeat(app: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut state = app.state.lock().await;
            if state.phase() != crate::state::Phase::Active {
                continue;
            }
            if let Err(err) = state.reconcile_trust_store().await {
                warn!(error = %err, "trust store reconciliation failed");
            }
        }
    })
}

fn ignore_sighup() -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            sighup.recv().await;
        }
    });
    Ok(())
}
