//! Control-plane endpoints.
//!
//! One router serves both listeners. The listener tags every connection
//! with its [`RequestOrigin`]; handlers authorize against it, so the unix
//! socket grants local administration and the HTTPS socket grants peers
//! whatever their certificate fingerprint earns them in the trust store.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use tracing::warn;

use crate::client::{
    self, ApiErrorBody, CertificatePut, ControlRequest, JoinRequest, SqlQuery, SqlResult,
    TokenRequest, REPLICATION_ORIGIN_HEADER,
};
use crate::error::{ClusterError, Result};
use crate::identity::{self, KeyPair};
use crate::nodestore;
use crate::state::ClusterState;
use crate::tokens;
use crate::truststore::Remote;

/// How a request reached the daemon. Attached per connection by the
/// listener.
#[derive(Debug, Clone)]
pub enum RequestOrigin {
    /// Local administrator over the unix control socket.
    Unix,
    /// Peer over the HTTPS cluster socket, with the fingerprint of the
    /// client certificate it presented.
    Tls { fingerprint: Option<String> },
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<tokio::sync::Mutex<ClusterState>>,
}

/// Error wrapper mapping [`ClusterError`] onto HTTP responses.
pub struct ApiError(ClusterError);

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ClusterError::NotReady | ClusterError::QuorumUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            ClusterError::TrustStoreConflict { .. } => StatusCode::CONFLICT,
            ClusterError::AlreadyInitialized
            | ClusterError::InvalidToken { .. }
            | ClusterError::MembershipInvariant { .. }
            | ClusterError::TarballInvalid { .. }
            | ClusterError::IdentityMissing => StatusCode::BAD_REQUEST,
            ClusterError::Transport { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ApiErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn require_unix(origin: &RequestOrigin) -> Result<()> {
    match origin {
        RequestOrigin::Unix => Ok(()),
        RequestOrigin::Tls { .. } => Err(ClusterError::PermissionDenied {
            reason: "only available over the local control socket".to_string(),
        }),
    }
}

fn require_trusted(origin: &RequestOrigin, state: &ClusterState) -> Result<()> {
    match origin {
        RequestOrigin::Unix => Ok(()),
        RequestOrigin::Tls {
            fingerprint: Some(fingerprint),
        } => {
            for remote in state.trust.remotes() {
                if remote.fingerprint()? == *fingerprint {
                    return Ok(());
                }
            }
            Err(ClusterError::PermissionDenied {
                reason: "client certificate is not in the trust store".to_string(),
            })
        }
        RequestOrigin::Tls { fingerprint: None } => Err(ClusterError::PermissionDenied {
            reason: "no client certificate presented".to_string(),
        }),
    }
}

fn require_active(state: &ClusterState) -> Result<()> {
    match state.phase() {
        crate::state::Phase::Active => Ok(()),
        crate::state::Phase::Uninitialized => Err(ClusterError::NotReady),
        other => Err(ClusterError::internal(format!(
            "operation requires an active member, phase is {other}"
        ))),
    }
}

/// Builds the control-plane router.
pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/1.0", get(get_status))
        .route("/ready", get(get_ready))
        .route("/cluster/control", post(post_control))
        .route("/cluster/tokens", get(get_tokens).post(post_tokens))
        .route("/cluster/tokens/:name", axum::routing::delete(delete_token))
        .route("/cluster/members", get(get_members).post(post_members))
        .route("/cluster/members/:name", axum::routing::delete(delete_member))
        .route("/cluster/certificates/:name", put(put_certificate))
        .route("/internal/sql", get(get_sql).post(post_sql))
        .with_state(app)
}

async fn get_status(State(app): State<AppState>) -> ApiResult<Json<crate::state::Status>> {
    let state = app.state.lock().await;
    Ok(Json(state.status()))
}

async fn get_ready(State(app): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let state = app.state.lock().await;
    if !state.is_ready() {
        return Err(ClusterError::NotReady.into());
    }
    Ok(Json(serde_json::json!({})))
}

async fn post_control(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    Json(request): Json<ControlRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_unix(&origin)?;

    let mut state = app.state.lock().await;
    match (&request.join_token, request.bootstrap) {
        (Some(_), true) => {
            return Err(ClusterError::internal(
                "request cannot both bootstrap and join",
            )
            .into())
        }
        (None, false) => {
            return Err(ClusterError::internal(
                "request must either bootstrap or join",
            )
            .into())
        }
        (Some(token), false) => {
            state
                .join(token, &request.name, &request.address, request.init_config)
                .await?
        }
        (None, true) => {
            state
                .bootstrap(&request.name, &request.address, request.init_config)
                .await?
        }
    }
    Ok(Json(serde_json::json!({})))
}

async fn get_tokens(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
) -> ApiResult<Json<Vec<tokens::TokenRecord>>> {
    let state = app.state.lock().await;
    require_trusted(&origin, &state)?;
    require_active(&state)?;
    let records = tokens::list(state.db.as_ref()).await?;
    Ok(Json(records))
}

async fn post_tokens(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    Json(request): Json<TokenRequest>,
) -> ApiResult<Json<String>> {
    let state = app.state.lock().await;
    require_trusted(&origin, &state)?;
    require_active(&state)?;

    if let Some(leader) = other_leader(&state).await? {
        let envelope = forward_token_issue(&state, &leader, &request.name).await?;
        return Ok(Json(envelope));
    }

    let fingerprint = state.cluster_fingerprint()?;
    let envelope = tokens::issue(
        state.db.as_ref(),
        &state.trust,
        &request.name,
        state.config.token_ttl(),
        &fingerprint,
    )
    .await?;
    Ok(Json(envelope))
}

async fn delete_token(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let state = app.state.lock().await;
    require_trusted(&origin, &state)?;
    require_active(&state)?;

    if let Some(leader) = other_leader(&state).await? {
        let identity = identity::load_keypair(&state.paths, "server")?;
        let fingerprint = state.cluster_fingerprint()?;
        client::revoke_token_remote(&leader, &identity, &fingerprint, &name).await?;
        return Ok(Json(serde_json::json!({})));
    }

    tokens::revoke(state.db.as_ref(), &name).await?;
    Ok(Json(serde_json::json!({})))
}

async fn get_members(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
) -> ApiResult<Json<Vec<nodestore::Member>>> {
    let state = app.state.lock().await;
    require_trusted(&origin, &state)?;
    require_active(&state)?;
    let members = nodestore::current_members(&state.trust, &state.paths.database_dir())?;
    Ok(Json(members))
}

async fn post_members(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let mut state = app.state.lock().await;

    if headers.contains_key(REPLICATION_ORIGIN_HEADER) {
        // Replication notification from a peer that just admitted a new
        // member; record it locally and do not fan out again.
        require_trusted(&origin, &state)?;
        let remote: Remote = serde_json::from_str(&body).map_err(ClusterError::from)?;
        state.import_remote(remote)?;
        return Ok(Json(serde_json::json!({})));
    }

    // A join request authorizes itself with the token secret; the client
    // certificate is deliberately not yet trusted.
    let request: JoinRequest = serde_json::from_str(&body).map_err(ClusterError::from)?;
    let response = state.handle_join_request(request).await?;
    Ok(Json(serde_json::to_value(response).map_err(ClusterError::from)?))
}

async fn delete_member(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut state = app.state.lock().await;
    require_trusted(&origin, &state)?;
    require_active(&state)?;
    state.remove_member(&name).await?;
    Ok(Json(serde_json::json!({})))
}

async fn put_certificate(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CertificatePut>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut state = app.state.lock().await;
    require_trusted(&origin, &state)?;

    if !request.cert_pem.contains("BEGIN CERTIFICATE") {
        return Err(ClusterError::internal("certificate must be PEM encoded").into());
    }
    if !request.key_pem.contains("PRIVATE KEY") {
        return Err(ClusterError::internal("private key must be PEM encoded").into());
    }

    let is_notification = headers.contains_key(REPLICATION_ORIGIN_HEADER);
    let database_open = state.db.is_open().await.is_ok();
    if !database_open {
        warn!(name, "database is offline, only updating the local certificate");
    }

    // Fan the update out to every other member before touching local
    // state, unless this request is itself a notification.
    if !is_notification && database_open {
        fan_out_certificate(&state, &name, &request).await?;
    }

    let keypair = KeyPair {
        cert_pem: request.cert_pem,
        key_pem: request.key_pem,
        ca_pem: request.ca_pem,
    };
    state.update_certificate(&name, &keypair)?;
    Ok(Json(serde_json::json!({})))
}

async fn fan_out_certificate(
    state: &ClusterState,
    name: &str,
    request: &CertificatePut,
) -> Result<()> {
    let self_address = state.address().unwrap_or_default().to_string();
    let identity = identity::load_keypair(&state.paths, "server")?;
    let fingerprint = state.cluster_fingerprint()?;

    for remote in state.trust.remotes() {
        if remote.address == self_address {
            continue;
        }
        client::forward_certificate(
            &remote.address,
            &identity,
            &fingerprint,
            &self_address,
            name,
            request,
        )
        .await
        .map_err(|e| {
            ClusterError::transport(format!(
                "failed to update {name:?} certificate on {}: {e}",
                remote.address
            ))
        })?;
    }
    Ok(())
}

/// Returns the leader address when this node is a follower, `None` when
/// this node is the leader itself.
async fn other_leader(state: &ClusterState) -> Result<Option<String>> {
    let leader = state.db.leader().await?;
    if Some(leader.as_str()) == state.address() {
        Ok(None)
    } else {
        Ok(Some(leader))
    }
}

async fn forward_token_issue(state: &ClusterState, leader: &str, name: &str) -> Result<String> {
    let identity = identity::load_keypair(&state.paths, "server")?;
    let fingerprint = state.cluster_fingerprint()?;
    client::issue_token_remote(leader, &identity, &fingerprint, name).await
}

#[derive(Debug, Deserialize)]
struct SqlParams {
    #[serde(default)]
    schema: bool,
}

async fn get_sql(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    Query(params): Query<SqlParams>,
) -> ApiResult<Json<SqlResult>> {
    require_unix(&origin)?;
    let state = app.state.lock().await;
    require_active(&state)?;
    let text = state.db.dump(params.schema).await?;
    Ok(Json(SqlResult { text }))
}

async fn post_sql(
    State(app): State<AppState>,
    Extension(origin): Extension<RequestOrigin>,
    Json(request): Json<SqlQuery>,
) -> ApiResult<Json<SqlResult>> {
    require_unix(&origin)?;
    let state = app.state.lock().await;
    require_active(&state)?;
    let text = state.db.query(&request.query).await?;
    Ok(Json(SqlResult { text }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::db::LocalEngine;
    use crate::paths::StateDir;
    use crate::state::{Hooks, RuntimeCommand};
    use crate::tls::HotSwapCertResolver;
    use crate::truststore::TrustStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;

    struct Harness {
        _dir: tempfile::TempDir,
        app: AppState,
        _rx: tokio::sync::mpsc::UnboundedReceiver<RuntimeCommand>,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = StateDir::create(dir.path()).unwrap();
        let trust = TrustStore::load(paths.trust_dir()).unwrap();
        let db = Arc::new(LocalEngine::new(paths.database_dir()));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let state = ClusterState::new(
            DaemonConfig {
                state_dir: dir.path().to_path_buf(),
                version: "1.0.0".to_string(),
                ..DaemonConfig::default()
            },
            paths,
            db,
            trust,
            Arc::new(HotSwapCertResolver::new()),
            vec![],
            Hooks::default(),
            tx,
        );
        Harness {
            _dir: dir,
            app: AppState {
                state: Arc::new(tokio::sync::Mutex::new(state)),
            },
            _rx: rx,
        }
    }

    fn unix_router(app: &AppState) -> Router {
        router(app.clone()).layer(Extension(RequestOrigin::Unix))
    }

    async fn send(
        router: Router,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        };
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn bootstrap(harness: &Harness) {
        let mut state = harness.app.state.lock().await;
        state.mark_pre_init();
        state
            .bootstrap("n1", "127.0.0.1:7000", HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_before_ready() {
        let harness = harness().await;
        let (status, body) = send(unix_router(&harness.app), "GET", "/1.0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "Uninitialized");

        let (status, body) = send(unix_router(&harness.app), "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "not_ready");
    }

    #[tokio::test]
    async fn test_bootstrap_then_status() {
        let harness = harness().await;
        harness.app.state.lock().await.mark_pre_init();

        let (status, _body) = send(
            unix_router(&harness.app),
            "POST",
            "/cluster/control",
            Some(serde_json::json!({
                "bootstrap": true,
                "name": "n1",
                "address": "127.0.0.1:7000",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(unix_router(&harness.app), "GET", "/1.0", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "n1");
        assert_eq!(body["address"], "127.0.0.1:7000");
        assert_eq!(body["phase"], "Active");
        assert_eq!(body["members"], 1);
    }

    #[tokio::test]
    async fn test_control_rejects_bootstrap_and_join_together() {
        let harness = harness().await;
        harness.app.state.lock().await.mark_pre_init();
        let (status, _body) = send(
            unix_router(&harness.app),
            "POST",
            "/cluster/control",
            Some(serde_json::json!({
                "bootstrap": true,
                "join_token": "abc",
                "name": "n1",
                "address": "127.0.0.1:7000",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_control_before_pre_init_is_not_ready() {
        let harness = harness().await;
        let (status, body) = send(
            unix_router(&harness.app),
            "POST",
            "/cluster/control",
            Some(serde_json::json!({
                "bootstrap": true,
                "name": "n1",
                "address": "127.0.0.1:7000",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "not_ready");
    }

    #[tokio::test]
    async fn test_token_issue_list_revoke() {
        let harness = harness().await;
        bootstrap(&harness).await;

        let (status, envelope) = send(
            unix_router(&harness.app),
            "POST",
            "/cluster/tokens",
            Some(serde_json::json!({"name": "n2"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(envelope.as_str().unwrap().len() > 32);

        let (status, listed) = send(unix_router(&harness.app), "GET", "/cluster/tokens", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["name"], "n2");

        let (status, _body) = send(
            unix_router(&harness.app),
            "DELETE",
            "/cluster/tokens/n2",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            unix_router(&harness.app),
            "DELETE",
            "/cluster/tokens/n2",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_token");
    }

    #[tokio::test]
    async fn test_tokens_require_active_member() {
        let harness = harness().await;
        harness.app.state.lock().await.mark_pre_init();
        let (status, _body) = send(
            unix_router(&harness.app),
            "POST",
            "/cluster/tokens",
            Some(serde_json::json!({"name": "n2"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_untrusted_tls_client_is_rejected() {
        let harness = harness().await;
        bootstrap(&harness).await;

        let tls_router = router(harness.app.clone()).layer(Extension(RequestOrigin::Tls {
            fingerprint: Some("00".repeat(32)),
        }));
        let (status, body) = send(tls_router, "GET", "/cluster/tokens", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "permission_denied");
    }

    #[tokio::test]
    async fn test_sql_is_unix_only() {
        let harness = harness().await;
        bootstrap(&harness).await;

        let tls_router = router(harness.app.clone()).layer(Extension(RequestOrigin::Tls {
            fingerprint: None,
        }));
        let (status, _body) = send(
            tls_router,
            "POST",
            "/internal/sql",
            Some(serde_json::json!({"query": ".dump"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            unix_router(&harness.app),
            "POST",
            "/internal/sql",
            Some(serde_json::json!({"query": ".schema"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["text"].as_str().unwrap().contains("tokens"));
    }

    #[tokio::test]
    async fn test_join_flow_over_api() {
        let harness = harness().await;
        bootstrap(&harness).await;

        let (_status, envelope) = send(
            unix_router(&harness.app),
            "POST",
            "/cluster/tokens",
            Some(serde_json::json!({"name": "n2"})),
        )
        .await;
        let token = crate::tokens::JoinToken::decode(envelope.as_str().unwrap()).unwrap();

        // The joiner is untrusted at the TLS layer; the token authorizes it.
        let joiner_router = router(harness.app.clone()).layer(Extension(RequestOrigin::Tls {
            fingerprint: Some("11".repeat(32)),
        }));
        let joiner_cert = identity::generate_server_keypair("n2").unwrap();
        let (status, body) = send(
            joiner_router,
            "POST",
            "/cluster/members",
            Some(serde_json::json!({
                "name": "n2",
                "address": "127.0.0.1:7001",
                "secret": token.secret,
                "certificate": joiner_cert.cert_pem,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remotes"].as_array().unwrap().len(), 2);
        assert!(body["cluster"]["cert_pem"]
            .as_str()
            .unwrap()
            .contains("BEGIN CERTIFICATE"));

        let (_status, status_body) = send(unix_router(&harness.app), "GET", "/1.0", None).await;
        assert_eq!(status_body["members"], 2);

        // Reusing the consumed token fails.
        let retry_router = router(harness.app.clone()).layer(Extension(RequestOrigin::Tls {
            fingerprint: Some("22".repeat(32)),
        }));
        let (status, body) = send(
            retry_router,
            "POST",
            "/cluster/members",
            Some(serde_json::json!({
                "name": "n2",
                "address": "127.0.0.1:7002",
                "secret": token.secret,
                "certificate": identity::generate_server_keypair("n2").unwrap().cert_pem,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_token");
    }

    #[tokio::test]
    async fn test_certificate_update_reloads_cluster_cert() {
        let harness = harness().await;
        bootstrap(&harness).await;

        let replacement = identity::generate_cluster_keypair("n1").unwrap();
        let (status, _body) = send(
            unix_router(&harness.app),
            "PUT",
            "/cluster/certificates/cluster",
            Some(serde_json::json!({
                "cert_pem": replacement.cert_pem,
                "key_pem": replacement.key_pem,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let state = harness.app.state.lock().await;
        assert_eq!(
            state.cluster_fingerprint().unwrap(),
            replacement.fingerprint().unwrap()
        );
    }

    #[tokio::test]
    async fn test_certificate_name_cannot_be_a_path() {
        let harness = harness().await;
        bootstrap(&harness).await;

        let replacement = identity::generate_server_keypair("evil").unwrap();
        let (status, _body) = send(
            unix_router(&harness.app),
            "PUT",
            "/cluster/certificates/..%2Fevil",
            Some(serde_json::json!({
                "cert_pem": replacement.cert_pem,
                "key_pem": replacement.key_pem,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_members_listing() {
        let harness = harness().await;
        bootstrap(&harness).await;

        let (status, body) = send(unix_router(&harness.app), "GET", "/cluster/members", None).await;
        assert_eq!(status, StatusCode::OK);
        let members = body.as_array().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0]["name"], "n1");
        assert_eq!(members[0]["role"], "voter");
    }
}
