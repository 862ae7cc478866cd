//! Control-plane clients.
//!
//! Local administration talks HTTP over the unix control socket; members
//! talk to each other over HTTPS with the server certificate as the client
//! identity and the cluster certificate pinned by fingerprint.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::identity::KeyPair;
use crate::nodestore::Member;
use crate::state::Status;
use crate::tls::pinned_client_config;
use crate::tokens::TokenRecord;
use crate::truststore::Remote;

/// Header tagging replication-originated requests so receivers do not fan
/// them out again.
pub const REPLICATION_ORIGIN_HEADER: &str = "x-replication-origin";

/// Join request a prospective member POSTs to an active member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub address: String,
    pub secret: String,
    pub certificate: String,
}

/// Reply to a successful join: the full member set and the cluster
/// keypair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub remotes: Vec<Remote>,
    pub cluster: KeyPair,
}

/// Body of `POST /cluster/control`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub join_token: Option<String>,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub init_config: std::collections::HashMap<String, String>,
}

/// Body of `POST /cluster/tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub name: String,
}

/// Body of `PUT /cluster/certificates/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificatePut {
    pub cert_pem: String,
    pub key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,
}

/// Body of `POST /internal/sql` and its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlQuery {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlResult {
    pub text: String,
}

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub kind: String,
}

fn error_from_response(status: u16, body: &[u8]) -> ClusterError {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) => ClusterError::from_kind(&parsed.kind, parsed.error),
        Err(_) => ClusterError::transport(format!(
            "request failed with status {status}: {}",
            String::from_utf8_lossy(body)
        )),
    }
}

async fn read_response<R: DeserializeOwned>(status: u16, body: Bytes) -> Result<R> {
    if !(200..300).contains(&status) {
        return Err(error_from_response(status, &body));
    }
    serde_json::from_slice(&body).map_err(Into::into)
}

/// Client for the local unix control socket.
///
/// One connection is made per request; the control plane is low traffic
/// and this keeps the client free of pooling state.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn request<B: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R> {
        let stream = tokio::net::UnixStream::connect(&self.socket)
            .await
            .map_err(|e| ClusterError::transport(format!("cannot reach control socket: {e}")))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ClusterError::transport(format!("control socket handshake failed: {e}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let payload = match body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "shoal")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| ClusterError::transport(format!("failed to build request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ClusterError::transport(format!("control socket request failed: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClusterError::transport(format!("failed to read response: {e}")))?
            .to_bytes();

        read_response(status, body).await
    }

    pub async fn status(&self) -> Result<Status> {
        self.request::<(), Status>(Method::GET, "/1.0", None).await
    }

    /// Errors with [`ClusterError::NotReady`] until the daemon has
    /// finished initial setup.
    pub async fn check_ready(&self) -> Result<()> {
        self.request::<(), serde_json::Value>(Method::GET, "/ready", None)
            .await
            .map(|_| ())
    }

    /// Polls the daemon until it reports ready, at a 500 ms cadence,
    /// bounded by `timeout` when given. Logging starts only after about
    /// five seconds of attempts and is sampled after fifteen.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let poll = async {
            let mut last_err = ClusterError::NotReady;
            for attempt in 0u32.. {
                let do_log = attempt > 10 && (attempt < 30 || attempt % 10 == 0);
                match self.check_ready().await {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        if do_log {
                            debug!(attempt, error = %err, "daemon not ready yet");
                        }
                        last_err = err;
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(last_err)
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, poll)
                .await
                .map_err(|_| ClusterError::transport("daemon still not ready after deadline"))?,
            None => poll.await,
        }
    }

    pub async fn bootstrap(
        &self,
        name: &str,
        address: &str,
        init_config: std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let request = ControlRequest {
            bootstrap: true,
            join_token: None,
            name: name.to_string(),
            address: address.to_string(),
            init_config,
        };
        self.request::<_, serde_json::Value>(Method::POST, "/cluster/control", Some(&request))
            .await
            .map(|_| ())
    }

    pub async fn join(
        &self,
        token: &str,
        name: &str,
        address: &str,
        init_config: std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let request = ControlRequest {
            bootstrap: false,
            join_token: Some(token.to_string()),
            name: name.to_string(),
            address: address.to_string(),
            init_config,
        };
        self.request::<_, serde_json::Value>(Method::POST, "/cluster/control", Some(&request))
            .await
            .map(|_| ())
    }

    pub async fn new_join_token(&self, name: &str) -> Result<String> {
        self.request(
            Method::POST,
            "/cluster/tokens",
            Some(&TokenRequest {
                name: name.to_string(),
            }),
        )
        .await
    }

    pub async fn list_join_tokens(&self) -> Result<Vec<TokenRecord>> {
        self.request::<(), _>(Method::GET, "/cluster/tokens", None).await
    }

    pub async fn revoke_join_token(&self, name: &str) -> Result<()> {
        self.request::<(), serde_json::Value>(
            Method::DELETE,
            &format!("/cluster/tokens/{name}"),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn members(&self) -> Result<Vec<Member>> {
        self.request::<(), _>(Method::GET, "/cluster/members", None).await
    }

    pub async fn remove_member(&self, name: &str) -> Result<()> {
        self.request::<(), serde_json::Value>(
            Method::DELETE,
            &format!("/cluster/members/{name}"),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn update_certificate(&self, name: &str, keypair: &CertificatePut) -> Result<()> {
        self.request::<_, serde_json::Value>(
            Method::PUT,
            &format!("/cluster/certificates/{name}"),
            Some(keypair),
        )
        .await
        .map(|_| ())
    }

    pub async fn sql(&self, query: &str) -> Result<String> {
        let result: SqlResult = self
            .request(
                Method::POST,
                "/internal/sql",
                Some(&SqlQuery {
                    query: query.to_string(),
                }),
            )
            .await?;
        Ok(result.text)
    }
}

fn https_client(identity: &KeyPair, pinned_fingerprint: &str) -> Result<reqwest::Client> {
    let tls = pinned_client_config(identity, pinned_fingerprint)?;
    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .build()
        .map_err(|e| ClusterError::transport(format!("failed to build HTTPS client: {e}")))
}

async fn https_response<R: DeserializeOwned>(response: reqwest::Response) -> Result<R> {
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|e| ClusterError::transport(format!("failed to read response: {e}")))?;
    read_response(status, body).await
}

/// Sends a join request to an active member at `address`, presenting the
/// fresh server certificate and pinning the remote to the fingerprint
/// carried in the token.
pub async fn send_join_request(
    address: &str,
    identity: &KeyPair,
    pinned_fingerprint: &str,
    request: &JoinRequest,
) -> Result<JoinResponse> {
    let client = https_client(identity, pinned_fingerprint)?;
    let response = client
        .post(format!("https://{address}/cluster/members"))
        .json(request)
        .send()
        .await
        .map_err(|e| ClusterError::transport(format!("join request to {address} failed: {e}")))?;
    https_response(response).await
}

/// Announces a freshly admitted member to a peer. Tagged with the
/// replication origin so the peer records it locally without re-fanning.
pub async fn notify_new_member(
    address: &str,
    identity: &KeyPair,
    pinned_fingerprint: &str,
    origin: &str,
    joiner: &Remote,
) -> Result<()> {
    let client = https_client(identity, pinned_fingerprint)?;
    let response = client
        .post(format!("https://{address}/cluster/members"))
        .header(REPLICATION_ORIGIN_HEADER, origin)
        .json(joiner)
        .send()
        .await
        .map_err(|e| ClusterError::transport(format!("notification to {address} failed: {e}")))?;
    https_response::<serde_json::Value>(response).await.map(|_| ())
}

/// Issues a token through the leader when this node is a follower.
pub async fn issue_token_remote(
    address: &str,
    identity: &KeyPair,
    pinned_fingerprint: &str,
    name: &str,
) -> Result<String> {
    let client = https_client(identity, pinned_fingerprint)?;
    let response = client
        .post(format!("https://{address}/cluster/tokens"))
        .json(&TokenRequest {
            name: name.to_string(),
        })
        .send()
        .await
        .map_err(|e| ClusterError::transport(format!("token request to {address} failed: {e}")))?;
    https_response(response).await
}

/// Revokes a token through the leader when this node is a follower.
pub async fn revoke_token_remote(
    address: &str,
    identity: &KeyPair,
    pinned_fingerprint: &str,
    name: &str,
) -> Result<()> {
    let client = https_client(identity, pinned_fingerprint)?;
    let response = client
        .delete(format!("https://{address}/cluster/tokens/{name}"))
        .send()
        .await
        .map_err(|e| ClusterError::transport(format!("token revoke on {address} failed: {e}")))?;
    https_response::<serde_json::Value>(response).await.map(|_| ())
}

/// Forwards a certificate update to a peer, tagged as a notification.
pub async fn forward_certificate(
    address: &str,
    identity: &KeyPair,
    pinned_fingerprint: &str,
    origin: &str,
    name: &str,
    keypair: &CertificatePut,
) -> Result<()> {
    let client = https_client(identity, pinned_fingerprint)?;
    let response = client
        .put(format!("https://{address}/cluster/certificates/{name}"))
        .header(REPLICATION_ORIGIN_HEADER, origin)
        .json(keypair)
        .send()
        .await
        .map_err(|e| ClusterError::transport(format!("certificate forward to {address} failed: {e}")))?;
    https_response::<serde_json::Value>(response).await.map(|_| ())
}
