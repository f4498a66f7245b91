//! Thin client for the connection endpoints of the BastionZero service.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::daemon::{DaemonKind, KubeTarget, RemoteTarget, TargetDetails};
use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectionRequest {
    pub target_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_groups: Vec<String>,
}

/// Everything the service hands back for a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionGrant {
    pub connection_id: String,
    pub target_id: String,
    pub target_name: String,
    #[serde(default)]
    pub remote_host: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub target_cluster: Option<String>,
    #[serde(default)]
    pub default_namespace: Option<String>,
    pub connection_service_url: String,
    pub connection_auth_token: String,
    pub agent_pub_key: String,
}

impl ConnectionGrant {
    pub fn target_details(
        &self,
        kind: DaemonKind,
        target_user: Option<String>,
        target_groups: Vec<String>,
    ) -> TargetDetails {
        let remote = || RemoteTarget {
            target_id: self.target_id.clone(),
            target_name: self.target_name.clone(),
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            target_user: target_user.clone(),
        };
        match kind {
            DaemonKind::Db => TargetDetails::Db(remote()),
            DaemonKind::Rdp => TargetDetails::Rdp(remote()),
            DaemonKind::SqlServer => TargetDetails::SqlServer(remote()),
            DaemonKind::Web => TargetDetails::Web(remote()),
            DaemonKind::Kube => TargetDetails::Kube(KubeTarget {
                target_id: self.target_id.clone(),
                target_cluster: self
                    .target_cluster
                    .clone()
                    .unwrap_or_else(|| self.target_name.clone()),
                target_user: target_user.clone().unwrap_or_default(),
                target_groups,
                default_namespace: self.default_namespace.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionApi {
    client: reqwest::Client,
    base_url: String,
    session_token: String,
}

impl ConnectionApi {
    pub fn new(base_url: &str, session_token: &str) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent("zli").build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token: session_token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.base_url, path)
    }

    pub async fn create_connection(
        &self,
        kind: DaemonKind,
        request: &CreateConnectionRequest,
    ) -> Result<ConnectionGrant> {
        let url = self.url(&format!("connections/{}", kind));
        debug!(url = %url, target = %request.target_name, "Creating connection");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.session_token)
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let grant: ConnectionGrant = response.json().await?;
        trace!(connection_id = %grant.connection_id, "Connection created");
        Ok(grant)
    }

    /// Tell the service a connection is finished. A connection the service
    /// no longer knows about counts as closed.
    pub async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let url = self.url(&format!("connections/{}/close", connection_id));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.session_token)
            .send()
            .await?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(connection_id, "Connection closed");
            return Ok(());
        }
        Err(api_error(response).await)
    }
}

async fn api_error(response: reqwest::Response) -> DaemonError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .ok()
        .filter(|body| !body.trim().is_empty())
        .unwrap_or_else(|| "no response body".to_string());
    DaemonError::Api { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one request, answering with `status_line` and `body`. Returns
    /// the base URL and a handle yielding the raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let raw = read_request(&mut socket).await;
            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\
                 connection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            raw
        });
        (base, handle)
    }

    /// Headers plus a `content-length` body, however the client split its writes.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            raw.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length || n == 0 {
                    return text;
                }
            } else if n == 0 {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn create_connection_posts_with_bearer_token() {
        let (base, request) = serve_once(
            "HTTP/1.1 200 OK",
            concat!(
                r#"{"connectionId":"c-1","targetId":"t-1","targetName":"prod","#,
                r#""targetCluster":"prod-eks","connectionServiceUrl":"wss://cn","#,
                r#""connectionAuthToken":"ct","agentPubKey":"pk"}"#,
            ),
        )
        .await;
        let api = ConnectionApi::new(&format!("{}/", base), "session").unwrap();

        let grant = api
            .create_connection(
                DaemonKind::Kube,
                &CreateConnectionRequest {
                    target_name: "prod".into(),
                    target_user: Some("admin".into()),
                    target_groups: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(grant.connection_id, "c-1");

        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /api/v2/connections/kube "));
        assert!(raw.to_lowercase().contains("authorization: bearer session"));
        assert!(raw.contains(r#""targetUser":"admin""#));

        match grant.target_details(DaemonKind::Kube, Some("admin".into()), vec!["ops".into()]) {
            TargetDetails::Kube(kube) => {
                assert_eq!(kube.target_cluster, "prod-eks");
                assert_eq!(kube.target_groups, vec!["ops"]);
            }
            other => panic!("expected kube target, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let (base, _request) = serve_once("HTTP/1.1 401 Unauthorized", "session expired").await;
        let api = ConnectionApi::new(&base, "stale").unwrap();

        let err = api.close_connection("c-1").await.unwrap_err();
        match &err {
            DaemonError::Api { status, message } => {
                assert_eq!(*status, 401);
                assert_eq!(message, "session expired");
            }
            other => panic!("expected api error, got {:?}", other),
        }
        assert!(err.remediation().is_some());
    }

    #[tokio::test]
    async fn closing_unknown_connection_is_ok() {
        let (base, _request) = serve_once("HTTP/1.1 404 Not Found", "").await;
        let api = ConnectionApi::new(&base, "s").unwrap();
        api.close_connection("gone").await.unwrap();
    }
}
