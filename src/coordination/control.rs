//! Control-plane HTTP client.
//!
//! - `POST {base}/ping` exchanges the node's capabilities for an assignment
//! - `POST {base}/stop` tells the control plane the node is going away

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::ServerAssignment;
use crate::config::ClientSettings;

/// Protocol build number reported to the control plane.
pub const BUILD_VERSION: u32 = 13;

/// Bound on a single control-plane exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PingRequest<'a> {
    secret: &'a str,
    port: u16,
    disk_space: u64,
    network_speed: u64,
    build_version: u32,
    tls_created_at: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StopRequest<'a> {
    secret: &'a str,
}

#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    /// Register (or re-register) this node and return its assignment.
    ///
    /// An assignment without an image server is rejected: there would be
    /// nothing to fetch cache misses from.
    #[instrument(skip_all, fields(port = settings.client_port))]
    pub async fn ping(&self, settings: &ClientSettings) -> Result<ServerAssignment> {
        let request = PingRequest {
            secret: &settings.client_secret,
            port: settings.client_port,
            disk_space: settings.reported_disk_space_bytes(),
            network_speed: settings.network_speed_bytes_per_second(),
            build_version: BUILD_VERSION,
            tls_created_at: None,
        };

        let url = self.endpoint("ping");
        let resp = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to reach control plane at {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("control plane ping returned {status}");
        }

        let assignment: ServerAssignment = resp
            .json()
            .await
            .context("failed to decode control plane ping response")?;

        anyhow::ensure!(
            !assignment.image_server.trim().is_empty(),
            "control plane assignment has no image server"
        );

        info!(
            image_server = %assignment.image_server,
            url = ?assignment.url,
            latest_build = ?assignment.latest_build,
            paused = assignment.paused,
            tls = assignment.tls.is_some(),
            "server settings received"
        );
        if assignment.compromised {
            warn!("control plane reports this node's credentials as compromised");
        }

        Ok(assignment)
    }

    /// Tell the control plane this node is shutting down.
    #[instrument(skip_all)]
    pub async fn stop(&self, secret: &str) -> Result<()> {
        let url = self.endpoint("stop");
        self.http
            .post(&url)
            .timeout(self.request_timeout)
            .json(&StopRequest { secret })
            .send()
            .await
            .with_context(|| format!("failed to reach control plane at {url}"))?
            .error_for_status()
            .context("control plane rejected stop request")?;
        info!("deregistered from control plane");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::testutil::spawn_server;

    fn settings() -> ClientSettings {
        ClientSettings {
            client_secret: "s3cret".into(),
            ..ClientSettings::default()
        }
    }

    #[tokio::test]
    async fn ping_sends_capabilities_and_parses_assignment() {
        let seen: Arc<Mutex<Option<Value>>> = Arc::default();
        let app = Router::new().route(
            "/ping",
            post({
                let seen = Arc::clone(&seen);
                move |Json(body): Json<Value>| async move {
                    *seen.lock().unwrap() = Some(body);
                    Json(json!({
                        "imageServer": "https://img.example/",
                        "tls": {"certificate": "C", "privateKey": "K"}
                    }))
                }
            }),
        );
        let base = spawn_server(app).await;

        let client = ControlPlaneClient::new(reqwest::Client::new(), base);
        let assignment = client.ping(&settings()).await.unwrap();
        assert_eq!(assignment.image_server, "https://img.example/");
        assert!(assignment.tls.is_some());

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["secret"], "s3cret");
        assert_eq!(body["port"], 44300);
        assert_eq!(body["diskSpace"], 1024u64 * 1024 * 1024);
        assert_eq!(body["networkSpeed"], 1_250_000);
        assert_eq!(body["buildVersion"], BUILD_VERSION);
        assert!(body["tlsCreatedAt"].is_null());
    }

    #[tokio::test]
    async fn empty_image_server_is_rejected() {
        let app = Router::new().route(
            "/ping",
            post(|| async { Json(json!({"imageServer": ""})) }),
        );
        let base = spawn_server(app).await;
        let client = ControlPlaneClient::new(reqwest::Client::new(), base);
        let err = client.ping(&settings()).await.unwrap_err();
        assert!(err.to_string().contains("no image server"));
    }

    #[tokio::test]
    async fn error_status_is_rejected() {
        let app = Router::new().route("/ping", post(|| async { StatusCode::UNAUTHORIZED }));
        let base = spawn_server(app).await;
        let client = ControlPlaneClient::new(reqwest::Client::new(), base);
        assert!(client.ping(&settings()).await.is_err());
    }

    #[tokio::test]
    async fn stop_posts_secret() {
        let seen: Arc<Mutex<Option<Value>>> = Arc::default();
        let app = Router::new().route(
            "/stop",
            post({
                let seen = Arc::clone(&seen);
                move |Json(body): Json<Value>| async move {
                    *seen.lock().unwrap() = Some(body);
                    StatusCode::OK
                }
            }),
        );
        let base = spawn_server(app).await;
        let client = ControlPlaneClient::new(reqwest::Client::new(), format!("{base}/"));
        client.stop("s3cret").await.unwrap();
        assert_eq!(seen.lock().unwrap().clone().unwrap(), json!({"secret": "s3cret"}));
    }

    #[tokio::test]
    async fn unresponsive_control_plane_times_out() {
        let app = Router::new().route(
            "/ping",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                StatusCode::OK
            }),
        );
        let base = spawn_server(app).await;
        let client = ControlPlaneClient::new(reqwest::Client::new(), base)
            .with_request_timeout(Duration::from_millis(200));

        let result = tokio::time::timeout(Duration::from_secs(5), client.ping(&settings()))
            .await
            .expect("ping was not bounded by the request timeout");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_an_error() {
        let client = ControlPlaneClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
        assert!(client.stop("s3cret").await.is_err());
    }
}
