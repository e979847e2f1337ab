//! Worker node clients

use crate::error::{FleetError, FleetResult};
use crate::types::{DeployInfo, InstanceId, InstanceStatus, LogLine};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, header};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Largest prediction payload forwarded to a worker
const MAX_PREDICT_BODY_BYTES: usize = 64 * 1024 * 1024;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Capabilities the control plane needs from a single worker node.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Build and start an instance, returning once it is ready to serve
    async fn deploy(&self, instance_id: InstanceId, info: &DeployInfo, bundle: &Path)
    -> FleetResult<()>;

    /// Stop and remove an instance
    async fn destroy(&self, instance_id: InstanceId) -> FleetResult<()>;

    /// Liveness check for one instance
    async fn heartbeat(&self, instance_id: InstanceId) -> FleetResult<()>;

    /// Liveness check for the worker itself
    async fn ping(&self) -> FleetResult<()>;

    /// Every instance the worker currently knows about
    async fn status(&self) -> FleetResult<Vec<InstanceStatus>>;

    /// Proxy a prediction request to an instance
    async fn predict(
        &self,
        instance_id: InstanceId,
        request: Request<Body>,
    ) -> FleetResult<Response<Body>>;

    /// Drain the worker's buffered log lines
    async fn logs(&self) -> FleetResult<Vec<LogLine>>;
}

/// Creates worker clients from base URLs
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, base_url: &str) -> FleetResult<Arc<dyn WorkerClient>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Prefix a scheme when the address has none
pub fn normalize_worker_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

fn parse_base_url(base_url: &str) -> FleetResult<reqwest::Url> {
    let invalid = |reason: &str| FleetError::InvalidWorkerUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };

    let mut url = reqwest::Url::parse(base_url).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("scheme must be 'http' or 'https'"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("no host in url"));
    }

    // Url::join replaces the last path segment unless the base ends with '/'
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

/// Connector for workers reachable over HTTP(S)
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    /// `request_timeout` bounds every worker call, including builds
    pub fn new(request_timeout: Duration) -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

impl WorkerConnector for HttpConnector {
    fn connect(&self, base_url: &str) -> FleetResult<Arc<dyn WorkerClient>> {
        let base_url = parse_base_url(base_url)?;
        Ok(Arc::new(HttpWorkerClient {
            base_url,
            client: self.client.clone(),
        }))
    }
}

/// Client for a single worker node's HTTP API
///
/// The client shares its connection pool with every other client created by
/// the same [`HttpConnector`].
pub struct HttpWorkerClient {
    base_url: reqwest::Url,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(rename = "Deployments", default)]
    deployments: Vec<InstanceStatus>,
}

impl HttpWorkerClient {
    fn endpoint(&self, route: &str) -> FleetResult<reqwest::Url> {
        self.base_url
            .join(route)
            .map_err(|e| FleetError::Internal(format!("invalid worker route '{}': {}", route, e)))
    }

    fn instance_endpoint(&self, route: &str, instance_id: InstanceId) -> FleetResult<reqwest::Url> {
        let mut url = self.endpoint(route)?;
        url.set_query(Some(&format!("id={}", instance_id)));
        Ok(url)
    }

    /// Turn a non-2xx response into an error carrying the worker's message
    async fn check(response: reqwest::Response) -> FleetResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(FleetError::Worker(format!("{}: {}", status, body.trim())))
    }
}

/// Length-prefixed JSON header followed by the raw bundle
fn encode_deploy_payload(info: &DeployInfo, bundle: &[u8]) -> FleetResult<Vec<u8>> {
    let info_json = serde_json::to_vec(info)?;
    let mut payload = Vec::with_capacity(8 + info_json.len() + bundle.len());
    payload.extend_from_slice(&(info_json.len() as u64).to_be_bytes());
    payload.extend_from_slice(&info_json);
    payload.extend_from_slice(bundle);
    Ok(payload)
}

/// Query string for the worker: caller's parameters minus any `id`, plus ours
fn predict_query(original: Option<&str>, instance_id: InstanceId) -> String {
    let mut parts: Vec<String> = original
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty() && *p != "id" && !p.starts_with("id="))
        .map(str::to_string)
        .collect();
    parts.push(format!("id={}", instance_id));
    parts.join("&")
}

fn forwardable_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in [
        header::HOST,
        header::CONNECTION,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::AUTHORIZATION,
    ] {
        forwarded.remove(name);
    }
    forwarded
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn deploy(
        &self,
        instance_id: InstanceId,
        info: &DeployInfo,
        bundle: &Path,
    ) -> FleetResult<()> {
        let bundle_bytes = tokio::fs::read(bundle).await?;
        let payload = encode_deploy_payload(info, &bundle_bytes)?;

        let response = self
            .client
            .post(self.instance_endpoint("deploy", instance_id)?)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn destroy(&self, instance_id: InstanceId) -> FleetResult<()> {
        let response = self
            .client
            .post(self.instance_endpoint("stop", instance_id)?)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FleetError::NoSuchInstance(instance_id));
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn heartbeat(&self, instance_id: InstanceId) -> FleetResult<()> {
        let response = self
            .client
            .get(self.instance_endpoint("heartbeat", instance_id)?)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn ping(&self) -> FleetResult<()> {
        let response = self.client.get(self.endpoint("ping")?).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn status(&self) -> FleetResult<Vec<InstanceStatus>> {
        let response = self.client.get(self.endpoint("status")?).send().await?;
        let status: StatusResponse = Self::check(response).await?.json().await?;
        Ok(status.deployments)
    }

    async fn predict(
        &self,
        instance_id: InstanceId,
        request: Request<Body>,
    ) -> FleetResult<Response<Body>> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_PREDICT_BODY_BYTES)
            .await
            .map_err(|e| FleetError::Internal(format!("could not read request body: {}", e)))?;

        let mut url = self.endpoint("predict")?;
        url.set_query(Some(&predict_query(parts.uri.query(), instance_id)));

        let upstream = self
            .client
            .request(parts.method, url)
            .headers(forwardable_request_headers(&parts.headers))
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if name != header::TRANSFER_ENCODING && name != header::CONNECTION {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| FleetError::Internal(format!("could not build proxy response: {}", e)))
    }

    async fn logs(&self) -> FleetResult<Vec<LogLine>> {
        let response = self.client.get(self.endpoint("logs")?).send().await?;
        let body = Self::check(response).await?.bytes().await?;
        serde_json::Deserializer::from_slice(&body)
            .into_iter::<LogLine>()
            .map(|line| line.map_err(FleetError::from))
            .collect()
    }
}
