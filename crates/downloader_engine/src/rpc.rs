use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use downloader_core::{DaemonReport, DownloadDescriptor, JobId};
use engine_logging::{engine_debug, engine_trace};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};

use crate::daemon::DaemonConnection;
use crate::response;
use crate::types::RpcError;

/// Calls the orchestrator makes on the download daemon.
#[async_trait::async_trait]
pub trait DaemonRpc: Send + Sync {
    async fn add_uri(&self, descriptor: &DownloadDescriptor) -> Result<JobId, RpcError>;
    async fn tell_status(&self, id: &JobId) -> Result<DaemonReport, RpcError>;
    async fn pause(&self, id: &JobId) -> Result<(), RpcError>;
    async fn unpause(&self, id: &JobId) -> Result<(), RpcError>;
    async fn remove(&self, id: &JobId) -> Result<(), RpcError>;
}

/// JSON-RPC over HTTP client for the download daemon.
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    secret: String,
    max_tries: u32,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(connection: &DaemonConnection, request_timeout: Duration) -> Result<Self, RpcError> {
        Self::with_endpoint(connection.endpoint(), connection.secret.clone(), request_timeout)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        secret: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            secret: secret.into(),
            max_tries: 0,
            next_id: AtomicU64::new(0),
        })
    }

    /// Per-download retry budget handed to the daemon with every add call.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// One request/response round trip. Returns the raw reply body.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<String, RpcError> {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut all_params = Vec::with_capacity(params.len() + 1);
        all_params.push(Value::String(format!("token:{}", self.secret)));
        all_params.extend(params);

        let request = json!({
            "jsonrpc": "2.0",
            "id": format!("dl_{seq}"),
            "method": method,
            "params": all_params,
        });
        engine_trace!("rpc -> {method} dl_{seq}");

        let response = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(request.to_string())
            .send()
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RpcError::Transport(err.to_string()))?;

        if !status.is_success() {
            // The daemon reports JSON-RPC errors with a non-2xx status and an error body.
            return match response::parse_result(&body) {
                Err(protocol @ RpcError::Protocol { .. }) => Err(protocol),
                _ => Err(RpcError::HttpStatus(status.as_u16())),
            };
        }
        Ok(body)
    }

    fn add_options(&self, descriptor: &DownloadDescriptor) -> Map<String, Value> {
        let mut options = Map::new();
        if self.max_tries > 0 {
            options.insert("max-tries".into(), Value::String(self.max_tries.to_string()));
            options.insert("retry-wait".into(), Value::String("2".into()));
        }
        if let Some(name) = descriptor.output_name() {
            options.insert("out".into(), Value::String(name.to_string()));
        }
        if !descriptor.headers.is_empty() {
            options.insert("header".into(), json!(descriptor.headers));
        }
        options
    }
}

#[async_trait::async_trait]
impl DaemonRpc for RpcClient {
    async fn add_uri(&self, descriptor: &DownloadDescriptor) -> Result<JobId, RpcError> {
        let options = self.add_options(descriptor);
        let body = self
            .call(
                "aria2.addUri",
                vec![json!([descriptor.url]), Value::Object(options)],
            )
            .await?;
        let id = response::parse_job_id(&body)?;
        engine_debug!("daemon accepted {} as {id}", descriptor.url);
        Ok(id)
    }

    async fn tell_status(&self, id: &JobId) -> Result<DaemonReport, RpcError> {
        let body = self
            .call("aria2.tellStatus", vec![Value::String(id.to_string())])
            .await?;
        response::parse_status(&body)
    }

    async fn pause(&self, id: &JobId) -> Result<(), RpcError> {
        let body = self
            .call("aria2.pause", vec![Value::String(id.to_string())])
            .await?;
        response::parse_ack(&body)
    }

    async fn unpause(&self, id: &JobId) -> Result<(), RpcError> {
        let body = self
            .call("aria2.unpause", vec![Value::String(id.to_string())])
            .await?;
        response::parse_ack(&body)
    }

    async fn remove(&self, id: &JobId) -> Result<(), RpcError> {
        let body = self
            .call("aria2.remove", vec![Value::String(id.to_string())])
            .await?;
        response::parse_ack(&body)
    }
}
