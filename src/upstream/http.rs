// src/upstream/http.rs
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::config::SourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::upstream::{Endpoint, UpstreamClient, UpstreamRequest};

/// REST source. Paths are templates relative to `base_url`; `{id}` is
/// replaced with the request id. Bulk requests POST the id list as JSON.
pub struct HttpSource {
    id: String,
    base_url: String,
    paths: BTreeMap<Endpoint, String>,
    api_key: Option<String>,
    http: Client,
}

impl HttpSource {
    pub fn from_config(cfg: &SourceConfig, timeout: Duration) -> SyncResult<Self> {
        if cfg.base_url.trim().is_empty() {
            return Err(SyncError::Config(format!("source '{}' has no base_url", cfg.id)));
        }
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            if let Some(var) = &cfg.api_key_env {
                tracing::warn!(target: "sync", source = %cfg.id, env = %var, "api key env var not set");
            }
        }
        let http = Client::builder()
            .user_agent(concat!("team-sync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client for '{}': {e}", cfg.id)))?;
        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            paths: cfg.endpoint_paths()?,
            api_key,
            http,
        })
    }

    fn url(&self, request: &UpstreamRequest) -> SyncResult<String> {
        let endpoint = request.endpoint();
        let template = self.paths.get(&endpoint).ok_or_else(|| {
            SyncError::Config(format!("source '{}' has no path for {endpoint}", self.id))
        })?;
        let path = match request.id() {
            Some(id) => template.replace("{id}", id),
            None => template.clone(),
        };
        Ok(format!("{}{}", self.base_url, path))
    }
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn status_error(source: &str, endpoint: Endpoint, status: StatusCode) -> Option<SyncError> {
    if status.is_success() {
        return None;
    }
    let err = match status {
        StatusCode::NOT_FOUND => SyncError::NotFound(format!("{source}/{endpoint}")),
        StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited {
            endpoint: format!("{source}/{endpoint}"),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::Auth(format!("{source} ({status})"))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            SyncError::Transient(format!("{source}/{endpoint}: {s}"))
        }
        s => SyncError::malformed(source, format!("unexpected status {s} on {endpoint}")),
    };
    Some(err)
}

#[async_trait]
impl UpstreamClient for HttpSource {
    fn source(&self) -> &str {
        &self.id
    }

    fn supports(&self, endpoint: Endpoint) -> bool {
        self.paths.contains_key(&endpoint)
    }

    async fn call(&self, request: &UpstreamRequest) -> SyncResult<Value> {
        let url = self.url(request)?;
        let endpoint = request.endpoint();
        let mut req = match request {
            UpstreamRequest::RidersBulk(ids) => self.http.post(&url).json(ids),
            _ => self.http.get(&url),
        };
        if let Some(key) = &self.api_key {
            req = req.header(reqwest::header::AUTHORIZATION, key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Transient(format!("{}/{endpoint}: timed out", self.id))
            } else {
                SyncError::Transient(format!("{}/{endpoint}: {e}", self.id))
            }
        })?;
        if let Some(err) = status_error(&self.id, endpoint, resp.status()) {
            tracing::debug!(target: "sync", source = %self.id, %endpoint, %err, "upstream error status");
            return Err(err);
        }
        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| SyncError::malformed(self.id.as_str(), format!("{endpoint}: body is not JSON ({e})")))
    }
}
