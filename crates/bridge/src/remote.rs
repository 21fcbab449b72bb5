//! HTTP client for the platform's tool endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use serde_json::{json, Map, Value};
use tapline_core::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::{Catalog, ToolResult};

pub const CATALOG_TTL: Duration = Duration::from_secs(5 * 60);
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build().map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { http })
    }

    /// `GET {base}`. Any non-2xx answer or an unparseable body is an error.
    pub async fn fetch_catalog(&self, base: &str) -> Result<Catalog, Error> {
        let started = StdInstant::now();
        let url = base.trim_end_matches('/');
        let resp = self.http.get(url).send().await.map_err(|e| Error::Transport(format!("GET {url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
                message,
            });
        }
        let catalog: Catalog = resp.json().await.map_err(|e| Error::Transport(format!("decode catalog from {url}: {e}")))?;
        metrics::histogram!("tapline_catalog_fetch_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(url = %url, tools = catalog.tools.len(), prompts = catalog.prompts.len(), "catalog fetched");
        Ok(catalog)
    }

    /// `POST {base}/tools/call`. Failures become error results, never `Err`.
    pub async fn call_tool(&self, base: &str, name: &str, arguments: &Map<String, Value>) -> ToolResult {
        let url = format!("{}/tools/call", base.trim_end_matches('/'));
        let resp = match self.http.post(&url).json(&json!({ "name": name, "arguments": arguments })).send().await {
            Ok(r) => r,
            Err(e) => return ToolResult::failed(format!("Error calling remote API: {e}")),
        };
        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::failed(format!("Error reading response: {e}")),
        };
        if status.as_u16() >= 400 {
            return ToolResult::failed(format!("Remote API error ({}): {body}", status.as_u16()));
        }
        ToolResult::ok(pretty(&body))
    }
}

/// Re-indent a JSON body; anything else passes through untouched.
pub fn pretty(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| body.to_string())
}

/// The last fetched catalog and when it was captured.
#[derive(Debug)]
pub struct CatalogCache {
    ttl: Duration,
    slot: Mutex<Option<(Instant, Arc<Catalog>)>>,
}

impl CatalogCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, slot: Mutex::new(None) }
    }

    /// The cached catalog while it is fresh.
    pub async fn get(&self) -> Option<Arc<Catalog>> {
        let slot = self.slot.lock().await;
        match slot.as_ref() {
            Some((at, c)) if at.elapsed() < self.ttl => Some(c.clone()),
            _ => None,
        }
    }

    pub async fn store(&self, catalog: Catalog) -> Arc<Catalog> {
        let catalog = Arc::new(catalog);
        *self.slot.lock().await = Some((Instant::now(), catalog.clone()));
        catalog
    }

    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }
}

impl Default for CatalogCache {
    fn default() -> Self {
        Self::new(CATALOG_TTL)
    }
}
