use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Map, Value};
use tapline_core::{Error, PROGRAM};
use tapline_deploy::UninstallOutcome;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::local::{self, CHECK_STATUS, START_PLATFORM, STOP_PLATFORM, USAGE_PROMPT};
use crate::platform::{PlatformControl, StartRequest};
use crate::protocol::{
    CallToolParams, Catalog, GetPromptParams, GetPromptResult, Prompt, RpcRequest, RpcResponse, Tool, ToolResult, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use crate::remote::{CatalogCache, RemoteClient, CATALOG_TTL, HTTP_TIMEOUT};
use crate::transport::{JsonlTransport, TransportError};

/// Where remote tools live.
#[derive(Clone)]
pub enum BackendMode {
    /// A fixed tool endpoint; the cluster is never touched.
    Url(String),
    /// Reach the platform's front through local ingress.
    Cluster(Arc<dyn PlatformControl>),
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    pub allow_destructive: bool,
    pub catalog_ttl: Duration,
    pub http_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self { allow_destructive: false, catalog_ttl: CATALOG_TTL, http_timeout: HTTP_TIMEOUT }
    }
}

/// Path of the tool endpoint under the front's base URL.
pub const FRONT_TOOL_PATH: &str = "/api/mcp";

pub struct Bridge {
    options: BridgeOptions,
    mode: BackendMode,
    remote: RemoteClient,
    catalog: CatalogCache,
    base: Mutex<Option<String>>,
}

impl Bridge {
    pub fn new(options: BridgeOptions, mode: BackendMode) -> Result<Self, Error> {
        Ok(Self {
            remote: RemoteClient::new(options.http_timeout)?,
            catalog: CatalogCache::new(options.catalog_ttl),
            base: Mutex::new(None),
            options,
            mode,
        })
    }

    fn url_mode(&self) -> bool {
        matches!(self.mode, BackendMode::Url(_))
    }

    fn destructive(&self) -> bool {
        local::destructive_enabled(self.options.allow_destructive, self.url_mode())
    }

    /// In URL mode, check the endpoint answers with a catalog. A no-op in
    /// cluster mode.
    pub async fn validate(&self) -> Result<(), Error> {
        if let BackendMode::Url(raw) = &self.mode {
            url::Url::parse(raw).map_err(|e| Error::Transport(format!("invalid bridge URL {raw}: {e}")))?;
            self.connect().await?;
        }
        Ok(())
    }

    /// Serve until EOF on `reader`. Requests are handled one at a time and
    /// answered in input order.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), TransportError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut transport = JsonlTransport::new(reader, writer);
        info!(url_mode = self.url_mode(), destructive = self.destructive(), "stdio bridge serving");
        loop {
            match transport.read_message().await {
                Ok(Some(req)) => {
                    if let Some(resp) = self.handle(req).await {
                        transport.write_response(&resp).await?;
                    }
                }
                Ok(None) => break,
                Err(TransportError::Io(e)) => return Err(TransportError::Io(e)),
                Err(TransportError::Invalid { id, source }) => {
                    debug!(error = %source, "invalid request");
                    let resp = RpcResponse::error_with_data(id, INVALID_REQUEST, "Invalid Request", source.to_string());
                    transport.write_response(&resp).await?;
                }
                Err(e) => {
                    debug!(error = %e, "unreadable message");
                    let resp = RpcResponse::error_with_data(None, PARSE_ERROR, "Parse error", e.to_string());
                    transport.write_response(&resp).await?;
                }
            }
        }
        info!("stdin closed; stdio bridge exiting");
        Ok(())
    }

    /// Answer one message. Notifications yield `None`.
    pub async fn handle(&self, req: RpcRequest) -> Option<RpcResponse> {
        let label = match req.method.as_str() {
            "initialize" | "initialized" | "notifications/initialized" | "ping" | "tools/list" | "tools/call" | "prompts/list"
            | "prompts/get" => req.method.clone(),
            _ => "other".to_string(),
        };
        metrics::counter!("tapline_bridge_requests_total", "method" => label).increment(1);

        let resp = match req.method.as_str() {
            "initialized" | "notifications/initialized" => return None,
            "initialize" => RpcResponse::success(req.id.clone(), self.initialize()),
            "ping" => RpcResponse::success(req.id.clone(), json!({})),
            "tools/list" => RpcResponse::success(req.id.clone(), json!({ "tools": self.list_tools().await })),
            "tools/call" => match req.params_as::<CallToolParams>() {
                Ok(p) => RpcResponse::success(req.id.clone(), self.call_tool(p).await),
                Err(e) => RpcResponse::error_with_data(req.id.clone(), INVALID_PARAMS, "Invalid params", e.to_string()),
            },
            "prompts/list" => RpcResponse::success(req.id.clone(), json!({ "prompts": self.list_prompts().await })),
            "prompts/get" => match req.params_as::<GetPromptParams>() {
                Ok(p) => match self.get_prompt(&p).await {
                    Some(result) => RpcResponse::success(req.id.clone(), result),
                    None => RpcResponse::error_with_data(req.id.clone(), INVALID_PARAMS, "Unknown prompt", p.name),
                },
                Err(e) => RpcResponse::error_with_data(req.id.clone(), INVALID_PARAMS, "Invalid params", e.to_string()),
            },
            other => RpcResponse::error_with_data(req.id.clone(), METHOD_NOT_FOUND, "Method not found", other.to_string()),
        };
        if req.is_notification() {
            debug!(method = %req.method, "dropping response to notification");
            return None;
        }
        Some(resp)
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {}, "prompts": {} },
            "serverInfo": { "name": local::SERVER_NAME, "version": local::SERVER_VERSION },
            "instructions": local::INSTRUCTIONS,
        })
    }

    /// Establish the tool base URL once, returning the cached one afterwards.
    async fn connect(&self) -> Result<String, Error> {
        let mut base = self.base.lock().await;
        if let Some(b) = base.as_ref() {
            return Ok(b.clone());
        }
        let url = match &self.mode {
            BackendMode::Url(url) => {
                let catalog = self.remote.fetch_catalog(url).await?;
                self.catalog.store(catalog).await;
                url.trim_end_matches('/').to_string()
            }
            BackendMode::Cluster(platform) => {
                let front = platform.front_base().await?;
                format!("{}{FRONT_TOOL_PATH}", front.trim_end_matches('/'))
            }
        };
        info!(url = %url, "tool endpoint connected");
        *base = Some(url.clone());
        Ok(url)
    }

    async fn disconnect(&self) {
        self.base.lock().await.take();
        self.catalog.invalidate().await;
    }

    /// The remote catalog, fetched when stale. `None` when unreachable.
    async fn catalog(&self) -> Option<Arc<Catalog>> {
        if let Some(c) = self.catalog.get().await {
            return Some(c);
        }
        let base = match self.connect().await {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "no tool endpoint; serving local tools only");
                return None;
            }
        };
        match self.remote.fetch_catalog(&base).await {
            Ok(c) => Some(self.catalog.store(c).await),
            Err(e) => {
                warn!(error = %e, url = %base, "catalog fetch failed");
                None
            }
        }
    }

    /// Catalog for listings. In cluster mode only an endpoint that is
    /// already connected is asked; listing never drives ingress.
    async fn listed_catalog(&self) -> Option<Arc<Catalog>> {
        if matches!(self.mode, BackendMode::Cluster(_)) && self.base.lock().await.is_none() {
            return self.catalog.get().await;
        }
        self.catalog().await
    }

    async fn list_tools(&self) -> Vec<Tool> {
        let mut tools = local::local_tools(self.options.allow_destructive, self.url_mode());
        if let Some(c) = self.listed_catalog().await {
            tools.extend(c.tools.iter().filter(|t| !local::is_local(&t.name)).cloned());
        }
        tools
    }

    async fn list_prompts(&self) -> Vec<Prompt> {
        let mut prompts = vec![local::usage_prompt()];
        if let Some(c) = self.listed_catalog().await {
            prompts.extend(c.prompts.iter().filter(|p| p.name != USAGE_PROMPT).cloned());
        }
        prompts
    }

    async fn get_prompt(&self, params: &GetPromptParams) -> Option<GetPromptResult> {
        if params.name == USAGE_PROMPT {
            return Some(GetPromptResult::user(local::usage_prompt().description, local::USAGE_TEXT));
        }
        let catalog = self.catalog().await?;
        let prompt = catalog.prompts.iter().find(|p| p.name == params.name)?;
        Some(GetPromptResult::user(prompt.description.clone(), local::remote_prompt_text(prompt, &params.arguments)))
    }

    async fn call_tool(&self, params: CallToolParams) -> ToolResult {
        let started = std::time::Instant::now();
        let result = match params.name.as_str() {
            CHECK_STATUS => self.check_status(&params.arguments).await,
            START_PLATFORM | STOP_PLATFORM if !self.destructive() => ToolResult::failed(format!(
                "{} is disabled. Run `{PROGRAM} stdio-bridge --allow-destructive` without --url to manage the platform.",
                params.name
            )),
            START_PLATFORM => self.start_platform(&params.arguments).await,
            STOP_PLATFORM => self.stop_platform(&params.arguments).await,
            name => match self.connect().await {
                Ok(base) => self.remote.call_tool(&base, name, &params.arguments).await,
                Err(e) => ToolResult::failed(connect_failure(&e)),
            },
        };
        debug!(tool = %params.name, is_error = result.is_error, took_ms = started.elapsed().as_millis() as u64, "tool call");
        result
    }

    fn namespace_arg(&self, platform: &dyn PlatformControl, args: &Map<String, Value>) -> String {
        local::string_arg(args, "release_namespace").map(str::to_string).unwrap_or_else(|| platform.default_namespace())
    }

    async fn check_status(&self, args: &Map<String, Value>) -> ToolResult {
        let platform = match &self.mode {
            BackendMode::Url(url) => {
                let mut text = format!("tapline is reached directly at {url}.\n\nAvailable tools:\n- {CHECK_STATUS}: Check tapline status");
                match self.catalog().await {
                    Some(c) => push_tool_lines(&mut text, &c),
                    None => text.push_str("\n\nThe endpoint did not return a tool catalog; it may be unreachable."),
                }
                return ToolResult::ok(text);
            }
            BackendMode::Cluster(p) => p.clone(),
        };
        let ns = self.namespace_arg(platform.as_ref(), args);
        let status = match platform.status(&ns).await {
            Ok(s) => s,
            Err(e) => return ToolResult::failed(format!("Error checking tapline status: {e}")),
        };
        if status.is_running() {
            let mut text = format!("tapline is running in namespace '{ns}'.\n\nAvailable tools:");
            if self.destructive() {
                text.push_str(&format!("\n- {STOP_PLATFORM}: Stop tapline and remove its resources"));
            }
            if let Some(c) = self.catalog().await {
                push_tool_lines(&mut text, &c);
            }
            ToolResult::ok(text)
        } else if self.destructive() {
            ToolResult::ok(format!(
                "tapline is not running in namespace '{ns}'.\n\nAvailable tools:\n- {START_PLATFORM}: Start tapline to capture network traffic"
            ))
        } else {
            ToolResult::ok(format!(
                "tapline is not running in namespace '{ns}'.\n\nStart it with `{PROGRAM} start`, or run the bridge with --allow-destructive to get the {START_PLATFORM} tool."
            ))
        }
    }

    async fn start_platform(&self, args: &Map<String, Value>) -> ToolResult {
        let BackendMode::Cluster(platform) = &self.mode else {
            return ToolResult::failed("start_platform is unavailable in URL mode");
        };
        let pod_regex = match local::string_arg(args, "pod_regex").map(Regex::new).transpose() {
            Ok(re) => re,
            Err(e) => return ToolResult::failed(format!("Invalid pod_regex: {e}")),
        };
        let req = StartRequest {
            release_namespace: local::string_arg(args, "release_namespace").map(str::to_string),
            namespaces: local::split_list(args.get("namespaces")),
            pod_regex,
        };
        let ns = req.release_namespace.clone().unwrap_or_else(|| platform.default_namespace());
        info!(ns = %ns, namespaces = ?req.namespaces, "starting platform");
        match platform.start(req).await {
            Ok(ready) => {
                self.disconnect().await;
                if ready {
                    ToolResult::ok(format!("tapline started successfully in namespace '{ns}' and is ready."))
                } else {
                    ToolResult::ok(format!(
                        "tapline started in namespace '{ns}' but pods are not ready yet.\nCheck status with the {CHECK_STATUS} tool."
                    ))
                }
            }
            Err(e) => ToolResult::failed(format!("Failed to start tapline: {}", with_hint(&e))),
        }
    }

    async fn stop_platform(&self, args: &Map<String, Value>) -> ToolResult {
        let BackendMode::Cluster(platform) = &self.mode else {
            return ToolResult::failed("stop_platform is unavailable in URL mode");
        };
        let ns = self.namespace_arg(platform.as_ref(), args);
        match platform.stop(&ns).await {
            Ok(outcome) => {
                self.disconnect().await;
                match outcome {
                    UninstallOutcome::Removed => ToolResult::ok(format!("tapline stopped successfully in namespace '{ns}'.")),
                    UninstallOutcome::NotInstalled => ToolResult::ok(format!("tapline was not installed in namespace '{ns}'; nothing to stop.")),
                }
            }
            Err(e) => ToolResult::failed(format!("Failed to stop tapline: {}", with_hint(&e))),
        }
    }
}

fn push_tool_lines(text: &mut String, catalog: &Catalog) {
    for t in catalog.tools.iter().filter(|t| !local::is_local(&t.name)) {
        if t.description.is_empty() {
            text.push_str(&format!("\n- {}", t.name));
        } else {
            text.push_str(&format!("\n- {}: {}", t.name, t.description));
        }
    }
}

fn with_hint(e: &Error) -> String {
    match e.remediation() {
        Some(hint) => format!("{e} (hint: {hint})"),
        None => e.to_string(),
    }
}

fn connect_failure(e: &Error) -> String {
    match e {
        Error::NotFound(_) => format!("tapline is not running. Use the '{START_PLATFORM}' tool to start it first."),
        other => format!("Couldn't connect to the tapline tool endpoint: {}", with_hint(other)),
    }
}

/// Serve the bridge on this process's stdin and stdout.
pub async fn serve_stdio(bridge: &Bridge) -> Result<(), TransportError> {
    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    bridge.serve(reader, tokio::io::stdout()).await
}
