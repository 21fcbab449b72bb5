//! Path-rewriting reverse proxy onto the API server's service proxy.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use axum::Router;
use tapline_core::{CancellationToken, Error};
use tapline_kubehub::Cluster;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::backend::ServingTask;

/// Largest request body the proxy buffers before forwarding.
const MAX_BODY: usize = 16 * 1024 * 1024;

const CORS_ALLOW_HEADERS: &str = "Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization, \
accept, origin, Cache-Control, X-Requested-With, x-session-token";
const CORS_ALLOW_METHODS: &str = "POST, OPTIONS, GET, PUT, DELETE";

/// Where rewritten requests go. The cluster implementation sends them
/// through the kube client so credentials and TLS are reused.
#[async_trait]
pub trait ProxyUpstream: Send + Sync + 'static {
    async fn forward(&self, req: Request<Bytes>) -> Result<Response<Body>, Error>;
}

#[async_trait]
impl ProxyUpstream for Cluster {
    async fn forward(&self, req: Request<Bytes>) -> Result<Response<Body>, Error> {
        let (parts, bytes) = req.into_parts();
        let req = Request::from_parts(parts, kube::client::Body::from(bytes));
        let resp = self.send_raw(req).await?;
        Ok(resp.map(Body::new))
    }
}

#[derive(Clone)]
struct ProxyState {
    prefix: Arc<str>,
    upstream: Arc<dyn ProxyUpstream>,
}

/// Map a local path (with query) into the service-proxy namespace.
///
/// `/static/...` lands under `{prefix}/static/...`, everything else under
/// `{prefix}{path}`. Paths already carrying the prefix pass through.
pub fn rewrite_path(prefix: &str, path_and_query: &str) -> String {
    if path_and_query.starts_with(prefix) {
        return path_and_query.to_string();
    }
    if let Some(rest) = path_and_query.strip_prefix("/static/") {
        return format!("{prefix}/static/{rest}");
    }
    if path_and_query.starts_with('/') {
        format!("{prefix}{path_and_query}")
    } else {
        format!("{prefix}/{path_and_query}")
    }
}

pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(CORS_ALLOW_HEADERS));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(CORS_ALLOW_METHODS));
}

pub fn router(prefix: &str, upstream: Arc<dyn ProxyUpstream>) -> Router {
    let state = ProxyState { prefix: Arc::from(prefix), upstream };
    Router::new().fallback(forward).with_state(state)
}

async fn forward(State(st): State<ProxyState>, req: Request<Body>) -> Response<Body> {
    if req.method() == Method::OPTIONS {
        return preflight();
    }
    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY).await {
        Ok(b) => b,
        Err(e) => return plain(StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")),
    };
    let original = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();
    let rewritten = rewrite_path(&st.prefix, &original);
    parts.uri = match rewritten.parse::<Uri>() {
        Ok(u) => u,
        Err(e) => return plain(StatusCode::BAD_REQUEST, format!("bad path {original}: {e}")),
    };
    parts.headers.remove(header::HOST);
    parts.headers.remove(header::CONNECTION);
    debug!(method = %parts.method, from = %original, to = %rewritten, "proxying");
    match st.upstream.forward(Request::from_parts(parts, bytes)).await {
        Ok(mut resp) => {
            apply_cors(resp.headers_mut());
            resp
        }
        Err(e) => {
            warn!(path = %original, error = %e, "upstream request failed");
            plain(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

fn preflight() -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::NO_CONTENT;
    apply_cors(resp.headers_mut());
    resp
}

fn plain(status: StatusCode, msg: String) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg));
    *resp.status_mut() = status;
    apply_cors(resp.headers_mut());
    resp
}

/// Serve `app` on `listener` until `parent` (or the returned task's own
/// token) is cancelled. In-flight requests finish before the task exits.
pub fn serve_router(listener: TcpListener, app: Router, parent: &CancellationToken) -> ServingTask {
    let stop = parent.child_token();
    let signal = stop.clone();
    let addr = listener.local_addr().ok();
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app).with_graceful_shutdown(async move { signal.cancelled().await }).await;
        match served {
            Ok(()) => info!(addr = ?addr, "listener stopped"),
            Err(e) => warn!(addr = ?addr, error = %e, "listener failed"),
        }
    });
    ServingTask::new(stop, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const PREFIX: &str = "/api/v1/namespaces/tapline/services/tapline-front:80/proxy";

    #[test]
    fn rewrites_root_and_static_paths() {
        assert_eq!(rewrite_path(PREFIX, "/"), format!("{PREFIX}/"));
        assert_eq!(rewrite_path(PREFIX, "/api/mcp?x=1"), format!("{PREFIX}/api/mcp?x=1"));
        assert_eq!(rewrite_path(PREFIX, "/static/js/main.js"), format!("{PREFIX}/static/js/main.js"));
        assert_eq!(rewrite_path(PREFIX, &format!("{PREFIX}/static/a.css")), format!("{PREFIX}/static/a.css"));
    }

    struct Recorder {
        seen: Mutex<Vec<(Method, String, Option<String>)>>,
    }

    #[async_trait]
    impl ProxyUpstream for Recorder {
        async fn forward(&self, req: Request<Bytes>) -> Result<Response<Body>, Error> {
            let host = req.headers().get(header::HOST).and_then(|h| h.to_str().ok()).map(str::to_string);
            self.seen.lock().expect("lock").push((req.method().clone(), req.uri().to_string(), host));
            Ok(Response::new(Body::from(req.into_body())))
        }
    }

    async fn spawn_proxy(upstream: Arc<Recorder>) -> (String, ServingTask) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let task = serve_router(listener, router(PREFIX, upstream), &CancellationToken::new());
        (format!("http://{addr}"), task)
    }

    #[tokio::test]
    async fn forwards_rewritten_requests_with_cors() {
        let rec = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let (base, task) = spawn_proxy(Arc::clone(&rec)).await;
        let client = reqwest::Client::new();
        let resp = client.post(format!("{base}/api/mcp")).body("ping").send().await.expect("post");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.headers().get("access-control-allow-origin").and_then(|v| v.to_str().ok()), Some("*"));
        assert_eq!(resp.text().await.expect("body"), "ping");

        let seen = rec.seen.lock().expect("lock").clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Method::POST);
        assert_eq!(seen[0].1, format!("{PREFIX}/api/mcp"));
        assert_eq!(seen[0].2, None, "local Host header must not reach the API server");
        task.shutdown().await;
    }

    #[tokio::test]
    async fn preflight_is_answered_locally() {
        let rec = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let (base, task) = spawn_proxy(Arc::clone(&rec)).await;
        let resp = reqwest::Client::new()
            .request(reqwest::Method::OPTIONS, format!("{base}/api/mcp"))
            .send()
            .await
            .expect("options");
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers().get("access-control-allow-methods").and_then(|v| v.to_str().ok()),
            Some(CORS_ALLOW_METHODS)
        );
        assert!(rec.seen.lock().expect("lock").is_empty());
        task.shutdown().await;
    }
}
