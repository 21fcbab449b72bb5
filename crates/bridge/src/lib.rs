//! Stdio JSON-RPC bridge for MCP clients.
//!
//! [`Bridge::serve`] reads one JSON-RPC 2.0 message per line and answers on
//! the writer in input order. Three local tools manage the platform
//! (`check_status` always, `start_platform`/`stop_platform` only when
//! destructive mode is on and no fixed URL is configured). Every other tool
//! call is forwarded to the platform's tool endpoint, whose catalog is
//! cached for five minutes.

#![forbid(unsafe_code)]

pub mod local;
pub mod platform;
pub mod protocol;
pub mod remote;
mod server;
pub mod transport;

pub use platform::{ClusterPlatform, PlatformControl, StartRequest};
pub use protocol::{Catalog, RpcId, RpcRequest, RpcResponse, Tool, ToolResult};
pub use remote::{CatalogCache, RemoteClient, CATALOG_TTL, HTTP_TIMEOUT};
pub use server::{serve_stdio, BackendMode, Bridge, BridgeOptions, FRONT_TOOL_PATH};
pub use transport::{JsonlTransport, TransportError};
