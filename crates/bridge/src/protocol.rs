//! JSON-RPC 2.0 envelopes and the MCP payloads carried inside them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;

/// A request, or a notification when `id` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RpcId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Decode `params` into `T`; a missing params member decodes from `{}`.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.params {
            Some(v) => serde_json::from_value(v.clone()),
            None => serde_json::from_value(Value::Object(Map::new())),
        }
    }
}

/// Request id exactly as the peer sent it, echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RpcId(pub Value);

impl RpcId {
    /// The `id` member of a raw message, if present and not null.
    pub fn of(message: &Value) -> Option<Self> {
        message.get("id").filter(|v| !v.is_null()).cloned().map(Self)
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self(Value::from(n))
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self(Value::from(s))
    }
}

/// Response envelope. `id` is always written, as `null` when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<RpcId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Option<RpcId>, result: impl Serialize) -> Self {
        let result = serde_json::to_value(result).unwrap_or(Value::Null);
        Self { jsonrpc: JSONRPC_VERSION.to_string(), id, result: Some(result), error: None }
    }

    pub fn error(id: Option<RpcId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError { code, message: message.into(), data: None }),
        }
    }

    pub fn error_with_data(id: Option<RpcId>, code: i32, message: impl Into<String>, data: impl Into<Value>) -> Self {
        let mut resp = Self::error(id, code, message);
        if let Some(err) = resp.error.as_mut() {
            err.data = Some(data.into());
        }
        resp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// What the remote tool endpoint answers on `GET {base}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub prompts: Vec<Prompt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self { kind: "text".to_string(), text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<Content>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self { content: vec![Content::text(text)], is_error: false }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self { content: vec![Content::text(text)], is_error: true }
    }

    /// Text of the first content item.
    pub fn text(&self) -> &str {
        self.content.first().map(|c| c.text.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GetPromptResult {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub messages: Vec<PromptMessage>,
}

impl GetPromptResult {
    pub fn user(description: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            messages: vec![PromptMessage { role: "user".to_string(), content: Content::text(text) }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id() {
        let req: RpcRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).expect("parse");
        assert!(req.is_notification());
        let req: RpcRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a-1","method":"ping"}"#).expect("parse");
        assert_eq!(req.id, Some(RpcId::from("a-1")));
    }

    #[test]
    fn any_json_id_round_trips_unchanged() {
        let req: RpcRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).expect("float id");
        let v = serde_json::to_value(RpcResponse::success(req.id, json!({}))).expect("encode");
        assert_eq!(v["id"], json!(1.5));
        let req: RpcRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","id":18446744073709551615,"method":"ping"}"#).expect("u64 id");
        assert_eq!(req.id, Some(RpcId(json!(18446744073709551615u64))));
    }

    #[test]
    fn id_is_read_from_raw_messages() {
        assert_eq!(RpcId::of(&json!({"id": "x", "params": {}})), Some(RpcId::from("x")));
        assert_eq!(RpcId::of(&json!({"id": null})), None);
        assert_eq!(RpcId::of(&json!([1, 2])), None);
    }

    #[test]
    fn unknown_id_is_written_as_null() {
        let resp = RpcResponse::error(None, PARSE_ERROR, "Parse error");
        let v = serde_json::to_value(&resp).expect("encode");
        assert_eq!(v, json!({"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}));
    }

    #[test]
    fn missing_params_decode_as_empty_object() {
        let req: RpcRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#).expect("parse");
        assert!(req.params_as::<CallToolParams>().is_err(), "name is required");
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"x"}}"#).expect("parse");
        let p: CallToolParams = req.params_as().expect("params");
        assert!(p.arguments.is_empty());
    }

    #[test]
    fn tool_result_uses_mcp_field_names() {
        let v = serde_json::to_value(ToolResult::failed("boom")).expect("encode");
        assert_eq!(v, json!({"content":[{"type":"text","text":"boom"}],"isError":true}));
    }

    #[test]
    fn catalog_tolerates_sparse_entries() {
        let c: Catalog = serde_json::from_value(json!({"tools":[{"name":"list_workloads"}]})).expect("catalog");
        assert_eq!(c.tools[0].input_schema["type"], "object");
        assert!(c.prompts.is_empty());
    }
}
