//! Local tools, the usage prompt and the text the bridge hands its peer.

use serde_json::{json, Map, Value};

use crate::protocol::{Prompt, Tool};

pub const SERVER_NAME: &str = "tapline-mcp";
pub const SERVER_VERSION: &str = "1.0.0";

pub const CHECK_STATUS: &str = "check_status";
pub const START_PLATFORM: &str = "start_platform";
pub const STOP_PLATFORM: &str = "stop_platform";
pub const USAGE_PROMPT: &str = "tapline_usage";

pub const INSTRUCTIONS: &str = "When working with tapline, ALWAYS use the provided tools instead of kubectl or helm commands:
- To check if tapline is running: use 'check_status' (NOT kubectl get pods)
- To start tapline: use 'start_platform' (NOT kubectl apply or helm install)
- To stop tapline: use 'stop_platform' (NOT kubectl delete or helm uninstall)
- To query captured traffic: use the traffic tools listed by tools/list
These tools provide proper integration and accurate results.";

pub const USAGE_TEXT: &str = "When working with tapline, you MUST use the tools provided. Do not run kubectl, helm or other CLI commands directly.

IMPORTANT RULES:
1. To check tapline status: ALWAYS use the 'check_status' tool (NOT 'kubectl get pods')
2. To start tapline: ALWAYS use the 'start_platform' tool (NOT 'kubectl apply' or 'helm install')
3. To stop tapline: ALWAYS use the 'stop_platform' tool (NOT 'kubectl delete' or 'helm uninstall')
4. To query captured traffic: use the traffic tools listed by tools/list

The tools handle deployment, configuration and API communication. Using kubectl or helm directly may leave the platform half installed or report incomplete information.

When the user asks about tapline status or traffic, or wants to start or stop tapline, use the matching tool immediately.";

fn release_namespace_property() -> Value {
    json!({
        "type": "string",
        "description": "Namespace tapline is installed in (default: 'tapline')"
    })
}

fn schema(properties: Map<String, Value>) -> Value {
    json!({ "type": "object", "properties": properties })
}

pub fn check_status_tool() -> Tool {
    let mut props = Map::new();
    props.insert("release_namespace".into(), release_namespace_property());
    Tool {
        name: CHECK_STATUS.into(),
        description: "REQUIRED: Use this tool to check if tapline is running/installed/deployed. Do NOT use kubectl get pods or \
                      other commands. It reports accurate status and which other tapline tools can be used."
            .into(),
        input_schema: schema(props),
    }
}

pub fn start_platform_tool() -> Tool {
    let mut props = Map::new();
    props.insert(
        "namespaces".into(),
        json!({
            "type": "string",
            "description": "Comma-separated list of namespaces to tap (e.g., 'default,shop'). If not specified, taps all namespaces."
        }),
    );
    props.insert(
        "pod_regex".into(),
        json!({
            "type": "string",
            "description": "Regular expression to filter pods by name (e.g., 'nginx.*')"
        }),
    );
    props.insert("release_namespace".into(), release_namespace_property());
    Tool {
        name: START_PLATFORM.into(),
        description: "REQUIRED: Use this tool to start/run/deploy tapline for capturing network traffic. Do NOT use kubectl or helm \
                      directly. This tool installs the platform with all required settings."
            .into(),
        input_schema: schema(props),
    }
}

pub fn stop_platform_tool() -> Tool {
    let mut props = Map::new();
    props.insert("release_namespace".into(), release_namespace_property());
    Tool {
        name: STOP_PLATFORM.into(),
        description: "REQUIRED: Use this tool to stop/remove/uninstall tapline from the cluster. Do NOT use kubectl delete or helm \
                      uninstall directly. This tool removes every tapline resource."
            .into(),
        input_schema: schema(props),
    }
}

/// Whether `start_platform`/`stop_platform` are offered.
pub fn destructive_enabled(allow_destructive: bool, url_mode: bool) -> bool {
    allow_destructive && !url_mode
}

pub fn local_tools(allow_destructive: bool, url_mode: bool) -> Vec<Tool> {
    let mut tools = vec![check_status_tool()];
    if destructive_enabled(allow_destructive, url_mode) {
        tools.push(start_platform_tool());
        tools.push(stop_platform_tool());
    }
    tools
}

pub fn is_local(name: &str) -> bool {
    matches!(name, CHECK_STATUS | START_PLATFORM | STOP_PLATFORM)
}

pub fn usage_prompt() -> Prompt {
    Prompt { name: USAGE_PROMPT.into(), description: "Instructions for using tapline tools correctly".into(), arguments: vec![] }
}

/// Text for a remote prompt, built from its catalog entry.
pub fn remote_prompt_text(prompt: &Prompt, arguments: &Map<String, Value>) -> String {
    let mut text = if prompt.description.is_empty() { format!("Use the '{}' prompt.", prompt.name) } else { prompt.description.clone() };
    if !prompt.arguments.is_empty() {
        text.push_str("\n\nArguments:");
        for arg in &prompt.arguments {
            let required = if arg.required.unwrap_or(false) { " (required)" } else { "" };
            let value = match arguments.get(&arg.name) {
                Some(Value::String(s)) => format!(" = {s}"),
                Some(v) => format!(" = {v}"),
                None => String::new(),
            };
            if arg.description.is_empty() {
                text.push_str(&format!("\n- {}{required}{value}", arg.name));
            } else {
                text.push_str(&format!("\n- {}{required}: {}{value}", arg.name, arg.description));
            }
        }
    }
    text
}

/// A comma-separated string argument, trimmed, empties dropped.
pub fn split_list(raw: Option<&Value>) -> Vec<String> {
    raw.and_then(Value::as_str)
        .map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// A non-empty string argument.
pub fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}
