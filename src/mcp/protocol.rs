//! JSON-RPC 2.0 envelopes and the MCP payloads this server speaks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Newest protocol revision this server implements.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Revisions accepted from clients, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// A request id; JSON-RPC allows numbers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

// ── Incoming ─────────────────────────────────────────────────────────────

/// Any frame read from the client, before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// What an incoming frame is.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A reply to something the server sent; this server sends no requests.
    Response,
    Invalid {
        id: Option<RequestId>,
        reason: String,
    },
}

impl IncomingMessage {
    pub fn classify(self) -> MessageKind {
        if self.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return MessageKind::Invalid {
                id: self.id,
                reason: "jsonrpc must be \"2.0\"".into(),
            };
        }
        match (self.id, self.method) {
            (Some(id), Some(method)) => MessageKind::Request {
                id,
                method,
                params: self.params,
            },
            (None, Some(method)) => MessageKind::Notification {
                method,
                params: self.params,
            },
            (Some(_), None) if self.result.is_some() || self.error.is_some() => {
                MessageKind::Response
            }
            (id, None) => MessageKind::Invalid {
                id,
                reason: "missing method".into(),
            },
        }
    }
}

// ── Outgoing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {detail}"))
    }

    pub fn invalid_request(reason: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {reason}"))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Invalid tool arguments, tagged with the `VALIDATION_ERROR` code.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message).with_data(json!({ "code": "VALIDATION_ERROR" }))
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {detail}"))
    }
}

/// A response frame. `id` serialises as `null` when the request id could
/// not be read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// Anything the server writes.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

// ── MCP payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: Value,
    pub server_info: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Answer an `initialize` request, echoing the client's protocol version
    /// when it is one we support.
    pub fn negotiate(params: Option<&Value>, server_info: ServerInfo) -> Self {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        let protocol_version = match requested {
            Some(v) if SUPPORTED_PROTOCOL_VERSIONS.contains(&v) => v.to_string(),
            _ => PROTOCOL_VERSION.to_string(),
        };
        Self {
            protocol_version,
            capabilities: json!({ "tools": { "listChanged": false }, "logging": {} }),
            server_info,
            instructions: Some(
                "Use web_search for current information from the web and \
                 document_question_answering to ask questions about a local document \
                 (PDF, Office, HWP, images)."
                    .into(),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// `tools/call` params.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default, rename = "_meta")]
    pub meta: Option<Value>,
}

impl ToolCallParams {
    /// The client's progress token, if it asked for progress notifications.
    pub fn progress_token(&self) -> Option<Value> {
        self.meta
            .as_ref()
            .and_then(|m| m.get("progressToken"))
            .filter(|t| t.is_string() || t.is_number())
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub content: Vec<Content>,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>, structured: Option<Value>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            is_error: false,
            structured_content: structured,
        }
    }

    /// A failed call: `[CODE] message` text plus `structuredContent.error`.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            content: vec![Content::Text {
                text: format!("[{code}] {message}"),
            }],
            is_error: true,
            structured_content: Some(json!({ "error": { "code": code, "message": message } })),
        }
    }
}

/// `notifications/cancelled` params.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default)]
    pub reason: Option<String>,
}
