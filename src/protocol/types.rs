//! JSON-RPC 2.0 envelopes and the MCP payloads the server speaks.
//!
//! Besides the wire shapes this module owns two things the rest of the
//! server relies on: [`ErrorBody`], the one JSON document every refused call
//! carries, and [`ClientIdentity`], the key a connection is rate limited and
//! audited under.

use crate::error::{GatekeeperError, McpError, ProtocolError, ProtocolResult, ToolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

pub const JSONRPC_VERSION: &str = "2.0";

pub const MCP_VERSION: &str = "2024-11-05";

/// Client name used until `initialize` announces one.
const ANONYMOUS: &str = "anonymous";

/// Request id. A JSON `null` id is read as no id at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// Methods the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Initialize,
    Initialized,
    Shutdown,
    Ping,
    ListTools,
    CallTool,
    ListResources,
    ReadResource,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "initialize" => Self::Initialize,
            "initialized" | "notifications/initialized" => Self::Initialized,
            "shutdown" => Self::Shutdown,
            "ping" => Self::Ping,
            "tools/list" => Self::ListTools,
            "tools/call" => Self::CallTool,
            "resources/list" => Self::ListResources,
            "resources/read" => Self::ReadResource,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Initialized => "notifications/initialized",
            Self::Shutdown => "shutdown",
            Self::Ping => "ping",
            Self::ListTools => "tools/list",
            Self::CallTool => "tools/call",
            Self::ListResources => "resources/list",
            Self::ReadResource => "resources/read",
        }
    }

    /// Handled in arrival order on the read loop. Everything else may run
    /// concurrently with later requests.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Initialize | Self::Initialized | Self::Shutdown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn call(id: impl Into<RequestId>, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id.into()),
            method: method.as_str().into(),
            params,
        }
    }

    pub fn notification(method: Method) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: method.as_str().into(),
            params: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn known_method(&self) -> ProtocolResult<Method> {
        Method::parse(&self.method).ok_or_else(|| ProtocolError::MethodNotFound(self.method.clone()))
    }

    /// Decode `params` into the payload type of the method.
    pub fn decode_params<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        let params = self
            .params
            .as_ref()
            .ok_or(ProtocolError::InvalidParams("missing params".into()))?;
        T::deserialize(params).map_err(|e| ProtocolError::InvalidParams(e.to_string().into()))
    }
}

/// Either half of a response. Serialized as a `result` or an `error` member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(JsonRpcError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl JsonRpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            outcome: Outcome::Error(error),
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&JsonRpcError> {
        match &self.outcome {
            Outcome::Error(error) => Some(error),
            Outcome::Result(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<ProtocolError> for JsonRpcError {
    /// A refused gatekeeper operation carries its [`ErrorBody`] as `data`.
    fn from(err: ProtocolError) -> Self {
        let data = match &err {
            ProtocolError::Refused(refusal) => serde_json::to_value(ErrorBody::from(refusal)).ok(),
            _ => None,
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            data,
        }
    }
}

/// What a client is told when a call is refused: `{code, message,
/// retry_after_ms?}`. Internal failures never leak their detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&GatekeeperError> for ErrorBody {
    fn from(err: &GatekeeperError) -> Self {
        Self {
            code: err.code().into_owned(),
            message: err.to_string(),
            retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
        }
    }
}

impl From<&McpError> for ErrorBody {
    fn from(err: &McpError) -> Self {
        match err {
            McpError::Gatekeeper(e) => e.into(),
            McpError::Tool(ToolError::NotFound(_)) => Self {
                code: "TOOL_NOT_FOUND".into(),
                message: err.to_string(),
                retry_after_ms: None,
            },
            _ => Self {
                code: "INTERNAL_ERROR".into(),
                message: "Internal error".into(),
                retry_after_ms: None,
            },
        }
    }
}

/// Who is on the other end of one connection. The session id is fixed when
/// the connection opens; the name arrives with `initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    name: Option<String>,
    session: Uuid,
}

impl ClientIdentity {
    pub fn new() -> Self {
        Self {
            name: None,
            session: Uuid::new_v4(),
        }
    }

    /// Adopt the announced client name. A blank name stays anonymous.
    pub fn announce(&mut self, info: &ClientInfo) {
        let name = info.name.trim();
        self.name = (!name.is_empty()).then(|| name.to_string());
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// `<client name>:<session uuid>`, the rate limit and audit key.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name().unwrap_or(ANONYMOUS), self.session)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Client capabilities are accepted but unused.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    pub fn json<T: Serialize>(data: &T) -> Self {
        let text = serde_json::to_string_pretty(data).unwrap_or_else(|e| e.to_string());
        Self::text(text)
    }

    /// A refused call. The text is the serialized [`ErrorBody`].
    pub fn failure(body: &ErrorBody) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: serde_json::to_string(body).unwrap_or_default(),
            }],
            is_error: Some(true),
        }
    }

    pub fn first_text(&self) -> Option<&str> {
        self.content.first().map(|c| match c {
            ToolContent::Text { text } => text.as_str(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    pub resources: Vec<Resource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub text: String,
}

/// A line read from the client: a request, or a response we never asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_response_carries_one_outcome() {
        let ok = serde_json::to_value(JsonRpcResponse::success(Some(1.into()), json!({}))).unwrap();
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 1, "result": {}}));

        let err = JsonRpcResponse::failure(None, ProtocolError::ParseError.into());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], -32700);
        assert!(value.get("result").is_none());

        let back: JsonRpcResponse = serde_json::from_value(value).unwrap();
        assert_eq!(back.error().unwrap().code, -32700);
        assert!(back.result().is_none());
    }

    #[test]
    fn test_methods() {
        assert_eq!(Method::parse("initialized"), Some(Method::Initialized));
        assert_eq!(Method::parse("notifications/initialized"), Some(Method::Initialized));
        assert_eq!(Method::parse("resources/read"), Some(Method::ReadResource));
        assert_eq!(Method::parse("tools/delete"), None);
        assert!(Method::Shutdown.is_lifecycle());
        assert!(!Method::CallTool.is_lifecycle());

        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/delete"}))
                .unwrap();
        assert!(matches!(request.known_method(), Err(ProtocolError::MethodNotFound(_))));
    }

    #[test]
    fn test_decode_params() {
        let request = JsonRpcRequest::call(
            1,
            Method::ReadResource,
            Some(json!({"uri": "db://tables"})),
        );
        let params: ReadResourceParams = request.decode_params().unwrap();
        assert_eq!(params.uri, "db://tables");

        let bare = JsonRpcRequest::call(2, Method::ReadResource, None);
        let err = bare.decode_params::<ReadResourceParams>().unwrap_err();
        assert_eq!(err.code(), -32602);
    }

    #[test]
    fn test_null_id_is_a_notification() {
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": null, "method": "ping"})).unwrap();
        assert!(request.is_notification());
    }

    #[test]
    fn test_refusal_carries_error_body() {
        let refusal = ProtocolError::Refused(GatekeeperError::RateLimited {
            retry_after: Duration::from_millis(1500),
        });
        let error = JsonRpcError::from(refusal);
        assert_eq!(error.code, -32000);
        let body: ErrorBody = serde_json::from_value(error.data.unwrap()).unwrap();
        assert_eq!(body.code, "RATE_LIMITED");
        assert_eq!(body.retry_after_ms, Some(1500));

        let plain = JsonRpcError::from(ProtocolError::MethodNotFound("x".into()));
        assert!(plain.data.is_none());
    }

    #[test]
    fn test_error_body_hides_internal_detail() {
        let body = ErrorBody::from(&McpError::Internal {
            message: "secret detail".into(),
        });
        assert_eq!(body.code, "INTERNAL_ERROR");
        assert_eq!(body.message, "Internal error");

        let body = ErrorBody::from(&McpError::from(ToolError::NotFound("drop_all".into())));
        assert_eq!(body.code, "TOOL_NOT_FOUND");

        let result = CallToolResult::failure(&body);
        assert_eq!(result.is_error, Some(true));
        let back: ErrorBody = serde_json::from_str(result.first_text().unwrap()).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn test_client_identity() {
        let mut client = ClientIdentity::new();
        assert!(client.key().starts_with("anonymous:"));

        client.announce(&ClientInfo {
            name: "  claude-desktop ".into(),
            version: "1.0".into(),
        });
        assert_eq!(client.key(), format!("claude-desktop:{}", client.session()));

        client.announce(&ClientInfo {
            name: " ".into(),
            version: String::new(),
        });
        assert_eq!(client.name(), None);
    }

    #[test]
    fn test_initialize_params_without_capabilities() {
        let params: InitializeParams = serde_json::from_value(json!({
            "protocolVersion": MCP_VERSION,
            "clientInfo": {"name": "agent"}
        }))
        .unwrap();
        assert_eq!(params.client_info.name, "agent");
        assert!(params.capabilities.is_null());
    }
}
