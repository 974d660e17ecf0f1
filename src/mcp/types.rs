//! JSON-RPC 2.0 primitives and the MCP `initialize` handshake types
//!
//! Only the messages needed to establish a session are modelled here. A
//! candidate connection counts as successful once the server answers the
//! `initialize` request with a result. Struct fields are `camelCase` on the
//! wire via `#[serde(rename_all = "camelCase")]`, and `Option<>` fields are
//! omitted from JSON when `None`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Protocol version constants
// ---------------------------------------------------------------------------

/// Protocol revision advertised in the `mcp-protocol-version` header and in
/// the `initialize` request by default.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// Header carrying the negotiated protocol revision.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Header carrying the streaming transport's session identifier.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Method name of the handshake request.
pub const METHOD_INITIALIZE: &str = "initialize";

/// Notification sent once the handshake result has been received.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";

/// Request id used for the handshake.
pub const INITIALIZE_REQUEST_ID: u64 = 1;

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 wire types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request object.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::types::JsonRpcRequest;
///
/// let req = JsonRpcRequest::new(1, "ping", None);
/// assert_eq!(req.jsonrpc, "2.0");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Request correlation identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Builds a request with a numeric id.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(id)),
            method: method.to_string(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response object.
///
/// Exactly one of `result` or `error` will be present in a valid response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Mirrors the `id` from the corresponding request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Successful result value; mutually exclusive with `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error object; mutually exclusive with `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Returns `true` when this response answers request `id`.
    pub fn answers(&self, id: u64) -> bool {
        self.id.as_ref().and_then(|v| v.as_u64()) == Some(id)
    }
}

/// A JSON-RPC 2.0 error object.
///
/// Implements `Display` as `"JSON-RPC error {code}: {message}"`.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::types::JsonRpcError;
///
/// let e = JsonRpcError { code: -32600, message: "Invalid Request".to_string(), data: None };
/// assert_eq!(e.to_string(), "JSON-RPC error -32600: Invalid Request");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code as defined by JSON-RPC 2.0.
    pub code: i64,
    /// Human-readable error description.
    pub message: String,
    /// Optional additional error context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 notification (a request with no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// The notification method name.
    pub method: String,
    /// Optional notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Builds a parameterless notification.
    pub fn new(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Initialize handshake
// ---------------------------------------------------------------------------

/// Identifies a client or server implementation by name and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    /// Short name of the implementation.
    pub name: String,
    /// Version string.
    pub version: String,
}

/// Parameters sent by the client in the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// The protocol version the client wishes to use.
    pub protocol_version: String,
    /// Capabilities advertised by this client. The negotiator advertises none.
    pub capabilities: serde_json::Value,
    /// Information identifying this client implementation.
    pub client_info: Implementation,
}

/// Result returned by the server to an `initialize` request.
///
/// Only `protocolVersion` is required; everything else is tolerated when
/// missing so that loosely conforming servers still complete the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// The protocol version the server selected for this session.
    pub protocol_version: String,
    /// Capabilities advertised by the server.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Information identifying the server implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    /// Optional human-readable instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Builds the serialized `initialize` request body.
///
/// # Examples
///
/// ```
/// use mcp_negotiator::mcp::types::initialize_request;
///
/// let body = initialize_request("2025-03-26", "mcp-negotiator");
/// assert!(body.contains("\"method\":\"initialize\""));
/// ```
pub fn initialize_request(protocol_version: &str, client_name: &str) -> String {
    let params = InitializeParams {
        protocol_version: protocol_version.to_string(),
        capabilities: serde_json::json!({}),
        client_info: Implementation {
            name: client_name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    let request = JsonRpcRequest::new(
        INITIALIZE_REQUEST_ID,
        METHOD_INITIALIZE,
        serde_json::to_value(params).ok(),
    );
    serde_json::to_string(&request).unwrap_or_default()
}

/// Builds the serialized `notifications/initialized` body.
pub fn initialized_notification() -> String {
    serde_json::to_string(&JsonRpcNotification::new(METHOD_INITIALIZED)).unwrap_or_default()
}

/// Interprets a JSON-RPC payload as the answer to the handshake.
///
/// Returns `Ok(None)` when the payload is valid JSON-RPC but answers some
/// other request (or is a notification), so stream readers can keep
/// waiting.
///
/// # Errors
///
/// Returns a description when the payload is not JSON-RPC, when the server
/// answered the handshake with an error object, or when the result is not a
/// valid initialize result.
pub fn parse_initialize_response(payload: &str) -> std::result::Result<Option<InitializeResult>, String> {
    let response: JsonRpcResponse = serde_json::from_str(payload)
        .map_err(|e| format!("invalid JSON-RPC payload: {}", e))?;
    if !response.answers(INITIALIZE_REQUEST_ID) {
        return Ok(None);
    }
    if let Some(err) = response.error {
        return Err(err.to_string());
    }
    let result = response
        .result
        .ok_or_else(|| "initialize response carried neither result nor error".to_string())?;
    serde_json::from_value(result)
        .map(Some)
        .map_err(|e| format!("invalid initialize result: {}", e))
}
