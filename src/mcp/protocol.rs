//! JSON-RPC 2.0 frame types for the stdio transport.
//!
//! Each frame is exactly one JSON object terminated by a single newline.
//! Outgoing requests carry monotonically increasing integer ids; incoming
//! lines are classified by [`Frame::classify`] into responses, notifications,
//! and server-initiated requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A request sent to the server.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// A notification (no id, no response expected).
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params: None,
        }
    }
}

/// Error object in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reply sent when the server calls a method we do not expose.
pub fn method_not_found_reply(id: &Value, method: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("method not found: {method}"),
        }
    })
}

/// One classified incoming frame.
#[derive(Debug)]
pub enum Frame {
    /// A response to one of our requests.
    Response {
        id: u64,
        result: Result<Value, JsonRpcError>,
    },
    /// A server-initiated notification; ignored beyond logging.
    Notification { method: String },
    /// The server is making a request of us; answered with
    /// `method_not_found`.
    ServerRequest { id: Value, method: String },
    /// Unintelligible line.
    Malformed,
}

impl Frame {
    /// Classify one line read from the server's stdout.
    pub fn classify(line: &str) -> Frame {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return Frame::Malformed;
        };
        let Some(obj) = value.as_object() else {
            return Frame::Malformed;
        };

        let id = obj.get("id");
        let method = obj.get("method").and_then(|m| m.as_str());

        match (id, method) {
            // Response: has id plus result or error, no method.
            (Some(id), None) => {
                let Some(id) = id.as_u64() else {
                    // We only ever issue integer ids; anything else cannot
                    // correlate to a waiter.
                    return Frame::Malformed;
                };
                if let Some(error) = obj.get("error") {
                    match serde_json::from_value::<JsonRpcError>(error.clone()) {
                        Ok(error) => Frame::Response {
                            id,
                            result: Err(error),
                        },
                        Err(_) => Frame::Malformed,
                    }
                } else if let Some(result) = obj.get("result") {
                    Frame::Response {
                        id,
                        result: Ok(result.clone()),
                    }
                } else {
                    Frame::Malformed
                }
            }
            // Server-initiated request.
            (Some(id), Some(method)) => Frame::ServerRequest {
                id: id.clone(),
                method: method.to_string(),
            },
            // Notification.
            (None, Some(method)) => Frame::Notification {
                method: method.to_string(),
            },
            (None, None) => Frame::Malformed,
        }
    }
}
