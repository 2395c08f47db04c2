//! JSON-RPC 2.0 message model: error codes, response builders, and inbound
//! call validation.
//!
//! Outbound messages are built as typed values; inbound traffic is validated
//! directly against `serde_json::Value` because the interesting distinctions
//! (absent `id` vs `id: null`, wrong-typed fields) are exactly the ones serde
//! derive would paper over.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Wire protocol version carried by every message.
pub const PROTOCOL_VERSION: &str = "2.0";

/// The peer sent bytes that were not a parseable JSON document.
pub const PARSE_ERROR: i64 = -32700;
/// The message was parseable but not a well-formed request.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler is registered for the requested method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// The handler failed while processing the request.
pub const INTERNAL_ERROR: i64 = -32603;

/// A protocol error object, as carried in an error response.
///
/// Implements `std::error::Error` so handlers can return one through
/// `anyhow` and have the channel pass it through unchanged instead of
/// wrapping it as an Internal-Error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("RPC error {code}: {message}")]
pub struct ErrorObject {
    /// Numeric JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional auxiliary data (e.g., a diagnostic trace).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Build an arbitrary protocol error.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Parse-Error (-32700) for an unparseable body.
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, format!("Parse error: {}", detail.into()))
    }

    /// Invalid-Request (-32600).
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    /// Method-Not-Found (-32601).
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Internal-Error (-32603) carrying the failure's message and, where
    /// available, a diagnostic trace as auxiliary data.
    pub fn internal(message: impl Into<String>, trace: Option<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
            data: trace.map(|t| json!({ "stack": t })),
        }
    }
}

/// Build a success response for the given request `id`.
pub fn success_response(id: Value, result: Value) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "result": result,
        "id": id,
    })
}

/// Build an error response for the given request `id` (use `Value::Null`
/// when the offending message carried no usable id).
pub fn error_response(id: Value, error: ErrorObject) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "error": error,
        "id": id,
    })
}

/// The outcome of validating one inbound call object.
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// A well-formed request with an `id` (which may legitimately be null).
    Request {
        method: String,
        params: Value,
        id: Value,
    },
    /// A well-formed request without an `id`: no response may be sent.
    Notification { method: String, params: Value },
    /// Not a well-formed request. `id` is the original id when it was of a
    /// valid type, otherwise null.
    Invalid { id: Value },
}

/// Validate a single inbound call object per JSON-RPC 2.0.
///
/// A valid call must be a JSON object with `protocolVersion == "2.0"`, a
/// string `method`, and — when the key is present at all — an `id` that is
/// a string, number, or null.
pub fn validate_call(value: &Value) -> Validated {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Validated::Invalid { id: Value::Null },
    };

    // Carry the original id in an Invalid-Request answer only when its type
    // is legal; an unusable id degrades to null.
    let id = obj.get("id").cloned();
    let id_ok = match &id {
        None => true,
        Some(Value::String(_)) | Some(Value::Number(_)) | Some(Value::Null) => true,
        Some(_) => false,
    };
    let reply_id = if id_ok {
        id.clone().unwrap_or(Value::Null)
    } else {
        Value::Null
    };

    let version_ok = obj
        .get("protocolVersion")
        .and_then(Value::as_str)
        .map(|v| v == PROTOCOL_VERSION)
        .unwrap_or(false);
    let method = obj.get("method").and_then(Value::as_str);

    if !version_ok || method.is_none() || !id_ok {
        return Validated::Invalid { id: reply_id };
    }

    let method = method.unwrap_or_default().to_string();
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    match id {
        Some(id) => Validated::Request { method, params, id },
        None => Validated::Notification { method, params },
    }
}
