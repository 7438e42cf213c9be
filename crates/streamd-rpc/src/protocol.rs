//! Message envelope shared by control sessions and worker links.
//!
//! Every frame carries one JSON object in JSON-RPC 2.0 shape. Requests have a
//! `method` and an `id`, responses echo the `id` with either `result` or
//! `error`, and notifications are requests without an `id`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const NOT_ACTIVATED: i32 = -32000;
pub const PERMISSION_DENIED: i32 = -32001;
pub const STREAM_EXISTS: i32 = -32002;
pub const STREAM_NOT_FOUND: i32 = -32003;
pub const VALIDATION_FAILED: i32 = -32004;
pub const SHUTDOWN_IN_PROGRESS: i32 = -32005;
pub const ACTIVATION_FAILED: i32 = -32006;
pub const OPERATION_FAILED: i32 = -32010;

/// POSIX error numbers carried in `error.data.errno`.
pub mod errno {
    pub const EINTR: i32 = 4;
    pub const EAGAIN: i32 = 11;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}

/// Request identifier, numeric for daemon-issued requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: RequestId,
}

impl Response {
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error object of a failed response.
///
/// `data` carries `{"errno": N}` when a POSIX error number applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_errno(code: i32, message: impl Into<String>, errno: i32) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(serde_json::json!({ "errno": errno })),
        }
    }

    /// The POSIX error number attached to this error, if any.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        self.data
            .as_ref()?
            .get("errno")?
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
    }

    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_errno(INVALID_PARAMS, message, errno::EINVAL)
    }

    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn not_activated() -> Self {
        Self::with_errno(NOT_ACTIVATED, "Not activated", errno::EINVAL)
    }

    #[must_use]
    pub fn permission_denied() -> Self {
        Self::with_errno(PERMISSION_DENIED, "Don't have permissions", errno::EINVAL)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Any frame read from a control connection or worker link.
///
/// Decoding picks the variant from the envelope: `method` with a non-null
/// `id` is a request, `method` alone a notification, anything else must be a
/// response.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Some(object) = value.as_object() else {
            return Err(D::Error::custom("message must be a JSON object"));
        };
        let has_method = object.contains_key("method");
        let has_id = object.get("id").is_some_and(|id| !id.is_null());

        let message = match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(Message::Request),
            (true, false) => serde_json::from_value(value).map(Message::Notification),
            (false, _) => serde_json::from_value(value).map(Message::Response),
        };
        message.map_err(D::Error::custom)
    }
}

impl Message {
    /// Parse a JSON string into a `Message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or matches no envelope shape.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    #[must_use]
    pub fn request(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Message::Request(Request::new(method, params, id))
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification::new(method, params))
    }

    /// Method name of a request or notification.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }

    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(r) if r.id.is_some())
    }

    #[must_use]
    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Request(r) if r.id.is_none())
            || matches!(self, Message::Notification(_))
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }
}
