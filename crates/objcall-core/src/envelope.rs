//! Wire envelopes shared by both peers.
//!
//! ```text
//! call:     {"method": ".a.b", "params": [...], "id": 7}
//! success:  {"id": 7, "result": ...}
//! failure:  {"id": 7, "error": {"code": 0, "message": "Method not found"}}
//! absent:   {"id": 7}
//! batch:    {"method": "rpc-batch", "params": ["parallel", [call, call]], "id": 8}
//! ```
//!
//! A response that carries neither `result` nor `error` is the wire form of
//! "no value": the method ran and returned nothing.

use crate::config::RpcConfig;
use crate::error::{ErrorCode, RpcError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Token matching a response to its call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(u64),
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(n) => write!(f, "{}", n),
            CorrelationId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for CorrelationId {
    fn from(n: u64) -> Self {
        CorrelationId::Number(n)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId::Text(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId::Text(s.to_string())
    }
}

/// A method invocation. Without an `id` it is a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
}

impl CallEnvelope {
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn request(method: impl Into<String>, params: Vec<Value>, id: CorrelationId) -> Self {
        Self {
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Build a batch envelope over already-built subcalls.
    pub fn batch(mode: ExecutionMode, subcalls: &[CallEnvelope], id: Option<CorrelationId>) -> Self {
        let subcalls = subcalls
            .iter()
            .map(|call| serde_json::to_value(call).unwrap_or(Value::Null))
            .collect();
        Self {
            method: RpcConfig::BATCH_METHOD_NAME.to_string(),
            params: vec![Value::String(mode.as_str().to_string()), Value::Array(subcalls)],
            id,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_batch(&self) -> bool {
        self.method == RpcConfig::BATCH_METHOD_NAME
    }

    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// An inbound message that failed shape validation.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCall {
    /// The id, if one could be read; only these are answered.
    pub id: Option<CorrelationId>,
    pub reason: String,
}

/// Validate an inbound message and normalize its params.
///
/// `params` absent or null becomes `[]`, a non-list value `x` becomes `[x]`,
/// and a list is kept as is. A null `id` counts as absent.
pub fn parse_call(message: Value) -> std::result::Result<CallEnvelope, MalformedCall> {
    let Value::Object(mut map) = message else {
        return Err(MalformedCall {
            id: None,
            reason: "envelope is not an object".to_string(),
        });
    };

    let id = match map.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => match serde_json::from_value::<CorrelationId>(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                return Err(MalformedCall {
                    id: None,
                    reason: "id must be a string or a non-negative integer".to_string(),
                })
            }
        },
    };

    let method = match map.remove("method") {
        Some(Value::String(method)) if !method.trim().is_empty() => method,
        _ => {
            return Err(MalformedCall {
                id,
                reason: "method must be a non-empty string".to_string(),
            })
        }
    };

    let params = match map.remove("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(list)) => list,
        Some(scalar) => vec![scalar],
    };

    Ok(CallEnvelope { method, params, id })
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i32(),
            message: message.into(),
            data: None,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// Deserialize a field that is present, keeping an explicit `null` as a value.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Response to a call, keyed by the call's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: Option<CorrelationId>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl ResponseEnvelope {
    /// A successful response. `None` is the absence-of-value response.
    pub fn success(id: CorrelationId, result: Option<Value>) -> Self {
        Self {
            id: Some(id),
            result,
            error: None,
        }
    }

    pub fn failure(id: CorrelationId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            result: None,
            error: Some(ErrorObject::new(code, message)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True for the response of a method that produced no value.
    pub fn is_absent(&self) -> bool {
        self.result.is_none() && self.error.is_none()
    }

    /// Split into the remote outcome: an error, or a possibly absent value.
    pub fn into_outcome(self) -> crate::Result<Option<Value>> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result),
        }
    }
}

/// What the dispatcher hands back for one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Many(Vec<ResponseEnvelope>),
    Single(ResponseEnvelope),
}

impl Reply {
    pub fn into_responses(self) -> Vec<ResponseEnvelope> {
        match self {
            Reply::Single(response) => vec![response],
            Reply::Many(responses) => responses,
        }
    }
}

/// How a batch runs its subcalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            other => Err(RpcError::InvalidRequest {
                message: format!("unknown execution mode '{}'", other),
            }),
        }
    }
}
