//! RPC message types carried inside channel `data` payloads.
//!
//! JSON-RPC 2.0 with one addition: requests name the target `service` (the
//! service path the proxy was created for).
//!
//! ```text
//! {"jsonrpc":"2.0","service":"echo","method":"say","params":{...},"id":7}
//! {"jsonrpc":"2.0","result":{...},"id":7}
//! {"jsonrpc":"2.0","error":{"code":-32601,"message":"..."},"id":7}
//! ```

use crate::config::RpcConfig;
use crate::MuxError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request addressed to a service path. Without `id` it is a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub service: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl RpcRequest {
    pub fn new(service: impl Into<String>, method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            service: service.into(),
            method: method.into(),
            params: Some(params),
            id: Some(id),
        }
    }

    pub fn notification(service: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            service: service.into(),
            method: method.into(),
            params: Some(params),
            id: None,
        }
    }
}

/// Response correlated to a request by `id`.
///
/// Unknown fields are rejected so a malformed request cannot be read as a
/// response and settle an unrelated call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    pub id: Option<u64>,
}

impl RpcResponse {
    pub fn success(id: Option<u64>, result: Value) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<u64>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: RpcConfig::JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Build the error response for a failed dispatch.
    pub fn from_error(id: Option<u64>, err: &MuxError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }

    /// Convert into the caller-facing result. A missing result is `null`.
    pub fn into_result(self) -> crate::Result<Value> {
        match self.error {
            Some(err) => Err(MuxError::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Either direction of RPC traffic on one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}
