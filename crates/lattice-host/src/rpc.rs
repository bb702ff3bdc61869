use serde::{Deserialize, Serialize};

use lattice_activity::ActivityError;
use lattice_store::StoreError;

/// JSON-RPC request from a window client.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC response. `{ id, success, result?, error?: { code, message } }`
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// RPC error object with a string code the client can switch on.
#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, "METHOD_NOT_FOUND", format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, "INVALID_PARAMS", msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, "PARSE_ERROR", "Parse error")
    }

    pub fn from_store_error(id: Option<serde_json::Value>, err: &StoreError) -> Self {
        Self::error(id, store_error_code(err), err.to_string())
    }

    pub fn from_activity_error(id: Option<serde_json::Value>, err: &ActivityError) -> Self {
        Self::error(id, activity_error_code(err), err.to_string())
    }
}

/// Wire code for a store error.
pub fn store_error_code(err: &StoreError) -> &'static str {
    match err {
        StoreError::ContextNotFound(_) => "CONTEXT_NOT_FOUND",
        StoreError::VersionConflict { .. } => "VERSION_CONFLICT",
        StoreError::NeedsResync { .. } => "NEEDS_RESYNC",
        StoreError::NotJoined(_) => "NOT_JOINED",
        StoreError::Serialization(_) => "SERIALIZATION_ERROR",
    }
}

/// Wire code for an activity error.
pub fn activity_error_code(err: &ActivityError) -> &'static str {
    match err {
        ActivityError::Store(inner) => store_error_code(inner),
        ActivityError::Windowing(_) => "WINDOWING_ERROR",
        ActivityError::ActivityNotFound(_) => "ACTIVITY_NOT_FOUND",
        ActivityError::TypeNotFound(_) => "TYPE_NOT_FOUND",
        ActivityError::UnknownWindowType(_) => "UNKNOWN_WINDOW_TYPE",
        ActivityError::OwnerCreationFailed(_) => "OWNER_CREATION_FAILED",
        ActivityError::AttachInProgress(_) => "ATTACH_IN_PROGRESS",
        ActivityError::AttachInvalid(_) => "ATTACH_INVALID",
        ActivityError::DetachInvalid(_) => "DETACH_INVALID",
        ActivityError::StackedWindowTimeout(_) => "STACKED_WINDOW_TIMEOUT",
    }
}

/// Extract a required string param.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

/// Extract a required object param (a context value or partial).
pub fn require_object<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a serde_json::Map<String, serde_json::Value>, String> {
    params
        .get(key)
        .and_then(|v| v.as_object())
        .ok_or_else(|| format!("Missing required object parameter: {key}"))
}

/// Extract an optional string param.
pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Extract an optional u64 param.
pub fn optional_u64(params: &serde_json::Value, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

/// Extract an optional i64 param.
pub fn optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}
