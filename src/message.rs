//! Control-channel and discovery envelope types
//!
//! Every request is `{api, params}` and every response is
//! `{success, data?, error?}` - a definite success or a definite failure
//! carrying one stable error code, never a partial shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::ErrorCode;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub api: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn new(api: &str) -> Self {
        Self {
            api: api.to_string(),
            params: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<u32>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn fail(code: ErrorCode) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(code.as_u32()),
        }
    }
}

/// Entry kind reported by listings and transfers
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Dir,
}

/// Listing entry. Directories report size 0.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ftype: FileType,
    pub size: u64,
}

/// One sharing as advertised by `list`, `info` and discovery responses
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SharingInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ftype: FileType,
    pub read_only: bool,
}

/// Discovery payload. Regenerated on every response, never stored.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub auth_required: bool,
    pub ssl_enabled: bool,
    pub sharings: Vec<SharingInfo>,
}

// Typed param extraction. Missing or mistyped params are the caller's
// syntax error, not an internal failure.

pub fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, ErrorCode> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or(ErrorCode::InvalidCommandSyntax)
}

pub fn param_opt_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn param_opt_bool(params: &Map<String, Value>, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn param_u64(params: &Map<String, Value>, key: &str) -> Result<u64, ErrorCode> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or(ErrorCode::InvalidCommandSyntax)
}

/// Optional list-of-strings param; absent means empty.
pub fn param_str_list(params: &Map<String, Value>, key: &str) -> Result<Vec<String>, ErrorCode> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or(ErrorCode::InvalidCommandSyntax)
            })
            .collect(),
        Some(_) => Err(ErrorCode::InvalidCommandSyntax),
    }
}
