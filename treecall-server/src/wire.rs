//! JSON frames exchanged over a WebSocket.
//!
//! Client → server: a [`CommandFrame`], either a call or a kill request.
//! Server → client: a [`CallReturn`] per delivery.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::call::{CallRequest, CallReturn};

/// Retcode for a call addressed to a root this server does not serve.
pub const RETCODE_FOREIGN_ROOT: i32 = -404;
/// Retcode for a kill request whose target cannot be parsed.
pub const RETCODE_BAD_KILL: i32 = 400;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandFrame {
    pub id: i32,
    /// Full call path, or the decimal id to cancel when `kill` is set.
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub kw: BTreeMap<String, String>,
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub kill: bool,
}

impl CommandFrame {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// First path segment, i.e. the root the call is addressed to.
    pub fn root(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }

    pub fn into_request(self) -> CallRequest {
        CallRequest {
            id: self.id,
            path: self.name,
            args: self.args,
            kw: self.kw,
            message: self.message,
        }
    }
}

pub fn encode_result(ret: &CallReturn) -> Result<String, serde_json::Error> {
    serde_json::to_string(ret)
}
