//! Connection init exchange and reply envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codes::Channel;

/// Oldest client protocol version still accepted.
pub const MINIMUM_PROTOCOL_VERSION: u32 = 8;
/// Version spoken by this daemon.
pub const CURRENT_PROTOCOL_VERSION: u32 = 12;
/// Clients older than this get the legacy job-layers shape (the layers
/// array change is suppressed from their patches).
pub const JOB_LAYERS_VERSION: u32 = 11;

/// First message on every connection, server to client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInitMessage {
    pub id: u64,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionMode {
    Command,
    Intercept,
    Subscribe,
    CodeStream,
    PluginService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionMode {
    Full,
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterceptPhase {
    Pre,
    Post,
    Executed,
}

/// Client's answer to the server init, declaring mode and version plus the
/// mode-specific options.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInitMessage {
    pub mode: ConnectionMode,
    pub version: u32,
    #[serde(default)]
    pub subscription_mode: Option<SubscriptionMode>,
    /// Subscribe mode: filter paths; empty means the whole model.
    #[serde(default)]
    pub filter: Vec<String>,
    #[serde(default)]
    pub interception_mode: Option<InterceptPhase>,
    /// Intercept mode: restrict to these channels; empty means all.
    #[serde(default)]
    pub channels: Vec<Channel>,
    /// CodeStream mode: the channel the streamed codes execute on.
    #[serde(default)]
    pub channel: Option<Channel>,
}

/// Reply envelope for command-style exchanges.
#[derive(Debug, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "Type")]
    pub error_type: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl Reply {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            success: true,
            result: None,
            error: None,
        }
    }

    pub fn error(error_type: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ErrorBody {
                error_type: error_type.to_string(),
                message: message.into(),
            }),
        }
    }
}
