//! Wire types shared by the gateway and worker processes
//!
//! These types are used by:
//! - the gateway (HTTP surfaces and the worker IPC channel)
//! - the worker runtime (handshake and command handling)
//! - JS callers, through the generated TypeScript bindings
//!
//! Serializable with serde for JSON over HTTP and newline-delimited IPC

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Commands
// ============================================================================

/// Command envelope handed to a worker's plugin host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct CommandEnvelope {
    /// Who the command runs on behalf of (user or tenant id)
    #[serde(default)]
    pub for_whom: String,

    /// Command name understood by the plugin
    pub name: String,

    /// Plugin that owns the command
    pub plugin_name: String,

    /// Arbitrary command arguments
    #[serde(default)]
    #[ts(type = "unknown")]
    pub args: serde_json::Value,
}

/// Reply produced by a worker for an executed command.
///
/// Exactly one of `result` / `err` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct CommandReply {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl CommandReply {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            status_code: 200,
            result: Some(result),
            err: None,
        }
    }

    pub fn failed(status_code: u16, err: impl Into<String>) -> Self {
        Self {
            status_code,
            result: None,
            err: Some(err.into()),
        }
    }
}

/// Reply to `PUT /proxy/setEnv/{workerId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct RestartReply {
    pub status_code: u16,
    pub message: String,
    pub new_url: String,
}

// ============================================================================
// Worker IPC
// ============================================================================

/// Control message sent by the gateway to a worker over its stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "type", rename_all = "lowercase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub enum SupervisorMessage {
    /// Begin serving with the worker's startup configuration
    Start {
        /// Registry id; workers prefix their call ids with it
        #[serde(rename = "workerId", default)]
        worker_id: String,
        /// Base URL of the gateway's webhooks
        #[serde(rename = "gatewayUrl", default)]
        gateway_url: Option<String>,
        #[serde(default)]
        #[ts(type = "unknown")]
        config: serde_json::Value,
    },
}

/// Lifecycle message sent by a worker to the gateway over its stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "type", rename_all = "lowercase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub enum WorkerMessage {
    /// The worker accepts HTTP commands at `url`
    Ready { url: String },
    /// The worker could not start
    Error { message: String },
}

// ============================================================================
// Worker Status
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub enum WorkerStatus {
    /// Forked, waiting for the readiness handshake
    Starting,
    /// Handshake done; addressable over HTTP
    Ready,
}

/// Admin view of one registered worker.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub url: Option<String>,
    pub script_path: String,
    pub registered_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

// ============================================================================
// Internal Webhook
// ============================================================================

/// `PUT /internalWebhook/result`
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct ResultWrite {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub result: serde_json::Value,
}

/// `PUT /internalWebhook/progress`
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct ProgressWrite {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub progress: serde_json::Value,
}

/// `PUT /internalWebhook/expiryTime`; `expiry_time` is in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct ExpiryTimeWrite {
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub expiry_time: Option<u64>,
}

/// Poll reply for `GET /internalWebhook/{callId}`.
///
/// `Completed` whenever a result exists, even with progress still queued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "status", rename_all = "lowercase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub enum CallStatus {
    Completed {
        #[ts(type = "unknown")]
        result: serde_json::Value,
        #[ts(type = "unknown")]
        progress: Option<serde_json::Value>,
    },
    Pending {
        #[ts(type = "unknown")]
        progress: Option<serde_json::Value>,
    },
}

// ============================================================================
// External Webhook
// ============================================================================

/// `PUT|POST /externalWebhook/result`
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub struct ExternalResultWrite {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub data: serde_json::Value,
}

/// Single-shot read reply for `GET /externalWebhook/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "status", rename_all = "lowercase")]
#[ts(export, export_to = "../../bindings/gateway.ts")]
pub enum ExternalResultRead {
    Completed {
        #[ts(type = "unknown")]
        result: serde_json::Value,
    },
}
