// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-format types for the client socket protocol and the command plane.
//!
//! All frames are JSON text, one logical message per frame, discriminated by
//! a `type` tag. Field names follow the wire contract: identifiers are
//! camelCase (`sessionHash`, `connectionId`), command payload fields keep
//! their documented spelling (`latency_ms`, `newTab`).

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

// -- Session modes ------------------------------------------------------------

/// Operator-visible session mode.
///
/// `Upspin` means zero self-imposed client latency, `Downspin` a non-zero
/// one. `Terminated` is sticky: no further transitions or command deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Normal,
    Upspin,
    Downspin,
    Terminated,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Upspin => "upspin",
            Self::Downspin => "downspin",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Session hash validation --------------------------------------------------

/// Accepted session hash shape: 16–128 hex characters.
pub fn valid_session_hash(hash: &str) -> bool {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        regex::Regex::new("^[0-9a-fA-F]{16,128}$").unwrap()
    });
    re.is_match(hash)
}

// -- Client -> server frames --------------------------------------------------

/// Device/browser metadata reported in the handshake frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub screen_width: Option<u32>,
    #[serde(default)]
    pub screen_height: Option<u32>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub network_type: Option<String>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

/// Frames accepted from clients. Unknown `type` tags fail to parse and are
/// dropped with a warning by the connection handler.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Handshake {
        #[serde(rename = "sessionHash")]
        session_hash: String,
        #[serde(default)]
        metadata: ClientMetadata,
    },
    Batch {
        #[serde(rename = "sessionHash")]
        session_hash: String,
        #[serde(default)]
        events: Vec<serde_json::Value>,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    Event {
        #[serde(rename = "sessionHash", default)]
        session_hash: Option<String>,
        #[serde(flatten)]
        fields: serde_json::Map<String, serde_json::Value>,
    },
    Interaction {
        #[serde(rename = "sessionHash", default)]
        session_hash: Option<String>,
        #[serde(flatten)]
        fields: serde_json::Map<String, serde_json::Value>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    CommandAck {
        #[serde(rename = "commandId")]
        command_id: String,
        #[serde(rename = "commandType", default)]
        command_type: Option<String>,
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
}

// -- Server -> client frames --------------------------------------------------

/// Frames the server emits on a client socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
        timestamp: u64,
    },
    Ping {
        timestamp: u64,
    },
    Command {
        command: CommandEnvelope,
    },
}

// -- Commands -----------------------------------------------------------------

/// Toast severity accepted by `TOAST_ALERT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Info,
    Success,
    Warning,
    Error,
}

impl Default for ToastKind {
    fn default() -> Self {
        Self::Info
    }
}

/// Client storage areas targeted by `CLEAR_STORAGE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[serde(rename = "localStorage")]
    Local,
    #[serde(rename = "sessionStorage")]
    Session,
}

fn default_toast_duration() -> u64 {
    5000
}

/// The command set, serialized as `{type: "...", payload: {...}}`.
///
/// Clients match on this total set; an unrecognized type is a protocol error
/// on their side, so new variants are additive wire changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    SetLatency {
        latency_ms: u64,
    },
    Terminate {
        reason: String,
    },
    ToastAlert {
        message: String,
        #[serde(rename = "type", default)]
        kind: ToastKind,
        #[serde(default = "default_toast_duration")]
        duration: u64,
    },
    Redirect {
        url: String,
        #[serde(rename = "newTab", default)]
        new_tab: bool,
    },
    RefreshPage {
        #[serde(default)]
        delay: u64,
    },
    ClearStorage {
        types: Vec<StorageKind>,
    },
    LogMessage {
        level: String,
        message: String,
    },
    UpdateConfig(serde_json::Value),
    CustomEvent {
        #[serde(rename = "eventName")]
        event_name: String,
        #[serde(default)]
        detail: serde_json::Value,
    },
}

impl Command {
    /// Wire tag for this command, used in audit rows.
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::SetLatency { .. } => "SET_LATENCY",
            Self::Terminate { .. } => "TERMINATE",
            Self::ToastAlert { .. } => "TOAST_ALERT",
            Self::Redirect { .. } => "REDIRECT",
            Self::RefreshPage { .. } => "REFRESH_PAGE",
            Self::ClearStorage { .. } => "CLEAR_STORAGE",
            Self::LogMessage { .. } => "LOG_MESSAGE",
            Self::UpdateConfig(_) => "UPDATE_CONFIG",
            Self::CustomEvent { .. } => "CUSTOM_EVENT",
        }
    }
}

/// A command with its delivery identity: `{id, type, payload, createdAt}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(flatten)]
    pub command: Command,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

impl CommandEnvelope {
    pub fn new(command: Command, now_ms: u64) -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), command, created_at: now_ms }
    }

    pub fn command_type(&self) -> &'static str {
        self.command.type_str()
    }

    /// Whether this envelope carries the terminal notice. Terminated sessions
    /// accept no frames except this one.
    pub fn is_terminate(&self) -> bool {
        matches!(self.command, Command::Terminate { .. })
    }
}

/// Audit lifecycle of an issued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
