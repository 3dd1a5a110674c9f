//! Events published to the UI layer.
//!
//! These are the only data the subsystem exposes outward: human-readable
//! status messages and node occupancy changes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification attached to every status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    Connect,
    Disconnect,
    Status,
    Info,
    Debug,
    Warning,
    Error,
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Status => "status",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A human-readable status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub text: String,
    pub category: StatusCategory,
}

impl StatusMessage {
    pub fn new(text: impl Into<String>, category: StatusCategory) -> Self {
        Self {
            text: text.into(),
            category,
        }
    }

    /// Whether the UI should surface this as a transient connection notice.
    pub fn is_connection_related(&self) -> bool {
        matches!(
            self.category,
            StatusCategory::Connect | StatusCategory::Disconnect
        )
    }
}

/// What a node slot is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// An application instance (telnet/SSH session).
    Instance,
    /// A BinkP mail gateway session.
    Gateway,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance => f.write_str("instance"),
            Self::Gateway => f.write_str("gateway"),
        }
    }
}

/// Snapshot of a node after its occupancy changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub number: u32,
    pub kind: NodeKind,
    pub in_use: bool,
    pub status: String,
    pub remote_addr: Option<String>,
}

/// Everything the server publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Status(StatusMessage),
    Node(NodeStatus),
}
