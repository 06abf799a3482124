use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::Sandbox;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Buffered events per [`BroadcastEventSink`] before slow subscribers start lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What happened to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxEventKind {
    /// The sandbox finished spawning.
    #[serde(rename = "sandbox.created")]
    Created,

    /// The sandbox was stopped, started or changed status.
    #[serde(rename = "sandbox.updated")]
    Updated,

    /// The sandbox was destroyed.
    #[serde(rename = "sandbox.deleted")]
    Deleted,
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxEvent {
    /// The event name.
    pub kind: SandboxEventKind,

    /// The sandbox concerned.
    pub sandbox_id: String,

    /// Event-specific fields.
    pub properties: serde_json::Value,

    /// When it happened.
    pub timestamp: DateTime<Utc>,
}

/// Receives lifecycle notifications. Emitting never fails.
pub trait EventSink: Send + Sync {
    /// Publishes `event`.
    fn emit(&self, event: SandboxEvent);
}

/// Logs every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SandboxEvent>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxEventKind {
    /// The dotted event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxEventKind::Created => "sandbox.created",
            SandboxEventKind::Updated => "sandbox.updated",
            SandboxEventKind::Deleted => "sandbox.deleted",
        }
    }
}

impl SandboxEvent {
    /// An event carrying the sandbox id, status and workspace.
    pub fn for_sandbox(kind: SandboxEventKind, sandbox: &Sandbox) -> Self {
        Self::new(
            kind,
            &sandbox.id,
            serde_json::json!({
                "status": sandbox.status,
                "workspaceId": sandbox.workspace_id,
                "ipAddress": sandbox.runtime.ip_address,
            }),
        )
    }

    /// An event with arbitrary properties.
    pub fn new(kind: SandboxEventKind, sandbox_id: &str, properties: serde_json::Value) -> Self {
        Self {
            kind,
            sandbox_id: sandbox_id.to_string(),
            properties,
            timestamp: Utc::now(),
        }
    }
}

impl BroadcastEventSink {
    /// Creates a sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.sender.subscribe()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for SandboxEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventSink for TracingEventSink {
    fn emit(&self, event: SandboxEvent) {
        tracing::info!(
            event = %event.kind,
            sandbox_id = %event.sandbox_id,
            properties = %event.properties,
            "sandbox event"
        );
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: SandboxEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
