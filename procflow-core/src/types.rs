use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Arena index of a node inside its `ProcessDefinition`.
pub type NodeId = u32;

/// Unique id of a running process instance.
pub type ProcessInstanceId = Uuid;

/// Id of a node instance. Unique within the runtime, scoped to one instance.
pub type NodeInstanceId = Uuid;

/// Work item id.
pub type WorkItemId = Uuid;

/// Scheduled job id.
pub type JobId = Uuid;

/// Variable values are plain JSON.
pub type Value = serde_json::Value;

// ─── Process state ────────────────────────────────────────────

/// Lifecycle state of a process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Pending,
    Active,
    Completed,
    Aborted,
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        }
    }

    /// Returns true if no further progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a node instance.
///
/// Created → Triggered → (Active | Completed | Canceled). Only `Active` node
/// instances are kept by their container; the others are transient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeInstanceState {
    Created,
    Triggered,
    Active,
    Completed,
    Canceled,
}

/// Link from a child (sub-process) instance back to the node that spawned it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance_id: ProcessInstanceId,
    pub node_instance_id: NodeInstanceId,
}

/// Where and why an instance entered the `Error` state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub node_id: Option<NodeId>,
    pub node_instance_id: Option<NodeInstanceId>,
    pub message: String,
}
