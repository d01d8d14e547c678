use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle notifications published at the end of each operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProcessEvent {
    InstanceStateChanged {
        instance_id: ProcessInstanceId,
        process_id: String,
        business_key: Option<String>,
        from: Option<ProcessState>,
        to: ProcessState,
        at: DateTime<Utc>,
    },
    NodeEntered {
        instance_id: ProcessInstanceId,
        node_id: NodeId,
        node_instance_id: NodeInstanceId,
        node_name: String,
    },
    NodeLeft {
        instance_id: ProcessInstanceId,
        node_id: NodeId,
        node_instance_id: NodeInstanceId,
        canceled: bool,
    },
    VariableChanged {
        instance_id: ProcessInstanceId,
        name: String,
        old: Option<Value>,
        new: Value,
    },
    WorkItemTransitioned {
        instance_id: ProcessInstanceId,
        work_item_id: WorkItemId,
        transition: String,
        from: String,
        to: String,
        identity: Option<String>,
    },
}

impl ProcessEvent {
    pub fn instance_id(&self) -> ProcessInstanceId {
        match self {
            Self::InstanceStateChanged { instance_id, .. }
            | Self::NodeEntered { instance_id, .. }
            | Self::NodeLeft { instance_id, .. }
            | Self::VariableChanged { instance_id, .. }
            | Self::WorkItemTransitioned { instance_id, .. } => *instance_id,
        }
    }
}

/// Fire-and-forget sink for `ProcessEvent`s. Failures are logged by the
/// engine, never returned to the caller of the triggering operation.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ProcessEvent) -> Result<()>;

    async fn publish_all(&self, events: &[ProcessEvent]) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
