//! Engine error model.
//!
//! Every failure surfaced by a runtime mutator maps to one `ProcessError`
//! variant. None of them is retried by the engine.

use crate::types::{NodeId, NodeInstanceId, ProcessInstanceId, ProcessState, WorkItemId};

pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Work item or node instance state machine violation.
    #[error("Illegal transition '{transition}' for {subject} in phase {phase}")]
    IllegalTransition {
        subject: String,
        transition: String,
        phase: String,
    },

    /// A policy rejected a work item transition.
    #[error("Identity '{identity}' is not authorized to '{transition}' work item {work_item_id}")]
    NotAuthorized {
        work_item_id: WorkItemId,
        transition: String,
        identity: String,
    },

    /// Variable tag constraint violated (required, readonly) or type mismatch.
    #[error("Variable '{variable}' of process '{process_id}': {message}")]
    VariableViolation {
        process_id: String,
        variable: String,
        message: String,
    },

    /// Exclusive/inclusive split with no satisfied guard and no default edge.
    #[error(
        "No outgoing connection of node {node_id} in process '{process_id}' matched \
         and no default is set"
    )]
    NoMatchingEdge { process_id: String, node_id: NodeId },

    #[error("Process instance {0} already exists")]
    ProcessInstanceDuplicated(String),

    #[error("Process instance {0} not found")]
    ProcessInstanceNotFound(ProcessInstanceId),

    #[error("Job scheduling failed: {0}")]
    JobScheduling(String),

    #[error("Process definition '{0}' not found")]
    ProcessNotFound(String),

    #[error("Invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("Node {node_id} not found in process '{process_id}'")]
    NodeNotFound { process_id: String, node_id: NodeId },

    #[error("Node instance {node_instance_id} not found in process instance {instance_id}")]
    NodeInstanceNotFound {
        instance_id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
    },

    #[error("Work item {work_item_id} not found in process instance {instance_id}")]
    WorkItemNotFound {
        instance_id: ProcessInstanceId,
        work_item_id: WorkItemId,
    },

    #[error("No work item handler registered for '{0}'")]
    UnknownWorkItemHandler(String),

    #[error("Invalid timer expression '{expression}': {reason}")]
    InvalidTimerExpression { expression: String, reason: String },

    #[error("Process instance {instance_id} is {state}")]
    ProcessNotActive {
        instance_id: ProcessInstanceId,
        state: ProcessState,
    },

    #[error("Process instance {instance_id} exceeded {steps} traversal steps")]
    TraversalLimit {
        instance_id: ProcessInstanceId,
        steps: usize,
    },

    /// Failure reported by a collaborator (store, jobs service, publisher).
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl ProcessError {
    pub(crate) fn invalid_timer(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTimerExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn variable(process_id: &str, variable: &str, message: impl Into<String>) -> Self {
        Self::VariableViolation {
            process_id: process_id.to_string(),
            variable: variable.to_string(),
            message: message.into(),
        }
    }
}
