//! Node instances and the per-kind behaviour behind them.
//!
//! A node instance exists only while its node is waiting (for a signal, a
//! timer, a work item, a child process or more join arrivals). Nodes that
//! finish inside `trigger` never leave one behind.

mod action;
mod event;
mod gateway;
mod start_end;
mod sub_process;
mod timer;
pub(crate) mod work_item;

use crate::definition::{Node, NodeKind};
use crate::error::ProcessResult;
use crate::instance::{ExecutionContext, ProcessInstance};
use crate::jobs::JobFire;
use crate::types::{
    JobId, NodeId, NodeInstanceId, NodeInstanceState, ProcessInstanceId, Value, WorkItemId,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub enum NodeInstanceData {
    /// Left behind by a failed trigger so the node can be retriggered.
    Failed,
    Event {
        event_type: String,
    },
    Timer {
        job_id: JobId,
    },
    Join {
        /// Arrivals per source node.
        arrivals: BTreeMap<NodeId, u32>,
    },
    WorkItem {
        work_item_id: WorkItemId,
    },
    SubProcess {
        child_id: ProcessInstanceId,
    },
    Boundary {
        host: NodeInstanceId,
        job_id: Option<JobId>,
        event_type: Option<String>,
    },
    /// Waiting for the zero-delay job of an async continuation.
    Async {
        job_id: JobId,
        from: Option<NodeId>,
    },
}

impl NodeInstanceData {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Timer { job_id } | Self::Async { job_id, .. } => Some(*job_id),
            Self::Boundary { job_id, .. } => *job_id,
            _ => None,
        }
    }

    pub fn awaited_event(&self) -> Option<&str> {
        match self {
            Self::Event { event_type } => Some(event_type),
            Self::Boundary { event_type, .. } => event_type.as_deref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeInstance {
    pub id: NodeInstanceId,
    pub node_id: NodeId,
    /// Join correlation scope.
    pub level: u32,
    pub state: NodeInstanceState,
    pub data: NodeInstanceData,
    pub triggered_at: DateTime<Utc>,
}

/// Behaviour of one node kind.
pub(crate) trait NodeBehavior: Send + Sync {
    /// Enter the node. Either finishes (pushing outgoing triggers) or leaves
    /// an active node instance behind.
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()>;

    fn signal(
        &self,
        _inst: &mut ProcessInstance,
        _ctx: &mut ExecutionContext<'_>,
        _node: &Node,
        _node_instance_id: NodeInstanceId,
        _event_type: &str,
        _payload: &Value,
    ) -> ProcessResult<()> {
        Ok(())
    }

    fn timer_fired(
        &self,
        _inst: &mut ProcessInstance,
        _ctx: &mut ExecutionContext<'_>,
        _node: &Node,
        _node_instance_id: NodeInstanceId,
        _fire: &JobFire,
    ) -> ProcessResult<()> {
        Ok(())
    }

    /// Type specific teardown before the node instance is removed.
    fn cancel(
        &self,
        _inst: &mut ProcessInstance,
        _ctx: &mut ExecutionContext<'_>,
        _node: &Node,
        _node_instance: &NodeInstance,
    ) -> ProcessResult<()> {
        Ok(())
    }
}

pub(crate) fn behavior_for(kind: &NodeKind) -> &'static dyn NodeBehavior {
    match kind {
        NodeKind::Start { .. } => &start_end::StartNode,
        NodeKind::End { .. } => &start_end::EndNode,
        NodeKind::Split { .. } => &gateway::SplitNode,
        NodeKind::Join { .. } => &gateway::JoinNode,
        NodeKind::CatchEvent { .. } => &event::CatchEventNode,
        NodeKind::ThrowEvent { .. } => &event::ThrowEventNode,
        NodeKind::Boundary { .. } => &event::BoundaryNode,
        NodeKind::Timer { .. } => &timer::TimerNode,
        NodeKind::WorkItem { .. } => &work_item::WorkItemNode,
        NodeKind::SubProcess { .. } => &sub_process::SubProcessNode,
        NodeKind::Action { .. } => &action::ActionNode,
    }
}

pub(crate) use event::arm_boundary;
pub(crate) use gateway::fire_ready_inclusive_joins;
pub(crate) use sub_process::resume_from_child;
pub(crate) use timer::arm_timer;
