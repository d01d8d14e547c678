use super::{arm_timer, NodeBehavior, NodeInstance, NodeInstanceData};
use crate::definition::{BoundaryTrigger, Node, NodeKind, SignalScope};
use crate::error::ProcessResult;
use crate::instance::{AgendaItem, ExecutionContext, ProcessInstance};
use crate::jobs::JobFire;
use crate::types::{NodeId, NodeInstanceId, Value};
use uuid::Uuid;

/// Intermediate catch: waits for one event type.
pub(crate) struct CatchEventNode;

impl NodeBehavior for CatchEventNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let NodeKind::CatchEvent { event_type, .. } = &node.kind else {
            return Ok(());
        };
        let data = NodeInstanceData::Event {
            event_type: event_type.clone(),
        };
        inst.enter(ctx, node, level, Uuid::now_v7(), data)
    }

    fn signal(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        node_instance_id: NodeInstanceId,
        event_type: &str,
        payload: &Value,
    ) -> ProcessResult<()> {
        if let NodeKind::CatchEvent {
            variable: Some(variable),
            ..
        } = &node.kind
        {
            inst.set_variable(ctx, variable, payload.clone())?;
        }
        tracing::debug!(instance_id = %inst.id, node_id = node.id, event_type, "Event caught");
        inst.leave(ctx, node_instance_id, true)?;
        Ok(())
    }
}

/// Intermediate throw. Instance scope is delivered before anything else on
/// the agenda; default scope is broadcast once the operation is flushed.
pub(crate) struct ThrowEventNode;

impl NodeBehavior for ThrowEventNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let NodeKind::ThrowEvent {
            event_type,
            scope,
            source,
        } = &node.kind
        else {
            return Ok(());
        };
        let payload = source
            .as_deref()
            .and_then(|s| inst.variables.get(s).cloned())
            .unwrap_or(Value::Null);
        inst.pass(ctx, node);
        inst.take_outgoing(node.id, level);
        tracing::debug!(
            instance_id = %inst.id,
            node_id = node.id,
            event_type = %event_type,
            ?scope,
            "Throwing event"
        );
        match scope {
            SignalScope::ProcessInstance => inst.push(AgendaItem::Deliver {
                event_type: event_type.clone(),
                payload,
            }),
            SignalScope::Default => ctx.uow.signal(event_type, payload),
        }
        Ok(())
    }
}

/// Arm one boundary of a host node instance. Returns the boundary's node
/// instance id and data; the caller registers it.
pub(crate) fn arm_boundary(
    inst: &ProcessInstance,
    ctx: &mut ExecutionContext<'_>,
    boundary: &Node,
    host: NodeInstanceId,
) -> ProcessResult<(NodeInstanceId, NodeInstanceData)> {
    let id = Uuid::now_v7();
    let data = match &boundary.kind {
        NodeKind::Boundary {
            trigger: BoundaryTrigger::Timer(timer),
            ..
        } => NodeInstanceData::Boundary {
            host,
            job_id: Some(arm_timer(inst, ctx, boundary, timer, id)?),
            event_type: None,
        },
        NodeKind::Boundary {
            trigger: BoundaryTrigger::Signal { event_type, .. },
            ..
        } => NodeInstanceData::Boundary {
            host,
            job_id: None,
            event_type: Some(event_type.clone()),
        },
        _ => NodeInstanceData::Boundary {
            host,
            job_id: None,
            event_type: None,
        },
    };
    Ok((id, data))
}

/// Boundary event attached to an activity. Interrupting boundaries cancel
/// the host before continuing; non-interrupting ones stay armed.
pub(crate) struct BoundaryNode;

impl BoundaryNode {
    fn fire(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        node_instance_id: NodeInstanceId,
        payload: Option<&Value>,
        exhausted: bool,
    ) -> ProcessResult<()> {
        let NodeKind::Boundary {
            trigger,
            cancel_activity,
            ..
        } = &node.kind
        else {
            return Ok(());
        };
        let Some(ni) = inst.node_instance(node_instance_id).cloned() else {
            return Ok(());
        };
        let NodeInstanceData::Boundary { host, job_id, .. } = ni.data else {
            return Ok(());
        };
        if let (BoundaryTrigger::Signal { variable: Some(variable), .. }, Some(payload)) =
            (trigger, payload)
        {
            inst.set_variable(ctx, variable, payload.clone())?;
        }
        tracing::debug!(
            instance_id = %inst.id,
            node_id = node.id,
            host = %host,
            interrupting = *cancel_activity,
            "Boundary event triggered"
        );
        if *cancel_activity {
            if let (Some(job_id), false) = (job_id, exhausted) {
                ctx.uow.cancel_job(job_id);
            }
            inst.leave(ctx, node_instance_id, false)?;
            inst.cancel_node_instance(ctx, host)?;
        } else if exhausted {
            inst.leave(ctx, node_instance_id, false)?;
        }
        inst.take_outgoing(node.id, ni.level);
        Ok(())
    }
}

impl NodeBehavior for BoundaryNode {
    /// Reached directly (e.g. `trigger_node`): behaves like a pass-through.
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        inst.pass(ctx, node);
        inst.take_outgoing(node.id, level);
        Ok(())
    }

    fn signal(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        node_instance_id: NodeInstanceId,
        _event_type: &str,
        payload: &Value,
    ) -> ProcessResult<()> {
        self.fire(inst, ctx, node, node_instance_id, Some(payload), false)
    }

    fn timer_fired(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        node_instance_id: NodeInstanceId,
        fire: &JobFire,
    ) -> ProcessResult<()> {
        self.fire(inst, ctx, node, node_instance_id, None, fire.last)
    }

    fn cancel(
        &self,
        _inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        _node: &Node,
        node_instance: &NodeInstance,
    ) -> ProcessResult<()> {
        if let Some(job_id) = node_instance.data.job_id() {
            ctx.uow.cancel_job(job_id);
        }
        Ok(())
    }
}
