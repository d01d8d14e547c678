use super::{arm_timer, NodeBehavior, NodeInstance, NodeInstanceData};
use crate::definition::{Node, NodeKind, StartTrigger};
use crate::error::ProcessResult;
use crate::instance::{ExecutionContext, ProcessInstance};
use crate::jobs::JobFire;
use crate::types::{NodeId, NodeInstanceId};
use uuid::Uuid;

pub(crate) struct StartNode;

impl NodeBehavior for StartNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        // A timer start inside a running instance waits for its timer.
        if let NodeKind::Start {
            trigger: StartTrigger::Timer(timer),
        } = &node.kind
        {
            let ni_id = Uuid::now_v7();
            let job_id = arm_timer(inst, ctx, node, timer, ni_id)?;
            return inst.enter(ctx, node, level, ni_id, NodeInstanceData::Timer { job_id });
        }
        inst.pass(ctx, node);
        inst.take_outgoing(node.id, level);
        Ok(())
    }

    fn timer_fired(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        node_instance_id: NodeInstanceId,
        fire: &JobFire,
    ) -> ProcessResult<()> {
        if fire.last {
            inst.leave(ctx, node_instance_id, true)?;
        } else if let Some(ni) = inst.node_instance(node_instance_id) {
            let level = ni.level;
            inst.take_outgoing(node.id, level);
        }
        Ok(())
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

pub(crate) struct EndNode;

impl NodeBehavior for EndNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        _level: u32,
    ) -> ProcessResult<()> {
        if let NodeKind::End { terminate: true } = node.kind {
            tracing::debug!(instance_id = %inst.id, node_id = node.id, "Terminating end reached");
            let others: Vec<NodeInstanceId> =
                inst.node_instances.iter().rev().map(|ni| ni.id).collect();
            for id in others {
                inst.cancel_node_instance(ctx, id)?;
            }
            inst.clear_agenda();
        }
        inst.pass(ctx, node);
        Ok(())
    }
}
