use super::{NodeBehavior, NodeInstance, NodeInstanceData};
use crate::definition::{Node, NodeKind, TimerDefinition};
use crate::error::ProcessResult;
use crate::instance::{ExecutionContext, ProcessInstance};
use crate::jobs::{JobDescription, JobFire};
use crate::types::{JobId, NodeId, NodeInstanceId};
use uuid::Uuid;

/// Schedule the job behind `timer` for node instance `node_instance_id`.
pub(crate) fn arm_timer(
    inst: &ProcessInstance,
    ctx: &mut ExecutionContext<'_>,
    node: &Node,
    timer: &TimerDefinition,
    node_instance_id: NodeInstanceId,
) -> ProcessResult<JobId> {
    let expiration = ctx
        .env
        .clock
        .expiration_for(timer, inst.variables.as_map(), ctx.now)?;
    let job = JobDescription::for_node_instance(
        &inst.process_id,
        inst.id,
        node_instance_id,
        node.id,
        expiration,
    );
    let job_id = job.job_id;
    tracing::debug!(
        instance_id = %inst.id,
        node_id = node.id,
        job_id = %job_id,
        expression = %timer.expression,
        "Timer armed"
    );
    ctx.uow.schedule_job(job);
    Ok(job_id)
}

/// Intermediate timer: waits, then continues. A cycle continues on every
/// fire and completes on the last one.
pub(crate) struct TimerNode;

impl NodeBehavior for TimerNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let NodeKind::Timer { timer } = &node.kind else {
            return Ok(());
        };
        let ni_id = Uuid::now_v7();
        let job_id = arm_timer(inst, ctx, node, timer, ni_id)?;
        inst.enter(ctx, node, level, ni_id, NodeInstanceData::Timer { job_id })
    }

    fn timer_fired(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        node_instance_id: NodeInstanceId,
        fire: &JobFire,
    ) -> ProcessResult<()> {
        tracing::debug!(
            instance_id = %inst.id,
            node_id = node.id,
            fire_count = fire.fire_count,
            last = fire.last,
            "Timer fired"
        );
        if fire.last {
            inst.leave(ctx, node_instance_id, true)?;
        } else if let Some(level) = inst.node_instance(node_instance_id).map(|ni| ni.level) {
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
