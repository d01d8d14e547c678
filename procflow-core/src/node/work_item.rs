//! Work item nodes: create a work item, drive it through its handler's
//! lifecycle and continue once it reaches a terminal phase.

use super::{NodeBehavior, NodeInstance, NodeInstanceData};
use crate::definition::{Node, NodeKind};
use crate::error::{ProcessError, ProcessResult};
use crate::events::ProcessEvent;
use crate::instance::{AgendaItem, ExecutionContext, ProcessInstance};
use crate::types::{NodeId, WorkItemId};
use crate::workitem::{Transition, TransitionRecord, WorkItem, WorkItemPhase, ABORT, ACTIVATE};
use uuid::Uuid;

pub(crate) struct WorkItemNode;

impl NodeBehavior for WorkItemNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let NodeKind::WorkItem {
            work_type,
            parameters,
            inputs,
            ..
        } = &node.kind
        else {
            return Ok(());
        };
        ctx.env.handlers.get(work_type)?;

        let mut params = parameters.clone();
        for mapping in inputs {
            if let Some(value) = inst.variables.get(&mapping.source) {
                params.insert(mapping.target.clone(), value.clone());
            }
        }
        let ni_id = Uuid::now_v7();
        let work_item = WorkItem::new(inst.id, ni_id, node.id, work_type, params);
        let work_item_id = work_item.id;
        tracing::info!(
            instance_id = %inst.id,
            node_id = node.id,
            work_item_id = %work_item_id,
            work_type = %work_type,
            "Work item created"
        );
        inst.work_items.insert(work_item_id, work_item);
        inst.enter(ctx, node, level, ni_id, NodeInstanceData::WorkItem { work_item_id })?;
        inst.push(AgendaItem::WorkItemTransition {
            work_item_id,
            transition: Transition::new(ACTIVATE),
        });
        Ok(())
    }

    /// Abort a live work item along with its node instance.
    fn cancel(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        _node: &Node,
        node_instance: &NodeInstance,
    ) -> ProcessResult<()> {
        let NodeInstanceData::WorkItem { work_item_id } = &node_instance.data else {
            return Ok(());
        };
        let Some(mut work_item) = inst.work_items.remove(work_item_id) else {
            return Ok(());
        };
        let handler = ctx.env.handlers.get(&work_item.work_type)?;
        let lifecycle = handler.lifecycle();
        if lifecycle.is_terminal(&work_item.phase) {
            return Ok(());
        }
        let transition = Transition::new(ABORT);
        match lifecycle.transition_to_phase(&mut work_item, &transition) {
            Ok(record) => publish(inst, ctx, &record),
            Err(e) => {
                tracing::debug!(
                    work_item_id = %work_item.id,
                    error = %e,
                    "Abort not legal here; forcing phase"
                );
                work_item.phase = WorkItemPhase::Aborted;
            }
        }
        // Follow-ups of an aborted item have nowhere to go.
        if let Some(follow_up) = handler.abort(&work_item, &transition) {
            tracing::warn!(
                work_item_id = %work_item.id,
                transition = %follow_up.id,
                "Follow-up transition of aborted work item dropped"
            );
        }
        Ok(())
    }
}

fn publish(inst: &ProcessInstance, ctx: &mut ExecutionContext<'_>, record: &TransitionRecord) {
    ctx.uow.publish(ProcessEvent::WorkItemTransitioned {
        instance_id: inst.id,
        work_item_id: record.work_item_id,
        transition: record.transition.clone(),
        from: record.from.to_string(),
        to: record.to.to_string(),
        identity: record.identity.clone(),
    });
}

/// Apply one lifecycle transition. Illegal or unauthorized transitions fail
/// without touching the item; the rest of the work (handler callbacks, node
/// completion) is queued on the agenda.
pub(crate) fn transition(
    inst: &mut ProcessInstance,
    ctx: &mut ExecutionContext<'_>,
    work_item_id: WorkItemId,
    transition: Transition,
) -> ProcessResult<TransitionRecord> {
    let not_found = ProcessError::WorkItemNotFound {
        instance_id: inst.id,
        work_item_id,
    };
    let work_type = inst
        .work_items
        .get(&work_item_id)
        .map(|wi| wi.work_type.clone())
        .ok_or(not_found)?;
    let lifecycle = ctx.env.handlers.get(&work_type)?.lifecycle();
    let work_item = inst
        .work_items
        .get_mut(&work_item_id)
        .ok_or(ProcessError::WorkItemNotFound {
            instance_id: inst.id,
            work_item_id,
        })?;
    let record = lifecycle.transition_to_phase(work_item, &transition)?;
    publish(inst, ctx, &record);
    inst.updated_at = ctx.now;
    inst.push(AgendaItem::WorkItemSettled {
        record: record.clone(),
        transition,
    });
    Ok(record)
}

/// Handler callback for the phase just entered; on a terminal phase, map
/// results and complete the node instance.
pub(crate) fn settle(
    inst: &mut ProcessInstance,
    ctx: &mut ExecutionContext<'_>,
    record: TransitionRecord,
    transition: Transition,
) -> ProcessResult<()> {
    let Some(work_item) = inst.work_items.get(&record.work_item_id).cloned() else {
        return Ok(());
    };
    let handler = ctx.env.handlers.get(&work_item.work_type)?;
    let follow_up = match record.to {
        WorkItemPhase::Activated => handler.activate(&work_item, &transition),
        WorkItemPhase::Completed => handler.complete(&work_item, &transition),
        WorkItemPhase::Aborted => handler.abort(&work_item, &transition),
        _ => None,
    };

    if !record.terminal {
        if let Some(next) = follow_up {
            inst.push(AgendaItem::WorkItemTransition {
                work_item_id: work_item.id,
                transition: next,
            });
        }
        return Ok(());
    }

    inst.work_items.remove(&work_item.id);
    tracing::info!(
        instance_id = %inst.id,
        work_item_id = %work_item.id,
        phase = %record.to,
        "Work item finished"
    );
    if inst.node_instance(work_item.node_instance_id).is_none() {
        return Ok(());
    }
    if record.to == WorkItemPhase::Completed {
        let definition = inst.definition.clone();
        let node = definition.require_node(work_item.node_id)?;
        if let NodeKind::WorkItem { outputs, .. } = &node.kind {
            for mapping in outputs {
                if let Some(value) = work_item.results.get(&mapping.source) {
                    inst.set_variable(ctx, &mapping.target, value.clone())?;
                }
            }
        }
    }
    inst.leave(ctx, work_item.node_instance_id, true)?;
    Ok(())
}
