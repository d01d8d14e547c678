use super::{NodeBehavior, NodeInstance, NodeInstanceData};
use crate::definition::{Node, NodeKind};
use crate::error::ProcessResult;
use crate::instance::{ChildOutcome, ExecutionContext, ProcessInstance, StartAt};
use crate::types::{NodeId, NodeInstanceId, ParentLink, ProcessInstanceId, ProcessState};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Reusable sub-process: starts a child instance of another definition and,
/// if it waits, continues when the child completes or aborts.
pub(crate) struct SubProcessNode;

impl NodeBehavior for SubProcessNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let NodeKind::SubProcess {
            process_id,
            inputs,
            wait_for_completion,
            ..
        } = &node.kind
        else {
            return Ok(());
        };
        let definition = ctx.env.definitions.get(process_id)?;
        let mut variables = BTreeMap::new();
        for mapping in inputs {
            if let Some(value) = inst.variables.get(&mapping.source) {
                variables.insert(mapping.target.clone(), value.clone());
            }
        }

        let ni_id = Uuid::now_v7();
        let mut child = ProcessInstance::new(definition, variables, None)?;
        if *wait_for_completion {
            child.parent = Some(ParentLink {
                instance_id: inst.id,
                node_instance_id: ni_id,
            });
        }
        let child_id = child.id;
        ctx.uow.publish(child.created_event());
        match child.start(ctx, StartAt::Manual) {
            // Rejected before it ran: the parent fails with it.
            Err(e) if child.state == ProcessState::Pending => return Err(e),
            Err(e) => {
                tracing::warn!(
                    instance_id = %inst.id,
                    child_id = %child_id,
                    error = %e,
                    "Sub-process failed"
                );
            }
            Ok(()) => {}
        }
        tracing::info!(
            instance_id = %inst.id,
            node_id = node.id,
            child_id = %child_id,
            child_process = %process_id,
            state = %child.state,
            "Sub-process started"
        );
        ctx.uow.persist_create(child, true);

        if *wait_for_completion {
            inst.enter(ctx, node, level, ni_id, NodeInstanceData::SubProcess { child_id })
        } else {
            inst.pass(ctx, node);
            inst.take_outgoing(node.id, level);
            Ok(())
        }
    }

    fn cancel(
        &self,
        _inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        _node: &Node,
        node_instance: &NodeInstance,
    ) -> ProcessResult<()> {
        if let NodeInstanceData::SubProcess { child_id } = node_instance.data {
            ctx.uow.abort_instance(child_id);
        }
        Ok(())
    }
}

/// Continue a waiting sub-process node after its child finished.
pub(crate) fn resume_from_child(
    inst: &mut ProcessInstance,
    ctx: &mut ExecutionContext<'_>,
    node_instance_id: NodeInstanceId,
    child_id: ProcessInstanceId,
    outcome: ChildOutcome,
) -> ProcessResult<()> {
    let Some(ni) = inst.node_instance(node_instance_id) else {
        tracing::debug!(instance_id = %inst.id, child_id = %child_id, "Parent node instance gone");
        return Ok(());
    };
    if ni.data != (NodeInstanceData::SubProcess { child_id }) {
        return Ok(());
    }
    let node_id = ni.node_id;
    if let ChildOutcome::Completed(values) = &outcome {
        let definition = inst.definition.clone();
        if let NodeKind::SubProcess { outputs, .. } = &definition.require_node(node_id)?.kind {
            for mapping in outputs {
                if let Some(value) = values.get(&mapping.source) {
                    inst.set_variable(ctx, &mapping.target, value.clone())?;
                }
            }
        }
    }
    tracing::info!(
        instance_id = %inst.id,
        node_id,
        child_id = %child_id,
        aborted = matches!(outcome, ChildOutcome::Aborted),
        "Sub-process finished"
    );
    inst.leave(ctx, node_instance_id, true)?;
    Ok(())
}
