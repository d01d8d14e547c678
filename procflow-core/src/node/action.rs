use super::NodeBehavior;
use crate::definition::{Assignment, Node, NodeKind};
use crate::error::ProcessResult;
use crate::instance::{ExecutionContext, ProcessInstance};
use crate::types::{NodeId, Value};

/// Script-free task: applies its assignments and moves on.
pub(crate) struct ActionNode;

impl NodeBehavior for ActionNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        if let NodeKind::Action { assignments } = &node.kind {
            for assignment in assignments {
                match assignment {
                    Assignment::Set { variable, value } => {
                        inst.set_variable(ctx, variable, value.clone())?;
                    }
                    Assignment::Copy { variable, from } => {
                        let value = inst.variables.get(from).cloned().unwrap_or(Value::Null);
                        inst.set_variable(ctx, variable, value)?;
                    }
                }
            }
        }
        inst.pass(ctx, node);
        inst.take_outgoing(node.id, level);
        Ok(())
    }
}
