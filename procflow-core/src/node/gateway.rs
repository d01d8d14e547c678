//! Split and join gateways.
//!
//! Parallel and inclusive splits open a new level; the matching join
//! correlates arrivals on that level and continues on its parent level.
//! Exclusive gateways keep the level they were reached on.

use super::{NodeBehavior, NodeInstanceData};
use crate::definition::{Connection, GatewayKind, Node, NodeKind};
use crate::error::{ProcessError, ProcessResult};
use crate::instance::{AgendaItem, ExecutionContext, ProcessInstance};
use crate::types::{NodeId, NodeInstanceId};
use std::collections::BTreeMap;
use uuid::Uuid;

pub(crate) struct SplitNode;

fn guard_holds(inst: &ProcessInstance, conn: &Connection) -> bool {
    conn.constraint
        .as_ref()
        .map_or(true, |c| c.evaluate(inst.variables.as_map()))
}

impl NodeBehavior for SplitNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        _from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let NodeKind::Split { gateway } = &node.kind else {
            return Ok(());
        };
        let definition = inst.definition.clone();
        let outgoing = definition.outgoing(node.id);
        let default = outgoing.iter().find(|c| c.is_default).map(|c| c.to);
        let no_match = || ProcessError::NoMatchingEdge {
            process_id: definition.id.clone(),
            node_id: node.id,
        };

        let (targets, next_level) = match gateway {
            GatewayKind::And => {
                let targets: Vec<NodeId> = outgoing.iter().map(|c| c.to).collect();
                (targets, inst.new_level(level))
            }
            GatewayKind::Xor => {
                let chosen = outgoing
                    .iter()
                    .filter(|c| !c.is_default)
                    .find(|c| guard_holds(inst, c))
                    .map(|c| c.to)
                    .or(default)
                    .ok_or_else(no_match)?;
                (vec![chosen], level)
            }
            GatewayKind::Or => {
                let mut targets: Vec<NodeId> = outgoing
                    .iter()
                    .filter(|c| !c.is_default && guard_holds(inst, c))
                    .map(|c| c.to)
                    .collect();
                if targets.is_empty() {
                    targets.push(default.ok_or_else(no_match)?);
                }
                (targets, inst.new_level(level))
            }
        };
        tracing::debug!(
            instance_id = %inst.id,
            node_id = node.id,
            ?gateway,
            ?targets,
            "Split taken"
        );
        inst.pass(ctx, node);
        inst.push_targets(node.id, &targets, next_level);
        Ok(())
    }
}

pub(crate) struct JoinNode;

impl JoinNode {
    /// Tokens on `level` that may still arrive at `join`: waiting node
    /// instances and queued triggers that can reach it.
    fn pending_tokens(inst: &ProcessInstance, join: NodeId, level: u32) -> u32 {
        let definition = &inst.definition;
        let waiting = inst
            .node_instances
            .iter()
            .filter(|ni| {
                ni.level == level && ni.node_id != join && definition.can_reach(ni.node_id, join)
            })
            .count();
        let queued = inst
            .agenda()
            .iter()
            .filter(|item| {
                matches!(item, AgendaItem::Trigger { node_id, level: l, .. }
                    if *l == level && (*node_id == join || definition.can_reach(*node_id, join)))
            })
            .count();
        u32::try_from(waiting + queued).unwrap_or(u32::MAX)
    }

    fn exclusive(
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        level: u32,
    ) -> ProcessResult<()> {
        let key = (node.id, level);
        if let Some(remaining) = inst.xor_discards.get_mut(&key) {
            *remaining -= 1;
            if *remaining == 0 {
                inst.xor_discards.remove(&key);
            }
            tracing::debug!(
                instance_id = %inst.id,
                node_id = node.id,
                level,
                "Exclusive join discarded arrival"
            );
            return Ok(());
        }
        let incoming = u32::try_from(inst.definition.incoming(node.id).len()).unwrap_or(u32::MAX);
        let expected = Self::pending_tokens(inst, node.id, level).min(incoming.saturating_sub(1));
        if expected > 0 {
            inst.xor_discards.insert(key, expected);
        }
        inst.pass(ctx, node);
        inst.take_outgoing(node.id, level);
        Ok(())
    }
}

impl NodeBehavior for JoinNode {
    fn trigger(
        &self,
        inst: &mut ProcessInstance,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let NodeKind::Join { gateway } = &node.kind else {
            return Ok(());
        };
        if *gateway == GatewayKind::Xor {
            return Self::exclusive(inst, ctx, node, level);
        }

        let existing = inst
            .node_instances
            .iter()
            .find(|ni| ni.node_id == node.id && ni.level == level)
            .map(|ni| ni.id);
        let ni_id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::now_v7();
                let data = NodeInstanceData::Join {
                    arrivals: BTreeMap::new(),
                };
                inst.enter(ctx, node, level, id, data)?;
                id
            }
        };
        // One arrival per connection: a source may feed the join over
        // several parallel connections.
        let definition = inst.definition.clone();
        let incoming = definition.incoming(node.id);
        let capacity = incoming.iter().filter(|c| Some(c.from) == from).count().max(1);
        let instance_id = inst.id;
        let arrived = match inst.node_instance_mut(ni_id).map(|ni| &mut ni.data) {
            Some(NodeInstanceData::Join { arrivals }) => {
                let seen = arrivals.entry(from.unwrap_or(node.id)).or_insert(0);
                if (*seen as usize) < capacity {
                    *seen += 1;
                } else {
                    tracing::debug!(
                        instance_id = %instance_id,
                        node_id = node.id,
                        ?from,
                        "Duplicate join arrival ignored"
                    );
                }
                arrivals.values().map(|n| *n as usize).sum::<usize>()
            }
            _ => return Ok(()),
        };

        if *gateway == GatewayKind::And && arrived >= incoming.len() {
            fire_join(inst, ctx, ni_id)?;
        }
        // Inclusive joins are evaluated once the agenda is empty.
        Ok(())
    }
}

fn fire_join(
    inst: &mut ProcessInstance,
    ctx: &mut ExecutionContext<'_>,
    ni_id: NodeInstanceId,
) -> ProcessResult<()> {
    if let Some(ni) = inst.leave(ctx, ni_id, false)? {
        let level = inst.parent_level(ni.level);
        tracing::debug!(instance_id = %inst.id, node_id = ni.node_id, level, "Join fired");
        inst.take_outgoing(ni.node_id, level);
    }
    Ok(())
}

/// Fire the first waiting inclusive join that no other active node instance
/// can still reach. Returns whether one fired.
pub(crate) fn fire_ready_inclusive_joins(
    inst: &mut ProcessInstance,
    ctx: &mut ExecutionContext<'_>,
) -> ProcessResult<bool> {
    let definition = inst.definition.clone();
    let waiting: Vec<(NodeInstanceId, NodeId)> = inst
        .node_instances
        .iter()
        .filter(|ni| {
            matches!(
                definition.node(ni.node_id).map(|n| &n.kind),
                Some(NodeKind::Join { gateway: GatewayKind::Or })
            )
        })
        .map(|ni| (ni.id, ni.node_id))
        .collect();

    for (ni_id, join) in waiting {
        let blocked = inst
            .node_instances
            .iter()
            .any(|other| other.node_id != join && definition.can_reach(other.node_id, join));
        if !blocked {
            fire_join(inst, ctx, ni_id)?;
            return Ok(true);
        }
    }
    Ok(false)
}
