use crate::definition::{EdgeType, GatewayKind, NodeKind, ProcessDefinition};
use crate::types::NodeId;
use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn push(errors: &mut Vec<ValidationError>, rule: &str, message: String) {
    errors.push(ValidationError {
        rule: rule.to_string(),
        message,
    });
}

/// Validate a process definition graph. Returns all errors found.
pub fn validate(def: &ProcessDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // D1: Node ids must be unique
    let mut seen = HashSet::new();
    for node in &def.nodes {
        if !seen.insert(node.id) {
            push(&mut errors, "D1", format!("Duplicate node id: {}", node.id));
        }
    }

    // D2: Connections reference existing nodes
    for conn in &def.connections {
        for (end, id) in [("from", conn.from), ("to", conn.to)] {
            if !seen.contains(&id) {
                push(
                    &mut errors,
                    "D2",
                    format!("Connection {} -> {}: unknown '{end}' node {id}", conn.from, conn.to),
                );
            }
        }
    }

    // D3 + D4: At least one Start and one End
    if def.start_nodes().next().is_none() {
        push(&mut errors, "D3", "No Start node found".to_string());
    }
    if !def.nodes.iter().any(|n| matches!(n.kind, NodeKind::End { .. })) {
        push(&mut errors, "D4", "No End node found".to_string());
    }

    let mut outgoing: HashMap<NodeId, usize> = HashMap::new();
    let mut incoming: HashMap<NodeId, usize> = HashMap::new();
    let mut defaults: HashMap<NodeId, usize> = HashMap::new();
    for conn in def.connections.iter().filter(|c| c.edge_type == EdgeType::Normal) {
        *outgoing.entry(conn.from).or_default() += 1;
        *incoming.entry(conn.to).or_default() += 1;
        if conn.is_default {
            *defaults.entry(conn.from).or_default() += 1;
        }
    }

    for node in &def.nodes {
        let outs = outgoing.get(&node.id).copied().unwrap_or(0);
        let ins = incoming.get(&node.id).copied().unwrap_or(0);
        match &node.kind {
            // D5: Default edges only on XOR/OR splits, at most one
            NodeKind::Split { gateway } => {
                let n = defaults.get(&node.id).copied().unwrap_or(0);
                if n > 1 {
                    push(
                        &mut errors,
                        "D5",
                        format!("Split {} has {n} default connections", node.id),
                    );
                }
                if n > 0 && *gateway == GatewayKind::And {
                    push(
                        &mut errors,
                        "D5",
                        format!("AND split {} cannot have a default connection", node.id),
                    );
                }
                // D7: Splits need outgoing connections
                if outs == 0 {
                    let message = format!("Split {} has no outgoing connections", node.id);
                    push(&mut errors, "D7", message);
                }
            }
            NodeKind::Join { .. } => {
                if ins == 0 {
                    let message = format!("Join {} has no incoming connections", node.id);
                    push(&mut errors, "D7", message);
                }
            }
            // D6: Boundary must attach to an activity
            NodeKind::Boundary { attached_to, .. } => match def.node(*attached_to) {
                None => push(
                    &mut errors,
                    "D6",
                    format!("Boundary {} attached to unknown node {attached_to}", node.id),
                ),
                Some(host)
                    if matches!(
                        host.kind,
                        NodeKind::Start { .. }
                            | NodeKind::End { .. }
                            | NodeKind::Boundary { .. }
                            | NodeKind::Split { .. }
                            | NodeKind::Join { .. }
                    ) =>
                {
                    push(
                        &mut errors,
                        "D6",
                        format!(
                            "Boundary {} cannot attach to {} node {attached_to}",
                            node.id,
                            host.kind.type_name()
                        ),
                    )
                }
                Some(_) => {}
            },
            // D8: Start nodes have no incoming connections
            NodeKind::Start { .. } if ins > 0 => {
                push(&mut errors, "D8", format!("Start {} has incoming connections", node.id));
            }
            _ => {}
        }
        if defaults.contains_key(&node.id) && !matches!(node.kind, NodeKind::Split { .. }) {
            push(
                &mut errors,
                "D5",
                format!("Node {} is not a split but has a default connection", node.id),
            );
        }
    }

    // D9: Every node reachable from a Start node
    let mut graph = DiGraph::<NodeId, ()>::new();
    let index: HashMap<NodeId, _> = def
        .nodes
        .iter()
        .map(|n| (n.id, graph.add_node(n.id)))
        .collect();
    for conn in &def.connections {
        if let (Some(a), Some(b)) = (index.get(&conn.from), index.get(&conn.to)) {
            graph.add_edge(*a, *b, ());
        }
    }
    let mut reached = HashSet::new();
    for start in def.start_nodes() {
        if let Some(&root) = index.get(&start.id) {
            let mut dfs = Dfs::new(&graph, root);
            while let Some(nx) = dfs.next(&graph) {
                reached.insert(graph[nx]);
            }
        }
    }
    for node in &def.nodes {
        if !reached.contains(&node.id) {
            push(
                &mut errors,
                "D9",
                format!("Node {} ('{}') is unreachable from any Start", node.id, node.name),
            );
        }
    }

    // D10: Variable names unique
    let mut names = HashSet::new();
    for var in &def.variables {
        if !names.insert(var.name.as_str()) {
            push(&mut errors, "D10", format!("Duplicate variable: {}", var.name));
        }
    }

    errors
}
