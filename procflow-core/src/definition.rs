//! Process definition: an immutable arena of nodes and connections.
//!
//! Nodes are addressed by `NodeId`; connections are id pairs. Definitions are
//! built once, validated, and shared read-only behind an `Arc` by every
//! instance of the process.

use crate::constraint::Constraint;
use crate::error::{ProcessError, ProcessResult};
use crate::types::{NodeId, Value};
use crate::validate::validate;
use crate::variables::VariableDeclaration;
use anyhow::anyhow;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, RwLock};

// ── Node kinds ──

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    And,
    Xor,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    /// One fire after a duration.
    Duration,
    /// Repeating: `R{n}/...` or a plain period.
    Cycle,
    /// One fire at an absolute instant.
    Date,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerDefinition {
    pub kind: TimerKind,
    /// May contain `#{variable}` placeholders.
    pub expression: String,
    /// Count the duration in business time.
    #[serde(default)]
    pub business_calendar: bool,
}

impl TimerDefinition {
    pub fn duration(expression: impl Into<String>) -> Self {
        Self {
            kind: TimerKind::Duration,
            expression: expression.into(),
            business_calendar: false,
        }
    }

    pub fn cycle(expression: impl Into<String>) -> Self {
        Self {
            kind: TimerKind::Cycle,
            expression: expression.into(),
            business_calendar: false,
        }
    }

    pub fn date(expression: impl Into<String>) -> Self {
        Self {
            kind: TimerKind::Date,
            expression: expression.into(),
            business_calendar: false,
        }
    }

    pub fn in_business_time(mut self) -> Self {
        self.business_calendar = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StartTrigger {
    None,
    Timer(TimerDefinition),
    /// Starts a new instance when the signal is broadcast; the payload is
    /// stored in `variable` if given.
    Signal {
        event_type: String,
        variable: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BoundaryTrigger {
    Timer(TimerDefinition),
    Signal {
        event_type: String,
        variable: Option<String>,
    },
}

/// Where a thrown signal is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalScope {
    /// Only the throwing instance, immediately.
    ProcessInstance,
    /// Every listener of the runtime, at the end of the operation.
    Default,
}

/// Copies one value between two variable maps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMapping {
    pub source: String,
    pub target: String,
}

impl DataMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Assignment {
    Set { variable: String, value: Value },
    Copy { variable: String, from: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Start {
        trigger: StartTrigger,
    },
    End {
        terminate: bool,
    },
    Split {
        gateway: GatewayKind,
    },
    Join {
        gateway: GatewayKind,
    },
    CatchEvent {
        event_type: String,
        variable: Option<String>,
    },
    ThrowEvent {
        event_type: String,
        scope: SignalScope,
        source: Option<String>,
    },
    Timer {
        timer: TimerDefinition,
    },
    WorkItem {
        work_type: String,
        parameters: BTreeMap<String, Value>,
        inputs: Vec<DataMapping>,
        outputs: Vec<DataMapping>,
    },
    SubProcess {
        process_id: String,
        inputs: Vec<DataMapping>,
        outputs: Vec<DataMapping>,
        wait_for_completion: bool,
    },
    Boundary {
        attached_to: NodeId,
        trigger: BoundaryTrigger,
        cancel_activity: bool,
    },
    Action {
        assignments: Vec<Assignment>,
    },
}

impl NodeKind {
    pub fn start() -> Self {
        Self::Start {
            trigger: StartTrigger::None,
        }
    }

    pub fn end() -> Self {
        Self::End { terminate: false }
    }

    pub fn terminate() -> Self {
        Self::End { terminate: true }
    }

    pub fn catch_event(event_type: impl Into<String>) -> Self {
        Self::CatchEvent {
            event_type: event_type.into(),
            variable: None,
        }
    }

    pub fn timer(timer: TimerDefinition) -> Self {
        Self::Timer { timer }
    }

    pub fn work_item(work_type: impl Into<String>) -> Self {
        Self::WorkItem {
            work_type: work_type.into(),
            parameters: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn set(variable: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Action {
            assignments: vec![Assignment::Set {
                variable: variable.into(),
                value: value.into(),
            }],
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::End { .. } => "end",
            Self::Split { .. } => "split",
            Self::Join { .. } => "join",
            Self::CatchEvent { .. } => "catch_event",
            Self::ThrowEvent { .. } => "throw_event",
            Self::Timer { .. } => "timer",
            Self::WorkItem { .. } => "work_item",
            Self::SubProcess { .. } => "sub_process",
            Self::Boundary { .. } => "boundary",
            Self::Action { .. } => "action",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// Run the node from a zero-delay job instead of inline.
    #[serde(default)]
    pub async_continuation: bool,
}

// ── Connections ──

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Normal,
    /// Host node → attached boundary node. Never traversed by completion.
    Boundary,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: NodeId,
    pub to: NodeId,
    /// Lower fires first at XOR/OR splits.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub constraint: Option<Constraint>,
    pub edge_type: EdgeType,
}

impl Connection {
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            priority: 0,
            is_default: false,
            constraint: None,
            edge_type: EdgeType::Normal,
        }
    }
}

// ── Definition ──

#[derive(Debug)]
struct GraphIndex {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(skip)]
    graph: OnceLock<Arc<GraphIndex>>,
}

impl ProcessDefinition {
    pub fn builder(id: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn require_node(&self, id: NodeId) -> ProcessResult<&Node> {
        self.node(id).ok_or_else(|| ProcessError::NodeNotFound {
            process_id: self.id.clone(),
            node_id: id,
        })
    }

    /// Normal outgoing connections in priority order (stable for ties).
    pub fn outgoing(&self, id: NodeId) -> Vec<&Connection> {
        let mut out: Vec<&Connection> = self
            .connections
            .iter()
            .filter(|c| c.from == id && c.edge_type == EdgeType::Normal)
            .collect();
        out.sort_by_key(|c| c.priority);
        out
    }

    pub fn incoming(&self, id: NodeId) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.to == id && c.edge_type == EdgeType::Normal)
            .collect()
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start { .. }))
    }

    /// Boundary nodes attached to `host`.
    pub fn boundaries_of(&self, host: NodeId) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| {
            matches!(n.kind, NodeKind::Boundary { attached_to, .. } if attached_to == host)
        })
    }

    /// True if a path of connections leads from `from` to `to`.
    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        let idx = self.graph_index();
        match (idx.index.get(&from), idx.index.get(&to)) {
            (Some(a), Some(b)) => has_path_connecting(&idx.graph, *a, *b, None),
            _ => false,
        }
    }

    fn graph_index(&self) -> &GraphIndex {
        self.graph.get_or_init(|| {
            let mut graph = DiGraph::new();
            let mut index = HashMap::new();
            for node in &self.nodes {
                index.insert(node.id, graph.add_node(node.id));
            }
            for conn in &self.connections {
                if let (Some(a), Some(b)) = (index.get(&conn.from), index.get(&conn.to)) {
                    graph.add_edge(*a, *b, ());
                }
            }
            Arc::new(GraphIndex { graph, index })
        })
    }

    /// SHA-256 of the canonical JSON form, hex encoded.
    pub fn version_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

// ── Builder ──

pub struct ProcessDefinitionBuilder {
    id: String,
    name: Option<String>,
    version: String,
    nodes: Vec<Node>,
    connections: Vec<Connection>,
    variables: Vec<VariableDeclaration>,
}

impl ProcessDefinitionBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            version: "1.0".to_string(),
            nodes: Vec::new(),
            connections: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn variable(mut self, decl: VariableDeclaration) -> Self {
        self.variables.push(decl);
        self
    }

    pub fn node(mut self, id: NodeId, name: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(Node {
            id,
            name: name.into(),
            kind,
            async_continuation: false,
        });
        self
    }

    pub fn async_node(mut self, id: NodeId, name: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(Node {
            id,
            name: name.into(),
            kind,
            async_continuation: true,
        });
        self
    }

    pub fn connect(mut self, from: NodeId, to: NodeId) -> Self {
        self.connections.push(Connection::new(from, to));
        self
    }

    pub fn connect_when(
        mut self,
        from: NodeId,
        to: NodeId,
        priority: u32,
        constraint: Constraint,
    ) -> Self {
        self.connections.push(Connection {
            priority,
            constraint: Some(constraint),
            ..Connection::new(from, to)
        });
        self
    }

    pub fn connect_default(mut self, from: NodeId, to: NodeId) -> Self {
        self.connections.push(Connection {
            priority: u32::MAX,
            is_default: true,
            ..Connection::new(from, to)
        });
        self
    }

    /// Validate and freeze. Every violation is reported in one error.
    pub fn build(mut self) -> ProcessResult<ProcessDefinition> {
        let boundary_edges: Vec<Connection> = self
            .nodes
            .iter()
            .filter_map(|n| match n.kind {
                NodeKind::Boundary { attached_to, .. } => Some(Connection {
                    edge_type: EdgeType::Boundary,
                    ..Connection::new(attached_to, n.id)
                }),
                _ => None,
            })
            .collect();
        self.connections.extend(boundary_edges);

        let def = ProcessDefinition {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            version: self.version,
            nodes: self.nodes,
            connections: self.connections,
            variables: self.variables,
            graph: OnceLock::new(),
        };
        let errors = validate(&def);
        if !errors.is_empty() {
            let msg = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ProcessError::InvalidDefinition(format!("{}: {msg}", def.id)));
        }
        Ok(def)
    }
}

// ── Registry ──

/// Loaded definitions by process id.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates again: definitions may arrive deserialized rather than built.
    pub fn register(&self, definition: ProcessDefinition) -> ProcessResult<Arc<ProcessDefinition>> {
        let errors = validate(&definition);
        if let Some(first) = errors.first() {
            return Err(ProcessError::InvalidDefinition(format!(
                "{}: {first} ({} violation(s))",
                definition.id,
                errors.len()
            )));
        }
        let definition = Arc::new(definition);
        let mut map = self
            .definitions
            .write()
            .map_err(|e| anyhow!("Lock: {}", e))?;
        tracing::info!(
            process_id = %definition.id,
            version = %definition.version,
            "Registered process definition"
        );
        map.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    pub fn get(&self, process_id: &str) -> ProcessResult<Arc<ProcessDefinition>> {
        let map = self.definitions.read().map_err(|e| anyhow!("Lock: {}", e))?;
        map.get(process_id)
            .cloned()
            .ok_or_else(|| ProcessError::ProcessNotFound(process_id.to_string()))
    }

    pub fn all(&self) -> ProcessResult<Vec<Arc<ProcessDefinition>>> {
        let map = self.definitions.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut defs: Vec<_> = map.values().cloned().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }
}
