//! Process instance: variables, active node instances and the agenda that
//! drives traversal.
//!
//! All mutation happens inside one operation at a time. Work is modelled as an
//! agenda (a stack, so traversal is depth-first); every step may push more
//! items. Side effects leave through the `UnitOfWork` in the execution
//! context and are flushed by the runtime afterwards.

use crate::config::EngineConfig;
use crate::definition::{DefinitionRegistry, Node, NodeKind, ProcessDefinition, StartTrigger};
use crate::error::{ProcessError, ProcessResult};
use crate::events::ProcessEvent;
use crate::expiration::{ExpirationClock, ExpirationTime};
use crate::jobs::{JobDescription, JobFire, JobTarget};
use crate::node::work_item;
use crate::node::{
    arm_boundary, behavior_for, fire_ready_inclusive_joins, resume_from_child, NodeInstance,
    NodeInstanceData,
};
use crate::signal::ListenerId;
use crate::types::*;
use crate::uow::UnitOfWork;
use crate::variables::VariableScope;
use crate::workitem::{Transition, TransitionRecord, WorkItem, WorkItemHandlers};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

// ── Execution context ──

/// Collaborators shared by every operation of one runtime.
pub(crate) struct Environment {
    pub(crate) config: EngineConfig,
    pub(crate) clock: ExpirationClock,
    pub(crate) handlers: Arc<WorkItemHandlers>,
    pub(crate) definitions: Arc<DefinitionRegistry>,
}

pub(crate) struct ExecutionContext<'a> {
    pub(crate) env: &'a Environment,
    pub(crate) uow: &'a mut UnitOfWork,
    pub(crate) now: DateTime<Utc>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(env: &'a Environment, uow: &'a mut UnitOfWork) -> Self {
        Self {
            env,
            uow,
            now: Utc::now(),
        }
    }
}

/// How a child instance ended, as seen by its parent.
#[derive(Clone, Debug, PartialEq)]
pub enum ChildOutcome {
    Completed(BTreeMap<String, Value>),
    Aborted,
}

#[derive(Clone, Debug)]
pub(crate) enum AgendaItem {
    Trigger {
        node_id: NodeId,
        from: Option<NodeId>,
        level: u32,
        /// Async continuation already taken; run inline.
        resumed: bool,
    },
    Deliver {
        event_type: String,
        payload: Value,
    },
    TimerFired(JobFire),
    WorkItemTransition {
        work_item_id: WorkItemId,
        transition: Transition,
    },
    /// Handler callbacks and node completion after a transition was applied.
    WorkItemSettled {
        record: TransitionRecord,
        transition: Transition,
    },
    ChildFinished {
        node_instance_id: NodeInstanceId,
        child_id: ProcessInstanceId,
        outcome: ChildOutcome,
    },
}

pub(crate) enum StartAt {
    /// Every none-start node (or every start node if there is none).
    Manual,
    /// One specific start node, e.g. a fired timer or signal start.
    Node {
        node_id: NodeId,
        payload: Option<Value>,
    },
}

#[derive(Clone, Copy, Debug)]
struct Cursor {
    node_id: NodeId,
    node_instance_id: Option<NodeInstanceId>,
    level: u32,
}

// ── Process instance ──

#[derive(Clone, Debug)]
pub struct ProcessInstance {
    pub(crate) id: ProcessInstanceId,
    pub(crate) process_id: String,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) definition_version: String,
    pub(crate) business_key: Option<String>,
    pub(crate) state: ProcessState,
    pub(crate) variables: VariableScope,
    pub(crate) node_instances: Vec<NodeInstance>,
    pub(crate) level_counter: u32,
    pub(crate) level_parents: HashMap<u32, u32>,
    /// Pending arrivals an exclusive join still has to swallow, per (join, level).
    pub(crate) xor_discards: HashMap<(NodeId, u32), u32>,
    pub(crate) work_items: BTreeMap<WorkItemId, WorkItem>,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) error: Option<ErrorInfo>,
    pub(crate) error_count: u32,
    /// Timer fires received while in `Error`, replayed on recovery.
    pub(crate) parked_fires: Vec<JobFire>,
    /// Signal manager registrations, one per awaited event type.
    pub(crate) listeners: HashMap<String, ListenerId>,
    agenda: Vec<AgendaItem>,
    cursor: Option<Cursor>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl ProcessInstance {
    pub(crate) fn new(
        definition: Arc<ProcessDefinition>,
        variables: BTreeMap<String, Value>,
        business_key: Option<String>,
    ) -> ProcessResult<Self> {
        let scope = VariableScope::initial(&definition.id, &definition.variables, variables)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            process_id: definition.id.clone(),
            definition_version: definition.version_hash(),
            definition,
            business_key,
            state: ProcessState::Pending,
            variables: scope,
            node_instances: Vec::new(),
            level_counter: 0,
            level_parents: HashMap::new(),
            xor_discards: HashMap::new(),
            work_items: BTreeMap::new(),
            parent: None,
            error: None,
            error_count: 0,
            parked_fires: Vec::new(),
            listeners: HashMap::new(),
            agenda: Vec::new(),
            cursor: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> ProcessInstanceId {
        self.id
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn definition_version(&self) -> &str {
        &self.definition_version
    }

    pub fn business_key(&self) -> Option<&str> {
        self.business_key.as_deref()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Variables without the ones tagged internal.
    pub fn variables(&self) -> BTreeMap<String, Value> {
        self.variables.exposed(&self.definition.variables)
    }

    pub fn node_instances(&self) -> &[NodeInstance] {
        &self.node_instances
    }

    /// Node ids of the active node instances, boundaries excluded.
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.node_instances
            .iter()
            .filter(|ni| !matches!(ni.data, NodeInstanceData::Boundary { .. }))
            .map(|ni| ni.node_id)
            .collect()
    }

    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.work_items.values()
    }

    pub fn work_item(&self, id: WorkItemId) -> Option<&WorkItem> {
        self.work_items.get(&id)
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub(crate) fn node_instance(&self, id: NodeInstanceId) -> Option<&NodeInstance> {
        self.node_instances.iter().find(|ni| ni.id == id)
    }

    pub(crate) fn node_instance_mut(&mut self, id: NodeInstanceId) -> Option<&mut NodeInstance> {
        self.node_instances.iter_mut().find(|ni| ni.id == id)
    }

    pub(crate) fn require_node_instance(&self, id: NodeInstanceId) -> ProcessResult<&NodeInstance> {
        self.node_instance(id).ok_or(ProcessError::NodeInstanceNotFound {
            instance_id: self.id,
            node_instance_id: id,
        })
    }

    /// Event types this instance currently waits for.
    pub(crate) fn awaited_events(&self) -> BTreeSet<String> {
        self.node_instances
            .iter()
            .filter_map(|ni| ni.data.awaited_event().map(String::from))
            .collect()
    }

    pub(crate) fn push(&mut self, item: AgendaItem) {
        self.agenda.push(item);
    }

    pub(crate) fn agenda(&self) -> &[AgendaItem] {
        &self.agenda
    }

    pub(crate) fn clear_agenda(&mut self) {
        self.agenda.clear();
    }

    // ── State ──

    pub(crate) fn set_state(&mut self, ctx: &mut ExecutionContext<'_>, to: ProcessState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.updated_at = ctx.now;
        tracing::info!(
            instance_id = %self.id,
            process_id = %self.process_id,
            from = %from,
            to = %to,
            "Process instance state changed"
        );
        ctx.uow.publish(ProcessEvent::InstanceStateChanged {
            instance_id: self.id,
            process_id: self.process_id.clone(),
            business_key: self.business_key.clone(),
            from: Some(from),
            to,
            at: ctx.now,
        });
    }

    /// Event for a freshly created instance.
    pub(crate) fn created_event(&self) -> ProcessEvent {
        ProcessEvent::InstanceStateChanged {
            instance_id: self.id,
            process_id: self.process_id.clone(),
            business_key: self.business_key.clone(),
            from: None,
            to: self.state,
            at: self.created_at,
        }
    }

    /// `Error` → `Active` ahead of a retrigger. Fires parked meanwhile go
    /// back on the agenda.
    pub(crate) fn recover(&mut self, ctx: &mut ExecutionContext<'_>) {
        if self.state == ProcessState::Error {
            self.error = None;
            self.set_state(ctx, ProcessState::Active);
        }
        for fire in std::mem::take(&mut self.parked_fires).into_iter().rev() {
            self.push(AgendaItem::TimerFired(fire));
        }
    }

    /// Keep a timer fire that arrived while in `Error`.
    pub(crate) fn park_fire(&mut self, fire: JobFire) {
        tracing::info!(
            instance_id = %self.id,
            job_id = %fire.job_id,
            "Timer fire parked until recovery"
        );
        self.parked_fires.push(fire);
    }

    // ── Variables ──

    pub(crate) fn set_variable(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        name: &str,
        value: Value,
    ) -> ProcessResult<()> {
        let change = self
            .variables
            .set(&self.process_id, &self.definition.variables, name, value)?;
        if let Some(change) = change {
            ctx.uow.publish(ProcessEvent::VariableChanged {
                instance_id: self.id,
                name: change.name,
                old: change.old,
                new: change.new,
            });
        }
        Ok(())
    }

    /// External update; nothing is applied if any entry is rejected.
    pub(crate) fn update_variables(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        updates: BTreeMap<String, Value>,
    ) -> ProcessResult<()> {
        let started = self.state != ProcessState::Pending;
        let changes = self.variables.update(
            &self.process_id,
            &self.definition.variables,
            started,
            updates,
        )?;
        self.updated_at = ctx.now;
        for change in changes {
            tracing::debug!(instance_id = %self.id, variable = %change.name, "Variable updated");
            ctx.uow.publish(ProcessEvent::VariableChanged {
                instance_id: self.id,
                name: change.name,
                old: change.old,
                new: change.new,
            });
        }
        Ok(())
    }

    // ── Lifecycle ──

    /// `Pending` → `Active`, then run from the selected start node(s).
    pub(crate) fn start(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        at: StartAt,
    ) -> ProcessResult<()> {
        if self.state != ProcessState::Pending {
            return Err(ProcessError::IllegalTransition {
                subject: format!("process instance {}", self.id),
                transition: "start".to_string(),
                phase: self.state.to_string(),
            });
        }
        self.variables
            .check_required(&self.process_id, &self.definition.variables)?;
        self.set_state(ctx, ProcessState::Active);

        match at {
            StartAt::Manual => {
                for node_id in self.manual_start_nodes().into_iter().rev() {
                    self.push(AgendaItem::Trigger {
                        node_id,
                        from: None,
                        level: 0,
                        resumed: false,
                    });
                }
            }
            StartAt::Node { node_id, payload } => {
                if let Err(e) = self.start_from(ctx, node_id, payload) {
                    return Err(self.fail(ctx, e));
                }
            }
        }
        self.execute(ctx)
    }

    fn manual_start_nodes(&self) -> Vec<NodeId> {
        let plain: Vec<NodeId> = self
            .definition
            .start_nodes()
            .filter(|n| matches!(n.kind, NodeKind::Start { trigger: StartTrigger::None }))
            .map(|n| n.id)
            .collect();
        if !plain.is_empty() {
            return plain;
        }
        self.definition.start_nodes().map(|n| n.id).collect()
    }

    /// Event-triggered start: the start node is passed, not waited on.
    fn start_from(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        node_id: NodeId,
        payload: Option<Value>,
    ) -> ProcessResult<()> {
        let definition = self.definition.clone();
        let node = definition.require_node(node_id)?;
        self.cursor = Some(Cursor {
            node_id,
            node_instance_id: None,
            level: 0,
        });
        if let (
            NodeKind::Start {
                trigger: StartTrigger::Signal { variable: Some(variable), .. },
            },
            Some(payload),
        ) = (&node.kind, payload)
        {
            self.set_variable(ctx, variable, payload)?;
        }
        self.pass(ctx, node);
        self.take_outgoing(node_id, 0);
        Ok(())
    }

    /// Cancel everything and move to `Aborted`.
    pub(crate) fn abort(&mut self, ctx: &mut ExecutionContext<'_>) {
        let ids: Vec<NodeInstanceId> = self.node_instances.iter().rev().map(|ni| ni.id).collect();
        for id in ids {
            if let Err(e) = self.cancel_node_instance(ctx, id) {
                tracing::warn!(
                    instance_id = %self.id,
                    node_instance_id = %id,
                    error = %e,
                    "Cancel during abort failed"
                );
            }
        }
        self.agenda.clear();
        self.cursor = None;
        self.set_state(ctx, ProcessState::Aborted);
        if let Some(parent) = &self.parent {
            ctx.uow.resume_parent(
                parent.instance_id,
                parent.node_instance_id,
                self.id,
                ChildOutcome::Aborted,
            );
        }
    }

    // ── Agenda ──

    /// Run the agenda to quiescence. A failure moves the instance to `Error`.
    pub(crate) fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> ProcessResult<()> {
        match self.run(ctx) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(ctx, e)),
        }
    }

    fn run(&mut self, ctx: &mut ExecutionContext<'_>) -> ProcessResult<()> {
        let limit = ctx.env.config.max_traversal_steps;
        let mut steps = 0usize;
        loop {
            while let Some(item) = self.agenda.pop() {
                steps += 1;
                if steps > limit {
                    return Err(ProcessError::TraversalLimit {
                        instance_id: self.id,
                        steps: limit,
                    });
                }
                self.process(ctx, item)?;
            }
            self.cursor = None;
            if self.state != ProcessState::Active || !fire_ready_inclusive_joins(self, ctx)? {
                break;
            }
        }
        self.check_completion(ctx)
    }

    fn process(&mut self, ctx: &mut ExecutionContext<'_>, item: AgendaItem) -> ProcessResult<()> {
        match item {
            AgendaItem::Trigger {
                node_id,
                from,
                level,
                resumed,
            } => self.trigger_node(ctx, node_id, from, level, resumed),
            AgendaItem::Deliver { event_type, payload } => self.deliver(ctx, &event_type, &payload),
            AgendaItem::TimerFired(fire) => self.timer_fired(ctx, &fire),
            AgendaItem::WorkItemTransition {
                work_item_id,
                transition,
            } => work_item::transition(self, ctx, work_item_id, transition).map(|_| ()),
            AgendaItem::WorkItemSettled { record, transition } => {
                work_item::settle(self, ctx, record, transition)
            }
            AgendaItem::ChildFinished {
                node_instance_id,
                child_id,
                outcome,
            } => resume_from_child(self, ctx, node_instance_id, child_id, outcome),
        }
    }

    fn trigger_node(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        node_id: NodeId,
        from: Option<NodeId>,
        level: u32,
        resumed: bool,
    ) -> ProcessResult<()> {
        let definition = self.definition.clone();
        let node = definition.require_node(node_id)?;
        self.cursor = Some(Cursor {
            node_id,
            node_instance_id: None,
            level,
        });
        if node.async_continuation && !resumed {
            return self.defer(ctx, node, from, level);
        }
        tracing::debug!(
            instance_id = %self.id,
            node_id,
            node = %node.name,
            kind = node.kind.type_name(),
            level,
            "Triggering node"
        );
        behavior_for(&node.kind).trigger(self, ctx, node, from, level)
    }

    /// Park the trigger behind a zero-delay job.
    fn defer(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        from: Option<NodeId>,
        level: u32,
    ) -> ProcessResult<()> {
        let ni_id = Uuid::now_v7();
        let job = JobDescription::for_node_instance(
            &self.process_id,
            self.id,
            ni_id,
            node.id,
            ExpirationTime::after_ms(0),
        );
        tracing::debug!(
            instance_id = %self.id,
            node_id = node.id,
            job_id = %job.job_id,
            "Async continuation"
        );
        self.node_instances.push(NodeInstance {
            id: ni_id,
            node_id: node.id,
            level,
            state: NodeInstanceState::Active,
            data: NodeInstanceData::Async {
                job_id: job.job_id,
                from,
            },
            triggered_at: ctx.now,
        });
        ctx.uow.schedule_job(job);
        Ok(())
    }

    fn deliver(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        event_type: &str,
        payload: &Value,
    ) -> ProcessResult<()> {
        let waiting: Vec<NodeInstanceId> = self
            .node_instances
            .iter()
            .filter(|ni| ni.data.awaited_event() == Some(event_type))
            .map(|ni| ni.id)
            .collect();
        if waiting.is_empty() {
            tracing::debug!(instance_id = %self.id, event_type, "No node waits for event");
        }
        let definition = self.definition.clone();
        for ni_id in waiting {
            // An interrupting boundary delivered earlier may have removed it.
            let Some(ni) = self.node_instance(ni_id) else {
                continue;
            };
            let node = definition.require_node(ni.node_id)?;
            self.cursor = Some(Cursor {
                node_id: ni.node_id,
                node_instance_id: Some(ni_id),
                level: ni.level,
            });
            behavior_for(&node.kind).signal(self, ctx, node, ni_id, event_type, payload)?;
        }
        Ok(())
    }

    fn timer_fired(&mut self, ctx: &mut ExecutionContext<'_>, fire: &JobFire) -> ProcessResult<()> {
        let JobTarget::ProcessInstance { node_instance_id, .. } = &fire.target else {
            return Ok(());
        };
        let Some(ni) = self.node_instance(*node_instance_id).cloned() else {
            tracing::debug!(
                instance_id = %self.id,
                job_id = %fire.job_id,
                "Timer fired for a node instance that is gone"
            );
            return Ok(());
        };
        if ni.data.job_id() != Some(fire.job_id) {
            tracing::debug!(
                instance_id = %self.id,
                job_id = %fire.job_id,
                "Stale timer fire ignored"
            );
            return Ok(());
        }
        if let NodeInstanceData::Async { from, .. } = ni.data {
            self.node_instances.retain(|n| n.id != ni.id);
            self.push(AgendaItem::Trigger {
                node_id: ni.node_id,
                from,
                level: ni.level,
                resumed: true,
            });
            return Ok(());
        }
        let definition = self.definition.clone();
        let node = definition.require_node(ni.node_id)?;
        self.cursor = Some(Cursor {
            node_id: ni.node_id,
            node_instance_id: Some(ni.id),
            level: ni.level,
        });
        behavior_for(&node.kind).timer_fired(self, ctx, node, ni.id, fire)
    }

    /// Complete once nothing is left to do.
    fn check_completion(&mut self, ctx: &mut ExecutionContext<'_>) -> ProcessResult<()> {
        if self.state != ProcessState::Active
            || !self.node_instances.is_empty()
            || !self.agenda.is_empty()
        {
            return Ok(());
        }
        self.variables
            .check_required(&self.process_id, &self.definition.variables)?;
        self.set_state(ctx, ProcessState::Completed);
        if let Some(parent) = &self.parent {
            ctx.uow.resume_parent(
                parent.instance_id,
                parent.node_instance_id,
                self.id,
                ChildOutcome::Completed(self.variables.as_map().clone()),
            );
        }
        Ok(())
    }

    /// Move to `Error`, keeping a node instance at the failure point so it can
    /// be retriggered.
    fn fail(&mut self, ctx: &mut ExecutionContext<'_>, err: ProcessError) -> ProcessError {
        // Fires not yet processed survive for the next recovery.
        for item in self.agenda.drain(..) {
            if let AgendaItem::TimerFired(fire) = item {
                self.parked_fires.push(fire);
            }
        }
        let cursor = self.cursor.take();
        let node_instance_id = match cursor {
            Some(c) => match c.node_instance_id.filter(|id| self.node_instance(*id).is_some()) {
                Some(id) => Some(id),
                None => {
                    let id = Uuid::now_v7();
                    self.node_instances.push(NodeInstance {
                        id,
                        node_id: c.node_id,
                        level: c.level,
                        state: NodeInstanceState::Active,
                        data: NodeInstanceData::Failed,
                        triggered_at: ctx.now,
                    });
                    Some(id)
                }
            },
            None => None,
        };
        tracing::error!(
            instance_id = %self.id,
            process_id = %self.process_id,
            node_id = ?cursor.map(|c| c.node_id),
            error = %err,
            "Process instance failed"
        );
        self.error = Some(ErrorInfo {
            node_id: cursor.map(|c| c.node_id),
            node_instance_id,
            message: err.to_string(),
        });
        self.error_count += 1;
        self.set_state(ctx, ProcessState::Error);
        err
    }

    // ── Node instance bookkeeping ──

    /// Register an active node instance and arm the boundaries of its node.
    pub(crate) fn enter(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        node: &Node,
        level: u32,
        id: NodeInstanceId,
        data: NodeInstanceData,
    ) -> ProcessResult<()> {
        self.node_instances.push(NodeInstance {
            id,
            node_id: node.id,
            level,
            state: NodeInstanceState::Active,
            data,
            triggered_at: ctx.now,
        });
        if let Some(c) = self.cursor.as_mut() {
            if c.node_id == node.id {
                c.node_instance_id = Some(id);
            }
        }
        ctx.uow.publish(ProcessEvent::NodeEntered {
            instance_id: self.id,
            node_id: node.id,
            node_instance_id: id,
            node_name: node.name.clone(),
        });
        self.arm_boundaries(ctx, node.id, id, level)
    }

    fn arm_boundaries(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        host_node: NodeId,
        host: NodeInstanceId,
        level: u32,
    ) -> ProcessResult<()> {
        let definition = self.definition.clone();
        for boundary in definition.boundaries_of(host_node) {
            let (id, data) = arm_boundary(self, ctx, boundary, host)?;
            self.node_instances.push(NodeInstance {
                id,
                node_id: boundary.id,
                level,
                state: NodeInstanceState::Active,
                data,
                triggered_at: ctx.now,
            });
            ctx.uow.publish(ProcessEvent::NodeEntered {
                instance_id: self.id,
                node_id: boundary.id,
                node_instance_id: id,
                node_name: boundary.name.clone(),
            });
        }
        Ok(())
    }

    fn disarm_boundaries(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        host: NodeInstanceId,
    ) -> ProcessResult<()> {
        let armed: Vec<NodeInstanceId> = self
            .node_instances
            .iter()
            .filter(|ni| matches!(ni.data, NodeInstanceData::Boundary { host: h, .. } if h == host))
            .map(|ni| ni.id)
            .collect();
        for id in armed {
            self.cancel_node_instance(ctx, id)?;
        }
        Ok(())
    }

    /// Enter and leave in one step, for nodes that never wait.
    pub(crate) fn pass(&mut self, ctx: &mut ExecutionContext<'_>, node: &Node) {
        let id = Uuid::now_v7();
        ctx.uow.publish(ProcessEvent::NodeEntered {
            instance_id: self.id,
            node_id: node.id,
            node_instance_id: id,
            node_name: node.name.clone(),
        });
        ctx.uow.publish(ProcessEvent::NodeLeft {
            instance_id: self.id,
            node_id: node.id,
            node_instance_id: id,
            canceled: false,
        });
    }

    /// Remove a finished node instance; optionally continue on its outgoing
    /// connections.
    pub(crate) fn leave(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        id: NodeInstanceId,
        continue_outgoing: bool,
    ) -> ProcessResult<Option<NodeInstance>> {
        let Some(pos) = self.node_instances.iter().position(|ni| ni.id == id) else {
            return Ok(None);
        };
        let mut ni = self.node_instances.remove(pos);
        ni.state = NodeInstanceState::Completed;
        self.disarm_boundaries(ctx, id)?;
        ctx.uow.publish(ProcessEvent::NodeLeft {
            instance_id: self.id,
            node_id: ni.node_id,
            node_instance_id: id,
            canceled: false,
        });
        if continue_outgoing {
            self.take_outgoing(ni.node_id, ni.level);
        }
        Ok(Some(ni))
    }

    /// Cancel and remove a node instance. `false` if it was already gone.
    pub(crate) fn cancel_node_instance(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        id: NodeInstanceId,
    ) -> ProcessResult<bool> {
        let Some(ni) = self.node_instance(id).cloned() else {
            return Ok(false);
        };
        match &ni.data {
            NodeInstanceData::Async { job_id, .. } => ctx.uow.cancel_job(*job_id),
            NodeInstanceData::Failed => {}
            _ => {
                let definition = self.definition.clone();
                let node = definition.require_node(ni.node_id)?;
                behavior_for(&node.kind).cancel(self, ctx, node, &ni)?;
            }
        }
        self.node_instances.retain(|n| n.id != id);
        self.disarm_boundaries(ctx, id)?;
        tracing::debug!(
            instance_id = %self.id,
            node_id = ni.node_id,
            node_instance_id = %id,
            "Node instance canceled"
        );
        ctx.uow.publish(ProcessEvent::NodeLeft {
            instance_id: self.id,
            node_id: ni.node_id,
            node_instance_id: id,
            canceled: true,
        });
        Ok(true)
    }

    /// Queue every normal outgoing connection of `node_id`, first by priority
    /// on top.
    pub(crate) fn take_outgoing(&mut self, node_id: NodeId, level: u32) {
        let targets: Vec<NodeId> = self.definition.outgoing(node_id).iter().map(|c| c.to).collect();
        self.push_targets(node_id, &targets, level);
    }

    pub(crate) fn push_targets(&mut self, from: NodeId, targets: &[NodeId], level: u32) {
        for to in targets.iter().rev() {
            self.push(AgendaItem::Trigger {
                node_id: *to,
                from: Some(from),
                level,
                resumed: false,
            });
        }
    }

    /// Fresh join scope below `parent`.
    pub(crate) fn new_level(&mut self, parent: u32) -> u32 {
        self.level_counter += 1;
        self.level_parents.insert(self.level_counter, parent);
        self.level_counter
    }

    pub(crate) fn parent_level(&self, level: u32) -> u32 {
        self.level_parents.get(&level).copied().unwrap_or(level)
    }
}
