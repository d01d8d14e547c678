//! Work item lifecycle: a per-handler phase graph.
//!
//! Each `LifeCyclePhase` is one named transition (`claim`, `complete`, ...)
//! leading into a target status. A transition is legal when the phase
//! accepts the work item's current status, and executes only after every
//! supplied policy agreed.

use super::policy::Policy;
use super::{WorkItem, WorkItemPhase, ABORT, ACTIVATE, CLAIM, COMPLETE, DELEGATE, RELEASE, SKIP};
use crate::error::{ProcessError, ProcessResult};
use crate::types::{Value, WorkItemId};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

// ── Transition ──

/// A requested transition: phase id, payload and the policies to enforce.
#[derive(Clone, Default)]
pub struct Transition {
    pub id: String,
    pub data: BTreeMap<String, Value>,
    pub policies: Vec<Arc<dyn Policy>>,
}

impl Transition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: BTreeMap::new(),
            policies: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: BTreeMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_policies(mut self, policies: Vec<Arc<dyn Policy>>) -> Self {
        self.policies.extend(policies);
        self
    }

    /// Identity of the first policy, if any.
    pub fn identity(&self) -> Option<&str> {
        self.policies.first().map(|p| p.identity())
    }
}

impl std::fmt::Debug for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("policies", &self.policies.len())
            .finish()
    }
}

/// Outcome of an applied transition, emitted as a lifecycle event.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionRecord {
    pub work_item_id: WorkItemId,
    pub transition: String,
    pub from: WorkItemPhase,
    pub to: WorkItemPhase,
    pub terminal: bool,
    pub identity: Option<String>,
}

// ── Phases ──

pub trait LifeCyclePhase: Send + Sync {
    /// Transition id that leads into this phase.
    fn id(&self) -> &str;

    /// Status the work item holds after the transition.
    fn status(&self) -> WorkItemPhase;

    fn is_terminating(&self) -> bool;

    fn can_transition(&self, from: &WorkItemPhase) -> bool;

    /// Side effect on the work item, run before the status changes.
    fn apply(&self, _work_item: &mut WorkItem, _transition: &Transition) -> ProcessResult<()> {
        Ok(())
    }
}

pub type PhaseCallback = Arc<dyn Fn(&mut WorkItem, &Transition) -> ProcessResult<()> + Send + Sync>;

/// Built-in side effects.
#[derive(Clone)]
pub enum PhaseEffect {
    None,
    /// `actual_owner` ← `data["ActorId"]` or the transition identity.
    ClaimOwner,
    ReleaseOwner,
    /// `actual_owner` ← `data["TargetUser"]`.
    Delegate,
    /// Merge `data` into `results`.
    StoreResults,
    Custom(PhaseCallback),
}

/// Table-driven phase.
pub struct Phase {
    id: String,
    status: WorkItemPhase,
    from: Vec<WorkItemPhase>,
    terminating: bool,
    effect: PhaseEffect,
}

impl Phase {
    pub fn new(id: impl Into<String>, from: Vec<WorkItemPhase>, status: WorkItemPhase) -> Self {
        Self {
            id: id.into(),
            status,
            from,
            terminating: false,
            effect: PhaseEffect::None,
        }
    }

    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    pub fn effect(mut self, effect: PhaseEffect) -> Self {
        self.effect = effect;
        self
    }
}

impl LifeCyclePhase for Phase {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> WorkItemPhase {
        self.status.clone()
    }

    fn is_terminating(&self) -> bool {
        self.terminating
    }

    fn can_transition(&self, from: &WorkItemPhase) -> bool {
        self.from.contains(from)
    }

    fn apply(&self, work_item: &mut WorkItem, transition: &Transition) -> ProcessResult<()> {
        match &self.effect {
            PhaseEffect::None => {}
            PhaseEffect::ClaimOwner => {
                let owner = transition
                    .data
                    .get(super::PARAM_ACTOR_ID)
                    .and_then(Value::as_str)
                    .or_else(|| transition.identity());
                work_item.actual_owner = owner.map(String::from);
            }
            PhaseEffect::ReleaseOwner => work_item.actual_owner = None,
            PhaseEffect::Delegate => {
                if let Some(target) = transition.data.get("TargetUser").and_then(Value::as_str) {
                    work_item.actual_owner = Some(target.to_string());
                    if !work_item.potential_users.iter().any(|u| u == target) {
                        work_item.potential_users.push(target.to_string());
                    }
                }
            }
            PhaseEffect::StoreResults => {
                work_item
                    .results
                    .extend(transition.data.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            PhaseEffect::Custom(callback) => callback(work_item, transition)?,
        }
        Ok(())
    }
}

// ── LifeCycle ──

enum HookPoint {
    Enter,
    Exit,
}

struct Hook {
    status: WorkItemPhase,
    point: HookPoint,
    callback: PhaseCallback,
}

pub struct LifeCycle {
    name: String,
    phases: Vec<Arc<dyn LifeCyclePhase>>,
    hooks: Vec<Hook>,
}

impl LifeCycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn phase(mut self, phase: impl LifeCyclePhase + 'static) -> Self {
        self.phases.push(Arc::new(phase));
        self
    }

    /// Runs after a work item enters `status`.
    pub fn on_enter(mut self, status: WorkItemPhase, callback: PhaseCallback) -> Self {
        self.hooks.push(Hook {
            status,
            point: HookPoint::Enter,
            callback,
        });
        self
    }

    /// Runs before a work item leaves `status`.
    pub fn on_exit(mut self, status: WorkItemPhase, callback: PhaseCallback) -> Self {
        self.hooks.push(Hook {
            status,
            point: HookPoint::Exit,
            callback,
        });
        self
    }

    /// activate, complete, abort.
    pub fn default_lifecycle() -> Self {
        use WorkItemPhase::*;
        Self::new("default")
            .phase(Phase::new(ACTIVATE, vec![Initialized], Activated))
            .phase(
                Phase::new(COMPLETE, vec![Activated], Completed)
                    .terminating()
                    .effect(PhaseEffect::StoreResults),
            )
            .phase(Phase::new(ABORT, vec![Initialized, Activated], Aborted).terminating())
    }

    /// Adds claim, release, delegate and skip; `complete` requires a claim.
    pub fn human_task() -> Self {
        use WorkItemPhase::*;
        Self::new("human-task")
            .phase(Phase::new(ACTIVATE, vec![Initialized], Activated))
            .phase(Phase::new(CLAIM, vec![Activated], Reserved).effect(PhaseEffect::ClaimOwner))
            .phase(Phase::new(RELEASE, vec![Reserved], Activated).effect(PhaseEffect::ReleaseOwner))
            .phase(
                Phase::new(DELEGATE, vec![Activated, Reserved], Reserved)
                    .effect(PhaseEffect::Delegate),
            )
            .phase(
                Phase::new(COMPLETE, vec![Reserved], Completed)
                    .terminating()
                    .effect(PhaseEffect::StoreResults),
            )
            .phase(
                Phase::new(SKIP, vec![Activated, Reserved], Custom("Skipped".into()))
                    .terminating(),
            )
            .phase(Phase::new(ABORT, vec![Initialized, Activated, Reserved], Aborted).terminating())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase_by_id(&self, id: &str) -> Option<&Arc<dyn LifeCyclePhase>> {
        self.phases.iter().find(|p| p.id() == id)
    }

    pub fn is_terminal(&self, status: &WorkItemPhase) -> bool {
        self.phases
            .iter()
            .any(|p| p.is_terminating() && &p.status() == status)
    }

    /// Transitions legal from `status`.
    pub fn allowed_transitions(&self, status: &WorkItemPhase) -> Vec<&str> {
        self.phases
            .iter()
            .filter(|p| p.can_transition(status))
            .map(|p| p.id())
            .collect()
    }

    fn legal_phase(&self, work_item_id: WorkItemId, transition_id: &str, current: &WorkItemPhase)
        -> ProcessResult<&Arc<dyn LifeCyclePhase>> {
        match self.phase_by_id(transition_id) {
            Some(phase) if phase.can_transition(current) => Ok(phase),
            _ => Err(ProcessError::IllegalTransition {
                subject: format!("work item {work_item_id}"),
                transition: transition_id.to_string(),
                phase: current.to_string(),
            }),
        }
    }

    /// Build a transition after checking it is legal from `current`.
    pub fn new_transition(
        &self,
        work_item_id: WorkItemId,
        transition_id: &str,
        current: &WorkItemPhase,
        data: BTreeMap<String, Value>,
        policies: Vec<Arc<dyn Policy>>,
    ) -> ProcessResult<Transition> {
        self.legal_phase(work_item_id, transition_id, current)?;
        Ok(Transition::new(transition_id)
            .with_data(data)
            .with_policies(policies))
    }

    /// Apply `transition`. On any error the work item is left untouched.
    pub fn transition_to_phase(
        &self,
        work_item: &mut WorkItem,
        transition: &Transition,
    ) -> ProcessResult<TransitionRecord> {
        let phase = self.legal_phase(work_item.id, &transition.id, &work_item.phase)?;
        for policy in &transition.policies {
            policy.enforce(work_item, &transition.id)?;
        }

        let mut updated = work_item.clone();
        let from = updated.phase.clone();
        let to = phase.status();
        let exiting = |h: &&Hook| matches!(h.point, HookPoint::Exit) && h.status == from;
        for hook in self.hooks.iter().filter(exiting) {
            (hook.callback)(&mut updated, transition)?;
        }
        phase.apply(&mut updated, transition)?;
        updated.phase = to.clone();
        updated.updated_at = Utc::now();
        let entering = |h: &&Hook| matches!(h.point, HookPoint::Enter) && h.status == to;
        for hook in self.hooks.iter().filter(entering) {
            (hook.callback)(&mut updated, transition)?;
        }
        *work_item = updated;

        tracing::debug!(
            work_item_id = %work_item.id,
            transition = %transition.id,
            from = %from,
            to = %to,
            "Work item transition"
        );
        Ok(TransitionRecord {
            work_item_id: work_item.id,
            transition: transition.id.clone(),
            from,
            to,
            terminal: phase.is_terminating(),
            identity: transition.identity().map(String::from),
        })
    }
}

impl std::fmt::Debug for LifeCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifeCycle")
            .field("name", &self.name)
            .field(
                "phases",
                &self.phases.iter().map(|p| p.id().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
