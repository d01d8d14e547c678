//! Work items: externally fulfilled units of work and their lifecycle.

pub mod lifecycle;
pub mod policy;

pub use lifecycle::{LifeCycle, LifeCyclePhase, Phase, PhaseEffect, Transition, TransitionRecord};
pub use policy::{IdentityPolicy, IdentityProvider, Policy, StaticIdentity};

use crate::error::{ProcessError, ProcessResult};
use crate::types::{NodeId, NodeInstanceId, ProcessInstanceId, Value, WorkItemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

// ── Standard ids ──

pub const ACTIVATE: &str = "activate";
pub const CLAIM: &str = "claim";
pub const RELEASE: &str = "release";
pub const DELEGATE: &str = "delegate";
pub const SKIP: &str = "skip";
pub const COMPLETE: &str = "complete";
pub const ABORT: &str = "abort";

pub const PARAM_ACTOR_ID: &str = "ActorId";
pub const PARAM_GROUP_ID: &str = "GroupId";
pub const PARAM_EXCLUDED_OWNER_ID: &str = "ExcludedOwnerId";
pub const PARAM_ADMIN_ID: &str = "BusinessAdministratorId";
pub const PARAM_ADMIN_GROUP_ID: &str = "BusinessAdministratorGroupId";
pub const PARAM_TASK_NAME: &str = "TaskName";

// ── Phase ──

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemPhase {
    Initialized,
    Activated,
    Reserved,
    Completed,
    Aborted,
    /// Handler-specific phase.
    Custom(String),
}

impl std::fmt::Display for WorkItemPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::Activated => write!(f, "Activated"),
            Self::Reserved => write!(f, "Reserved"),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted => write!(f, "Aborted"),
            Self::Custom(name) => write!(f, "{name}"),
        }
    }
}

// ── WorkItem ──

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub process_instance_id: ProcessInstanceId,
    pub node_instance_id: NodeInstanceId,
    pub node_id: NodeId,
    pub name: String,
    pub work_type: String,
    pub phase: WorkItemPhase,
    pub parameters: BTreeMap<String, Value>,
    pub results: BTreeMap<String, Value>,
    pub actual_owner: Option<String>,
    pub potential_users: Vec<String>,
    pub potential_groups: Vec<String>,
    pub excluded_users: Vec<String>,
    pub admin_users: Vec<String>,
    pub admin_groups: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// New item in phase `Initialized`. Owner attributes come from the
    /// `ActorId`, `GroupId`, `ExcludedOwnerId`, `BusinessAdministratorId` and
    /// `BusinessAdministratorGroupId` parameters.
    pub fn new(
        process_instance_id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
        node_id: NodeId,
        work_type: &str,
        parameters: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        let name = parameters
            .get(PARAM_TASK_NAME)
            .and_then(Value::as_str)
            .unwrap_or(work_type)
            .to_string();
        Self {
            id: Uuid::now_v7(),
            process_instance_id,
            node_instance_id,
            node_id,
            name,
            work_type: work_type.to_string(),
            phase: WorkItemPhase::Initialized,
            potential_users: identities(&parameters, PARAM_ACTOR_ID),
            potential_groups: identities(&parameters, PARAM_GROUP_ID),
            excluded_users: identities(&parameters, PARAM_EXCLUDED_OWNER_ID),
            admin_users: identities(&parameters, PARAM_ADMIN_ID),
            admin_groups: identities(&parameters, PARAM_ADMIN_GROUP_ID),
            parameters,
            results: BTreeMap::new(),
            actual_owner: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Comma separated string or array of strings.
fn identities(parameters: &BTreeMap<String, Value>, key: &str) -> Vec<String> {
    match parameters.get(key) {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

// ── Handlers ──

/// Fulfils work items of one type. Callbacks run inside the owning
/// operation and must not block; each may return a follow-up transition
/// that is applied immediately (e.g. an automatic `complete`).
pub trait WorkItemHandler: Send + Sync {
    fn name(&self) -> &str;

    fn lifecycle(&self) -> Arc<LifeCycle>;

    fn activate(&self, _work_item: &WorkItem, _transition: &Transition) -> Option<Transition> {
        None
    }

    fn complete(&self, _work_item: &WorkItem, _transition: &Transition) -> Option<Transition> {
        None
    }

    fn abort(&self, _work_item: &WorkItem, _transition: &Transition) -> Option<Transition> {
        None
    }
}

/// Human tasks: claim/release/delegate/skip on top of complete and abort.
pub struct HumanTaskHandler {
    lifecycle: Arc<LifeCycle>,
}

impl HumanTaskHandler {
    pub const NAME: &'static str = "Human Task";

    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(LifeCycle::human_task()),
        }
    }
}

impl Default for HumanTaskHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkItemHandler for HumanTaskHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn lifecycle(&self) -> Arc<LifeCycle> {
        self.lifecycle.clone()
    }
}

type ActivateFn = dyn Fn(&WorkItem) -> Option<BTreeMap<String, Value>> + Send + Sync;

/// Default-lifecycle handler driven by a closure. When the closure returns
/// results on activation the item completes straight away; `None` leaves it
/// waiting for an external `complete`.
pub struct FnWorkItemHandler {
    name: String,
    lifecycle: Arc<LifeCycle>,
    on_activate: Box<ActivateFn>,
}

impl FnWorkItemHandler {
    pub fn new(
        name: impl Into<String>,
        on_activate: impl Fn(&WorkItem) -> Option<BTreeMap<String, Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            lifecycle: Arc::new(LifeCycle::default_lifecycle()),
            on_activate: Box::new(on_activate),
        }
    }

    /// Waits for an external `complete` or `abort`.
    pub fn external(name: impl Into<String>) -> Self {
        Self::new(name, |_| None)
    }
}

impl WorkItemHandler for FnWorkItemHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> Arc<LifeCycle> {
        self.lifecycle.clone()
    }

    fn activate(&self, work_item: &WorkItem, _transition: &Transition) -> Option<Transition> {
        (self.on_activate)(work_item).map(|results| Transition::new(COMPLETE).with_data(results))
    }
}

/// Handlers by work type.
#[derive(Default)]
pub struct WorkItemHandlers {
    handlers: RwLock<HashMap<String, Arc<dyn WorkItemHandler>>>,
}

impl WorkItemHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, work_type: &str, handler: Arc<dyn WorkItemHandler>) {
        let mut map = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        map.insert(work_type.to_string(), handler);
    }

    pub fn get(&self, work_type: &str) -> ProcessResult<Arc<dyn WorkItemHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(work_type)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownWorkItemHandler(work_type.to_string()))
    }
}
