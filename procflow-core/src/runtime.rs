//! Process runtime: the public entry point of the engine.
//!
//! Each mutator locks one instance, runs against a fresh `UnitOfWork`, and
//! flushes it in two phases: persistence and job bookkeeping while the
//! instance lock is held, then events and cross-instance effects (parent
//! resumption, child aborts, broadcast signals) after it is released.

use crate::calendar::{BusinessCalendar, StandardBusinessCalendar};
use crate::config::EngineConfig;
use crate::definition::{DefinitionRegistry, NodeKind, ProcessDefinition, StartTrigger};
use crate::error::{ProcessError, ProcessResult};
use crate::events::{EventPublisher, ProcessEvent};
use crate::expiration::ExpirationClock;
use crate::instance::{AgendaItem, Environment, ExecutionContext, ProcessInstance, StartAt};
use crate::jobs::{InMemoryJobService, JobDescription, JobFire, JobTarget, JobsService};
use crate::node::{work_item, NodeInstanceData};
use crate::signal::{EventListener, ListenerId, SignalManager};
use crate::store::ProcessInstances;
use crate::store_memory::MemoryProcessInstances;
use crate::types::*;
use crate::uow::{PersistOp, UnitOfWork, WorkUnit};
use crate::workitem::{
    HumanTaskHandler, IdentityPolicy, IdentityProvider, Policy, Transition, TransitionRecord,
    WorkItem, WorkItemHandler, WorkItemHandlers, ABORT, COMPLETE,
};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type InstanceHandle = Arc<tokio::sync::Mutex<ProcessInstance>>;
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const ACTIVE: &[ProcessState] = &[ProcessState::Active];
const PENDING: &[ProcessState] = &[ProcessState::Pending];
const RECOVERABLE: &[ProcessState] = &[ProcessState::Active, ProcessState::Error];
const NOT_TERMINAL: &[ProcessState] = &[
    ProcessState::Pending,
    ProcessState::Active,
    ProcessState::Error,
];

fn lock_error<E: std::fmt::Display>(e: E) -> ProcessError {
    ProcessError::Collaborator(anyhow!("Lock: {}", e))
}

/// Unwrap engine errors that travelled through a collaborator as `anyhow`.
fn collaborator(e: anyhow::Error) -> ProcessError {
    match e.downcast::<ProcessError>() {
        Ok(inner) => inner,
        Err(e) => ProcessError::Collaborator(e),
    }
}

fn job_error(e: anyhow::Error) -> ProcessError {
    ProcessError::JobScheduling(e.to_string())
}

/// Work aimed at an instance that is gone or finished is dropped.
fn ignore_gone(result: ProcessResult<()>) -> ProcessResult<()> {
    match result {
        Err(ProcessError::ProcessNotActive { instance_id, state }) => {
            tracing::debug!(
                instance_id = %instance_id,
                state = %state,
                "Target instance not active; dropped"
            );
            Ok(())
        }
        Err(ProcessError::ProcessInstanceNotFound(id)) => {
            tracing::debug!(instance_id = %id, "Target instance not found; dropped");
            Ok(())
        }
        other => other,
    }
}

// ── Builder ──

#[derive(Default)]
pub struct ProcessRuntimeBuilder {
    config: EngineConfig,
    definitions: Option<Arc<DefinitionRegistry>>,
    handlers: Option<Arc<WorkItemHandlers>>,
    jobs: Option<(Arc<dyn JobsService>, mpsc::UnboundedReceiver<JobFire>)>,
    store: Option<Arc<dyn ProcessInstances>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    calendar: Option<Arc<dyn BusinessCalendar>>,
    signals: Option<Arc<SignalManager>>,
}

impl ProcessRuntimeBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn definitions(mut self, definitions: Arc<DefinitionRegistry>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn handlers(mut self, handlers: Arc<WorkItemHandlers>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Scheduler plus the channel its fires arrive on.
    pub fn jobs(
        mut self,
        jobs: Arc<dyn JobsService>,
        fires: mpsc::UnboundedReceiver<JobFire>,
    ) -> Self {
        self.jobs = Some((jobs, fires));
        self
    }

    pub fn store(mut self, store: Arc<dyn ProcessInstances>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Identity used for work item transitions submitted without policies.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn calendar(mut self, calendar: Arc<dyn BusinessCalendar>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn signals(mut self, signals: Arc<SignalManager>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub fn build(self) -> ProcessRuntime {
        let calendar = self.calendar.or_else(|| {
            self.config
                .business_calendar
                .clone()
                .map(|c| Arc::new(StandardBusinessCalendar::new(c)) as Arc<dyn BusinessCalendar>)
        });
        let mut clock = ExpirationClock::new(self.config.default_repeat_delay_ms);
        if let Some(calendar) = calendar {
            clock = clock.with_calendar(calendar);
        }
        let handlers = self.handlers.unwrap_or_else(|| {
            let handlers = WorkItemHandlers::new();
            handlers.register(HumanTaskHandler::NAME, Arc::new(HumanTaskHandler::new()));
            Arc::new(handlers)
        });
        let (jobs, fires) = self.jobs.unwrap_or_else(|| {
            let (service, fires) = InMemoryJobService::channel();
            (Arc::new(service) as Arc<dyn JobsService>, fires)
        });
        let env = Environment {
            config: self.config,
            clock,
            handlers,
            definitions: self.definitions.unwrap_or_default(),
        };
        let inner = Arc::new_cyclic(|me| RuntimeInner {
            me: me.clone(),
            env,
            jobs,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryProcessInstances::new())),
            publisher: self.publisher,
            signals: self.signals.unwrap_or_default(),
            identity: self.identity,
            live: Mutex::new(HashMap::new()),
            fires: Mutex::new(Some(fires)),
            background: Mutex::new(Background::default()),
        });
        ProcessRuntime { inner }
    }
}

// ── Runtime ──

#[derive(Default)]
struct Background {
    shutdown: Option<watch::Sender<bool>>,
    listener: Option<JoinHandle<()>>,
    start_listeners: Vec<(String, ListenerId)>,
    start_jobs: Vec<JobId>,
}

struct RuntimeInner {
    me: Weak<RuntimeInner>,
    env: Environment,
    jobs: Arc<dyn JobsService>,
    store: Arc<dyn ProcessInstances>,
    publisher: Option<Arc<dyn EventPublisher>>,
    signals: Arc<SignalManager>,
    identity: Option<Arc<dyn IdentityProvider>>,
    live: Mutex<HashMap<ProcessInstanceId, InstanceHandle>>,
    fires: Mutex<Option<mpsc::UnboundedReceiver<JobFire>>>,
    background: Mutex<Background>,
}

/// Cloneable handle to one engine.
#[derive(Clone)]
pub struct ProcessRuntime {
    inner: Arc<RuntimeInner>,
}

impl ProcessRuntime {
    pub fn builder() -> ProcessRuntimeBuilder {
        ProcessRuntimeBuilder::default()
    }

    pub fn signals(&self) -> &Arc<SignalManager> {
        &self.inner.signals
    }

    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.inner.env.definitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.env.config
    }

    pub fn register_definition(
        &self,
        definition: ProcessDefinition,
    ) -> ProcessResult<Arc<ProcessDefinition>> {
        self.inner.env.definitions.register(definition)
    }

    pub fn register_work_item_handler(&self, work_type: &str, handler: Arc<dyn WorkItemHandler>) {
        self.inner.env.handlers.register(work_type, handler);
    }

    fn live(&self) -> ProcessResult<MutexGuard<'_, HashMap<ProcessInstanceId, InstanceHandle>>> {
        self.inner.live.lock().map_err(lock_error)
    }

    fn background(&self) -> ProcessResult<MutexGuard<'_, Background>> {
        self.inner.background.lock().map_err(lock_error)
    }

    // ── Lifecycle ──

    /// Register signal starts, arm timer starts and spawn the timer
    /// listener. Calling it twice is a no-op.
    pub async fn init(&self) -> ProcessResult<()> {
        if self.background()?.shutdown.is_some() {
            return Ok(());
        }
        let (tx, rx) = watch::channel(false);
        let fires = self.inner.fires.lock().map_err(lock_error)?.take();
        let listener = fires.map(|fires| {
            let listener = TimerListener {
                runtime: self.inner.me.clone(),
                fires,
            };
            tokio::spawn(listener.run(rx))
        });

        let mut start_listeners = Vec::new();
        let mut start_jobs = Vec::new();
        for definition in self.inner.env.definitions.all()? {
            for node in definition.start_nodes() {
                let NodeKind::Start { trigger } = &node.kind else {
                    continue;
                };
                match trigger {
                    StartTrigger::Signal { event_type, .. } => {
                        let listener = Arc::new(StartEventListener {
                            runtime: self.inner.me.clone(),
                            process_id: definition.id.clone(),
                            node_id: node.id,
                        });
                        let id = self.inner.signals.add_event_listener(event_type, listener);
                        start_listeners.push((event_type.clone(), id));
                        tracing::info!(
                            process_id = %definition.id,
                            node_id = node.id,
                            event_type = %event_type,
                            "Signal start registered"
                        );
                    }
                    StartTrigger::Timer(timer) => {
                        let expiration =
                            self.inner
                                .env
                                .clock
                                .expiration_for(timer, &BTreeMap::new(), chrono::Utc::now())?;
                        let job = JobDescription::for_process(&definition.id, node.id, expiration);
                        let job_id = self
                            .inner
                            .jobs
                            .schedule_process_job(job)
                            .await
                            .map_err(job_error)?;
                        start_jobs.push(job_id);
                        tracing::info!(
                            process_id = %definition.id,
                            node_id = node.id,
                            job_id = %job_id,
                            "Timer start armed"
                        );
                    }
                    StartTrigger::None => {}
                }
            }
        }

        let mut background = self.background()?;
        background.shutdown = Some(tx);
        background.listener = listener;
        background.start_listeners = start_listeners;
        background.start_jobs = start_jobs;
        tracing::info!("Process runtime initialized");
        Ok(())
    }

    pub async fn shutdown(&self) -> ProcessResult<()> {
        let (shutdown, listener, start_listeners, start_jobs) = {
            let mut background = self.background()?;
            (
                background.shutdown.take(),
                background.listener.take(),
                std::mem::take(&mut background.start_listeners),
                std::mem::take(&mut background.start_jobs),
            )
        };
        for (event_type, id) in start_listeners {
            self.inner.signals.remove_event_listener(&event_type, id);
        }
        for job_id in start_jobs {
            if let Err(e) = self.inner.jobs.cancel_job(job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to cancel timer start");
            }
        }
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                tracing::warn!(error = %e, "Timer listener ended abnormally");
            }
        }
        self.inner.jobs.shutdown().await.map_err(job_error)?;
        tracing::info!("Process runtime shut down");
        Ok(())
    }

    // ── Instance creation ──

    /// Creates and starts an instance in one call. An instance that fails
    /// while starting stays stored in `Error` but its id is not returned;
    /// callers that need to recover it use `create_instance` followed by
    /// `start_instance`, or look it up through `instances`.
    pub async fn start_process(
        &self,
        process_id: &str,
        variables: BTreeMap<String, Value>,
    ) -> ProcessResult<ProcessInstanceId> {
        self.launch(process_id, variables, None, StartAt::Manual).await
    }

    pub async fn start_process_with_business_key(
        &self,
        process_id: &str,
        variables: BTreeMap<String, Value>,
        business_key: &str,
    ) -> ProcessResult<ProcessInstanceId> {
        self.launch(process_id, variables, Some(business_key.to_string()), StartAt::Manual)
            .await
    }

    /// New `Pending` instance; nothing runs until `start_instance`. The id
    /// stays usable when the start fails into `Error`.
    pub async fn create_instance(
        &self,
        process_id: &str,
        variables: BTreeMap<String, Value>,
        business_key: Option<&str>,
    ) -> ProcessResult<ProcessInstanceId> {
        let instance = self
            .new_instance(process_id, variables, business_key.map(String::from))
            .await?;
        self.register(instance).await
    }

    pub async fn start_instance(&self, id: ProcessInstanceId) -> ProcessResult<()> {
        self.with_instance(id, PENDING, |inst, ctx| inst.start(ctx, StartAt::Manual))
            .await
    }

    async fn launch(
        &self,
        process_id: &str,
        variables: BTreeMap<String, Value>,
        business_key: Option<String>,
        at: StartAt,
    ) -> ProcessResult<ProcessInstanceId> {
        let instance = self.new_instance(process_id, variables, business_key).await?;
        instance
            .variables
            .check_required(&instance.process_id, &instance.definition.variables)?;
        let id = self.register(instance).await?;
        self.with_instance(id, PENDING, move |inst, ctx| inst.start(ctx, at))
            .await?;
        Ok(id)
    }

    async fn new_instance(
        &self,
        process_id: &str,
        variables: BTreeMap<String, Value>,
        business_key: Option<String>,
    ) -> ProcessResult<ProcessInstance> {
        let definition = self.inner.env.definitions.get(process_id)?;
        let reject_duplicates = self.inner.env.config.reject_duplicate_business_keys;
        if let (Some(key), true) = (&business_key, reject_duplicates) {
            let existing = self.inner.store.values(process_id).await.map_err(collaborator)?;
            if existing
                .iter()
                .any(|i| !i.state.is_terminal() && i.business_key.as_deref() == Some(key.as_str()))
            {
                return Err(ProcessError::ProcessInstanceDuplicated(format!(
                    "{}/{}",
                    process_id, key
                )));
            }
        }
        ProcessInstance::new(definition, variables, business_key)
    }

    async fn register(&self, instance: ProcessInstance) -> ProcessResult<ProcessInstanceId> {
        let id = instance.id;
        self.inner.store.create(&instance).await.map_err(collaborator)?;
        let event = instance.created_event();
        tracing::info!(
            instance_id = %id,
            process_id = %instance.process_id,
            business_key = ?instance.business_key,
            "Process instance created"
        );
        self.live()?
            .insert(id, Arc::new(tokio::sync::Mutex::new(instance)));
        self.publish(&event).await;
        Ok(id)
    }

    // ── Mutators ──

    /// Broadcast to every listener; returns how many were notified.
    pub async fn signal_event(&self, event_type: &str, payload: Value) -> usize {
        tracing::debug!(event_type, "Broadcasting signal");
        self.inner.signals.signal_event(event_type, &payload).await
    }

    /// Deliver an event to one instance only.
    pub async fn signal_process_instance(
        &self,
        id: ProcessInstanceId,
        event_type: &str,
        payload: Value,
    ) -> ProcessResult<()> {
        let event_type = event_type.to_string();
        self.with_instance(id, ACTIVE, move |inst, ctx| {
            inst.push(AgendaItem::Deliver { event_type, payload });
            inst.execute(ctx)
        })
        .await
    }

    pub async fn transition_work_item(
        &self,
        id: ProcessInstanceId,
        work_item_id: WorkItemId,
        transition: Transition,
    ) -> ProcessResult<TransitionRecord> {
        let transition = self.with_default_identity(transition);
        self.with_instance(id, ACTIVE, move |inst, ctx| {
            let record = work_item::transition(inst, ctx, work_item_id, transition)?;
            inst.execute(ctx)?;
            Ok(record)
        })
        .await
    }

    pub async fn complete_work_item(
        &self,
        id: ProcessInstanceId,
        work_item_id: WorkItemId,
        results: BTreeMap<String, Value>,
        policies: Vec<Arc<dyn Policy>>,
    ) -> ProcessResult<TransitionRecord> {
        let transition = Transition::new(COMPLETE)
            .with_data(results)
            .with_policies(policies);
        self.transition_work_item(id, work_item_id, transition).await
    }

    pub async fn abort_work_item(
        &self,
        id: ProcessInstanceId,
        work_item_id: WorkItemId,
        policies: Vec<Arc<dyn Policy>>,
    ) -> ProcessResult<TransitionRecord> {
        let transition = Transition::new(ABORT).with_policies(policies);
        self.transition_work_item(id, work_item_id, transition).await
    }

    fn with_default_identity(&self, transition: Transition) -> Transition {
        match &self.inner.identity {
            Some(identity) if transition.policies.is_empty() => {
                transition.with_policy(Arc::new(IdentityPolicy::from_provider(identity.as_ref())))
            }
            _ => transition,
        }
    }

    /// Trigger a node directly, outside normal sequence flow.
    pub async fn trigger_node(&self, id: ProcessInstanceId, node_id: NodeId) -> ProcessResult<()> {
        self.with_instance(id, ACTIVE, move |inst, ctx| {
            inst.definition.require_node(node_id)?;
            inst.push(AgendaItem::Trigger {
                node_id,
                from: None,
                level: 0,
                resumed: false,
            });
            inst.execute(ctx)
        })
        .await
    }

    /// Cancel one active node instance. The last one cannot be canceled;
    /// use `abort` for that.
    pub async fn cancel_node_instance(
        &self,
        id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
    ) -> ProcessResult<()> {
        self.with_instance(id, ACTIVE, move |inst, ctx| {
            inst.require_node_instance(node_instance_id)?;
            let others = inst
                .node_instances
                .iter()
                .filter(|ni| ni.id != node_instance_id)
                .filter(|ni| {
                    !matches!(
                        ni.data,
                        NodeInstanceData::Boundary { host, .. } if host == node_instance_id
                    )
                })
                .count();
            if others == 0 {
                return Err(ProcessError::IllegalTransition {
                    subject: format!("node instance {}", node_instance_id),
                    transition: "cancel".to_string(),
                    phase: "last active".to_string(),
                });
            }
            inst.cancel_node_instance(ctx, node_instance_id)?;
            inst.execute(ctx)
        })
        .await
    }

    /// Replace a node instance by a fresh trigger of the same node. Also the
    /// recovery path for an instance in `Error`.
    pub async fn retrigger_node_instance(
        &self,
        id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
    ) -> ProcessResult<()> {
        self.with_instance(id, RECOVERABLE, move |inst, ctx| {
            let ni = inst.require_node_instance(node_instance_id)?.clone();
            inst.cancel_node_instance(ctx, node_instance_id)?;
            inst.recover(ctx);
            tracing::info!(instance_id = %inst.id, node_id = ni.node_id, "Retriggering node");
            inst.push(AgendaItem::Trigger {
                node_id: ni.node_id,
                from: None,
                level: ni.level,
                resumed: false,
            });
            inst.execute(ctx)
        })
        .await
    }

    pub async fn abort(&self, id: ProcessInstanceId) -> ProcessResult<()> {
        self.with_instance(id, NOT_TERMINAL, |inst, ctx| {
            inst.abort(ctx);
            Ok(())
        })
        .await
    }

    pub async fn update_variables(
        &self,
        id: ProcessInstanceId,
        updates: BTreeMap<String, Value>,
    ) -> ProcessResult<()> {
        self.with_instance(id, NOT_TERMINAL, move |inst, ctx| inst.update_variables(ctx, updates))
            .await
    }

    /// Entry point for the scheduler. Duplicate and late fires are no-ops;
    /// fires for an instance in `Error` wait for its recovery.
    pub async fn job_fired(&self, fire: JobFire) -> ProcessResult<()> {
        match fire.target.clone() {
            JobTarget::Process { process_id, node_id } => {
                tracing::info!(
                    process_id = %process_id,
                    node_id,
                    job_id = %fire.job_id,
                    "Timer start fired"
                );
                let at = StartAt::Node {
                    node_id,
                    payload: None,
                };
                self.launch(&process_id, BTreeMap::new(), None, at).await.map(|_| ())
            }
            JobTarget::ProcessInstance {
                process_instance_id,
                ..
            } => {
                let result = self
                    .with_instance(process_instance_id, RECOVERABLE, move |inst, ctx| {
                        if inst.state == ProcessState::Error {
                            inst.park_fire(fire);
                            return Ok(());
                        }
                        inst.push(AgendaItem::TimerFired(fire));
                        inst.execute(ctx)
                    })
                    .await;
                ignore_gone(result)
            }
        }
    }

    async fn start_at_node(
        &self,
        process_id: &str,
        node_id: NodeId,
        payload: Value,
    ) -> ProcessResult<ProcessInstanceId> {
        let at = StartAt::Node {
            node_id,
            payload: Some(payload),
        };
        self.launch(process_id, BTreeMap::new(), None, at).await
    }

    async fn resume_parent(
        &self,
        parent_id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
        child_id: ProcessInstanceId,
        outcome: crate::instance::ChildOutcome,
    ) -> ProcessResult<()> {
        self.with_instance(parent_id, ACTIVE, move |inst, ctx| {
            inst.push(AgendaItem::ChildFinished {
                node_instance_id,
                child_id,
                outcome,
            });
            inst.execute(ctx)
        })
        .await
    }

    // ── Queries ──

    /// Snapshot of an instance, live or from the store.
    pub async fn get_instance(&self, id: ProcessInstanceId) -> ProcessResult<ProcessInstance> {
        let handle = self.live()?.get(&id).cloned();
        if let Some(handle) = handle {
            return Ok(handle.lock().await.clone());
        }
        self.inner
            .store
            .find_by_id(id)
            .await
            .map_err(collaborator)?
            .ok_or(ProcessError::ProcessInstanceNotFound(id))
    }

    /// Variables not tagged internal.
    pub async fn variables(&self, id: ProcessInstanceId) -> ProcessResult<BTreeMap<String, Value>> {
        Ok(self.get_instance(id).await?.variables())
    }

    pub async fn work_items(&self, id: ProcessInstanceId) -> ProcessResult<Vec<WorkItem>> {
        Ok(self.get_instance(id).await?.work_items().cloned().collect())
    }

    pub async fn instances(&self, process_id: &str) -> ProcessResult<Vec<ProcessInstance>> {
        self.inner.store.values(process_id).await.map_err(collaborator)
    }

    // ── Unit of work ──

    async fn live_handle(&self, id: ProcessInstanceId) -> ProcessResult<InstanceHandle> {
        let cached = self.live()?.get(&id).cloned();
        if let Some(handle) = cached {
            return Ok(handle);
        }
        let mut stored = self
            .inner
            .store
            .find_by_id(id)
            .await
            .map_err(collaborator)?
            .ok_or(ProcessError::ProcessInstanceNotFound(id))?;
        // Registrations belong to whichever runtime wrote the snapshot.
        stored.listeners.clear();
        let (handle, inserted) = {
            let mut live = self.live()?;
            match live.get(&id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let handle = Arc::new(tokio::sync::Mutex::new(stored));
                    live.insert(id, handle.clone());
                    (handle, true)
                }
            }
        };
        if inserted {
            tracing::debug!(instance_id = %id, "Process instance loaded from store");
            let mut guard = handle.lock().await;
            self.sync_listeners(&mut guard);
        }
        Ok(handle)
    }

    fn forget(&self, id: ProcessInstanceId) {
        if let Ok(mut live) = self.inner.live.lock() {
            live.remove(&id);
        }
    }

    /// Run `op` against one instance and flush what it queued. Rejected
    /// operations change nothing; failed ones (instance now in `Error`) keep
    /// their persistence and job bookkeeping.
    async fn with_instance<T, F>(
        &self,
        id: ProcessInstanceId,
        allowed: &[ProcessState],
        op: F,
    ) -> ProcessResult<T>
    where
        T: Send,
        F: FnOnce(&mut ProcessInstance, &mut ExecutionContext<'_>) -> ProcessResult<T> + Send,
    {
        let handle = self.live_handle(id).await?;
        let mut guard = handle.lock().await;
        if !allowed.contains(&guard.state) {
            let state = guard.state;
            drop(guard);
            if state.is_terminal() {
                self.forget(id);
            }
            return Err(ProcessError::ProcessNotActive {
                instance_id: id,
                state,
            });
        }

        let errors_before = guard.error_count;
        let mut uow = UnitOfWork::new();
        let result = {
            let mut ctx = ExecutionContext::new(&self.inner.env, &mut uow);
            op(&mut *guard, &mut ctx)
        };
        if let Err(e) = &result {
            if guard.error_count == errors_before {
                tracing::debug!(instance_id = %id, error = %e, "Operation rejected");
                return result;
            }
            uow.retain_after_failure();
        }

        self.sync_listeners(&mut guard);
        uow.persist_update(guard.clone());
        let (commit, post) = uow.into_phases();
        let committed = self.commit(commit).await;
        let terminal = guard.state.is_terminal();
        drop(guard);
        if terminal {
            self.forget(id);
        }
        self.run_post(post).await;

        match result {
            Ok(value) => committed.map(|_| value),
            Err(e) => Err(e),
        }
    }

    /// Listener per awaited event type while `Active`; none otherwise.
    fn sync_listeners(&self, inst: &mut ProcessInstance) {
        let wanted: BTreeSet<String> = if inst.state == ProcessState::Active {
            inst.awaited_events()
        } else {
            BTreeSet::new()
        };
        let stale: Vec<String> = inst
            .listeners
            .keys()
            .filter(|t| !wanted.contains(*t))
            .cloned()
            .collect();
        for event_type in stale {
            if let Some(id) = inst.listeners.remove(&event_type) {
                self.inner.signals.remove_event_listener(&event_type, id);
            }
        }
        for event_type in wanted {
            if inst.listeners.contains_key(&event_type) {
                continue;
            }
            let listener = Arc::new(InstanceSignalListener {
                runtime: self.inner.me.clone(),
                instance_id: inst.id,
            });
            let id = self.inner.signals.add_event_listener(&event_type, listener);
            inst.listeners.insert(event_type, id);
        }
    }

    async fn commit(&self, units: Vec<WorkUnit>) -> ProcessResult<()> {
        let mut first_error = None;
        for unit in units {
            let outcome = match unit {
                WorkUnit::Persist(PersistOp::Create { instance, adopt }) => {
                    self.persist_new(*instance, adopt).await
                }
                WorkUnit::Persist(PersistOp::Update(instance)) => {
                    self.inner.store.update(&instance).await.map_err(collaborator)
                }
                WorkUnit::ScheduleJob(job) => self.schedule(job).await,
                WorkUnit::CancelJob(job_id) => {
                    self.inner.jobs.cancel_job(job_id).await.map(|_| ()).map_err(job_error)
                }
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "Unit of work commit failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn persist_new(&self, mut instance: ProcessInstance, adopt: bool) -> ProcessResult<()> {
        self.inner.store.create(&instance).await.map_err(collaborator)?;
        if adopt && !instance.state.is_terminal() {
            self.sync_listeners(&mut instance);
            let id = instance.id;
            self.live()?
                .insert(id, Arc::new(tokio::sync::Mutex::new(instance)));
        }
        Ok(())
    }

    async fn schedule(&self, job: JobDescription) -> ProcessResult<()> {
        let result = match job.target {
            JobTarget::Process { .. } => self.inner.jobs.schedule_process_job(job).await,
            JobTarget::ProcessInstance { .. } => {
                self.inner.jobs.schedule_process_instance_job(job).await
            }
        };
        result.map(|_| ()).map_err(job_error)
    }

    fn run_post(&self, units: Vec<WorkUnit>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for unit in units {
                match unit {
                    WorkUnit::Publish(event) => self.publish(&event).await,
                    WorkUnit::AbortInstance(child) => {
                        if let Err(e) = ignore_gone(self.abort(child).await) {
                            tracing::warn!(
                                instance_id = %child,
                                error = %e,
                                "Failed to abort child instance"
                            );
                        }
                    }
                    WorkUnit::ResumeParent {
                        parent_id,
                        node_instance_id,
                        child_id,
                        outcome,
                    } => {
                        let result = self
                            .resume_parent(parent_id, node_instance_id, child_id, outcome)
                            .await;
                        if let Err(e) = ignore_gone(result) {
                            tracing::warn!(
                                instance_id = %parent_id,
                                child_id = %child_id,
                                error = %e,
                                "Failed to resume parent instance"
                            );
                        }
                    }
                    WorkUnit::Signal { event_type, payload } => {
                        let notified = self.inner.signals.signal_event(&event_type, &payload).await;
                        tracing::debug!(event_type = %event_type, notified, "Signal broadcast");
                    }
                    WorkUnit::Persist(_) | WorkUnit::ScheduleJob(_) | WorkUnit::CancelJob(_) => {}
                }
            }
        })
    }

    async fn publish(&self, event: &ProcessEvent) {
        if let Some(publisher) = &self.inner.publisher {
            if let Err(e) = publisher.publish(event).await {
                tracing::warn!(
                    instance_id = %event.instance_id(),
                    error = %e,
                    "Failed to publish process event"
                );
            }
        }
    }
}

// ── Listeners ──

/// Routes broadcast signals to one waiting instance.
struct InstanceSignalListener {
    runtime: Weak<RuntimeInner>,
    instance_id: ProcessInstanceId,
}

#[async_trait]
impl EventListener for InstanceSignalListener {
    async fn signal_event(&self, event_type: &str, payload: &Value) -> anyhow::Result<()> {
        let Some(inner) = self.runtime.upgrade() else {
            return Ok(());
        };
        let runtime = ProcessRuntime { inner };
        let result = runtime
            .signal_process_instance(self.instance_id, event_type, payload.clone())
            .await;
        ignore_gone(result).map_err(anyhow::Error::from)
    }
}

/// Starts a new instance at a signal start node.
struct StartEventListener {
    runtime: Weak<RuntimeInner>,
    process_id: String,
    node_id: NodeId,
}

#[async_trait]
impl EventListener for StartEventListener {
    async fn signal_event(&self, event_type: &str, payload: &Value) -> anyhow::Result<()> {
        let Some(inner) = self.runtime.upgrade() else {
            return Ok(());
        };
        let runtime = ProcessRuntime { inner };
        let id = runtime
            .start_at_node(&self.process_id, self.node_id, payload.clone())
            .await?;
        tracing::info!(
            process_id = %self.process_id,
            instance_id = %id,
            event_type,
            "Process started by signal"
        );
        Ok(())
    }
}

/// Drains scheduler fires into `job_fired` until shut down.
struct TimerListener {
    runtime: Weak<RuntimeInner>,
    fires: mpsc::UnboundedReceiver<JobFire>,
}

impl TimerListener {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Timer listener started");
        loop {
            tokio::select! {
                fire = self.fires.recv() => {
                    let Some(fire) = fire else {
                        tracing::info!("Job fire channel closed");
                        break;
                    };
                    let Some(inner) = self.runtime.upgrade() else {
                        break;
                    };
                    let job_id = fire.job_id;
                    if let Err(e) = (ProcessRuntime { inner }).job_fired(fire).await {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to process job fire");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Timer listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}
