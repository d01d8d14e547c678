//! Unit of work: side effects produced by one operation.
//!
//! Node traversal never talks to collaborators directly. It queues work units
//! here; the runtime flushes them once the operation returns, in priority
//! order (persistence, jobs, events, then cross-instance effects).

use crate::events::ProcessEvent;
use crate::instance::{ChildOutcome, ProcessInstance};
use crate::jobs::JobDescription;
use crate::types::{JobId, NodeInstanceId, ProcessInstanceId, ProcessState, Value};

#[derive(Debug)]
pub(crate) enum PersistOp {
    /// `adopt`: the instance was created inside another instance's operation
    /// (sub-process) and still has to join the live set.
    Create {
        instance: Box<ProcessInstance>,
        adopt: bool,
    },
    Update(Box<ProcessInstance>),
}

#[derive(Debug)]
pub(crate) enum WorkUnit {
    Persist(PersistOp),
    ScheduleJob(JobDescription),
    CancelJob(JobId),
    Publish(ProcessEvent),
    AbortInstance(ProcessInstanceId),
    ResumeParent {
        parent_id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
        child_id: ProcessInstanceId,
        outcome: ChildOutcome,
    },
    /// Broadcast through the signal manager.
    Signal { event_type: String, payload: Value },
}

impl WorkUnit {
    fn priority(&self) -> u8 {
        match self {
            WorkUnit::Persist(_) => 0,
            WorkUnit::ScheduleJob(_) | WorkUnit::CancelJob(_) => 1,
            WorkUnit::Publish(_) => 2,
            WorkUnit::AbortInstance(_) => 3,
            WorkUnit::ResumeParent { .. } => 4,
            WorkUnit::Signal { .. } => 5,
        }
    }

    /// Units applied while the instance lock is still held.
    pub(crate) fn is_commit(&self) -> bool {
        self.priority() <= 1
    }
}

#[derive(Debug, Default)]
pub(crate) struct UnitOfWork {
    units: Vec<WorkUnit>,
}

impl UnitOfWork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn persist_create(&mut self, instance: ProcessInstance, adopt: bool) {
        self.units.push(WorkUnit::Persist(PersistOp::Create {
            instance: Box::new(instance),
            adopt,
        }));
    }

    pub(crate) fn persist_update(&mut self, instance: ProcessInstance) {
        self.units
            .push(WorkUnit::Persist(PersistOp::Update(Box::new(instance))));
    }

    pub(crate) fn schedule_job(&mut self, description: JobDescription) {
        self.units.push(WorkUnit::ScheduleJob(description));
    }

    /// A job scheduled earlier in this unit of work is simply dropped.
    pub(crate) fn cancel_job(&mut self, job_id: JobId) {
        let before = self.units.len();
        self.units
            .retain(|u| !matches!(u, WorkUnit::ScheduleJob(d) if d.job_id == job_id));
        if self.units.len() == before {
            self.units.push(WorkUnit::CancelJob(job_id));
        }
    }

    pub(crate) fn publish(&mut self, event: ProcessEvent) {
        self.units.push(WorkUnit::Publish(event));
    }

    pub(crate) fn abort_instance(&mut self, id: ProcessInstanceId) {
        self.units.push(WorkUnit::AbortInstance(id));
    }

    pub(crate) fn resume_parent(
        &mut self,
        parent_id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
        child_id: ProcessInstanceId,
        outcome: ChildOutcome,
    ) {
        let duplicate = self.units.iter().any(|u| {
            matches!(u, WorkUnit::ResumeParent { child_id: c, .. } if *c == child_id)
        });
        if !duplicate {
            self.units.push(WorkUnit::ResumeParent {
                parent_id,
                node_instance_id,
                child_id,
                outcome,
            });
        }
    }

    pub(crate) fn signal(&mut self, event_type: &str, payload: Value) {
        self.units.push(WorkUnit::Signal {
            event_type: event_type.to_string(),
            payload,
        });
    }

    /// After a failed operation only the effects that mirror already applied
    /// in-memory state survive: persistence, job bookkeeping and the
    /// transition into `Error`.
    pub(crate) fn retain_after_failure(&mut self) {
        self.units.retain(|u| {
            u.is_commit()
                || matches!(
                    u,
                    WorkUnit::Publish(ProcessEvent::InstanceStateChanged {
                        to: ProcessState::Error,
                        ..
                    })
                )
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Split into (commit, post-commit) units, each in flush order.
    pub(crate) fn into_phases(mut self) -> (Vec<WorkUnit>, Vec<WorkUnit>) {
        self.units.sort_by_key(WorkUnit::priority);
        self.units.into_iter().partition(WorkUnit::is_commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::ExpirationTime;
    use serde_json::json;
    use uuid::Uuid;

    fn job() -> JobDescription {
        JobDescription::for_node_instance(
            "p",
            Uuid::nil(),
            Uuid::nil(),
            1,
            ExpirationTime::after_ms(5),
        )
    }

    fn kinds(units: &[WorkUnit]) -> Vec<u8> {
        units.iter().map(WorkUnit::priority).collect()
    }

    #[test]
    fn test_flush_order_is_stable_by_priority() {
        let mut uow = UnitOfWork::new();
        uow.signal("a", json!(1));
        uow.abort_instance(Uuid::nil());
        uow.schedule_job(job());
        uow.signal("b", json!(2));
        uow.cancel_job(Uuid::now_v7());

        let (commit, post) = uow.into_phases();
        assert_eq!(kinds(&commit), vec![1, 1]);
        assert!(matches!(commit[0], WorkUnit::ScheduleJob(_)));
        assert_eq!(kinds(&post), vec![3, 5, 5]);
        assert!(matches!(&post[1], WorkUnit::Signal { event_type, .. } if event_type == "a"));
    }

    #[test]
    fn test_cancel_of_unflushed_job_drops_it() {
        let mut uow = UnitOfWork::new();
        let desc = job();
        let id = desc.job_id;
        uow.schedule_job(desc);
        uow.cancel_job(id);
        assert!(uow.is_empty());
    }

    #[test]
    fn test_failure_keeps_only_commit_units() {
        let mut uow = UnitOfWork::new();
        uow.schedule_job(job());
        uow.signal("x", json!(null));
        uow.abort_instance(Uuid::nil());
        uow.publish(ProcessEvent::InstanceStateChanged {
            instance_id: Uuid::nil(),
            process_id: "p".into(),
            business_key: None,
            from: Some(ProcessState::Active),
            to: ProcessState::Error,
            at: chrono::Utc::now(),
        });
        uow.retain_after_failure();
        let (commit, post) = uow.into_phases();
        assert_eq!(commit.len(), 1);
        assert_eq!(post.len(), 1, "only the error transition is published");
        assert!(matches!(post[0], WorkUnit::Publish(_)));
    }

    #[test]
    fn test_resume_parent_once_per_child() {
        let mut uow = UnitOfWork::new();
        let child = Uuid::now_v7();
        uow.resume_parent(Uuid::nil(), Uuid::nil(), child, ChildOutcome::Aborted);
        uow.resume_parent(Uuid::nil(), Uuid::nil(), child, ChildOutcome::Aborted);
        let (_, post) = uow.into_phases();
        assert_eq!(post.len(), 1);
    }
}
