//! Job scheduling: timer callbacks targeted at a process or a node instance.

use crate::expiration::ExpirationTime;
use crate::types::{JobId, NodeId, NodeInstanceId, ProcessInstanceId};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobTarget {
    /// Process-level timer start: each fire creates a new instance.
    Process { process_id: String, node_id: NodeId },
    /// Timer owned by a node instance.
    ProcessInstance {
        process_id: String,
        process_instance_id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
        node_id: NodeId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    pub job_id: JobId,
    pub expiration: ExpirationTime,
    pub target: JobTarget,
}

impl JobDescription {
    pub fn for_process(process_id: &str, node_id: NodeId, expiration: ExpirationTime) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            expiration,
            target: JobTarget::Process {
                process_id: process_id.to_string(),
                node_id,
            },
        }
    }

    pub fn for_node_instance(
        process_id: &str,
        process_instance_id: ProcessInstanceId,
        node_instance_id: NodeInstanceId,
        node_id: NodeId,
        expiration: ExpirationTime,
    ) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            expiration,
            target: JobTarget::ProcessInstance {
                process_id: process_id.to_string(),
                process_instance_id,
                node_instance_id,
                node_id,
            },
        }
    }
}

/// One occurrence of a scheduled job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFire {
    pub job_id: JobId,
    pub target: JobTarget,
    /// 1-based occurrence number.
    pub fire_count: u32,
    /// No further occurrences follow.
    pub last: bool,
}

/// Scheduler contract. Delivery is at-least-once; consumers must tolerate
/// duplicate and late fires.
#[async_trait]
pub trait JobsService: Send + Sync {
    async fn schedule_job(&self, description: JobDescription) -> Result<JobId>;

    async fn schedule_process_job(&self, description: JobDescription) -> Result<JobId> {
        if !matches!(description.target, JobTarget::Process { .. }) {
            bail!("Job {} does not target a process", description.job_id);
        }
        self.schedule_job(description).await
    }

    async fn schedule_process_instance_job(&self, description: JobDescription) -> Result<JobId> {
        if !matches!(description.target, JobTarget::ProcessInstance { .. }) {
            bail!("Job {} does not target a process instance", description.job_id);
        }
        self.schedule_job(description).await
    }

    /// Remove all remaining occurrences. Returns false if the job was unknown.
    async fn cancel_job(&self, job_id: JobId) -> Result<bool>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ── InMemoryJobService ──

type JobHandles = Arc<Mutex<HashMap<JobId, JoinHandle<()>>>>;

/// One tokio task per job. Fires are pushed onto an unbounded channel.
pub struct InMemoryJobService {
    sender: mpsc::UnboundedSender<JobFire>,
    jobs: JobHandles,
}

impl InMemoryJobService {
    pub fn new(sender: mpsc::UnboundedSender<JobFire>) -> Self {
        Self {
            sender,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Service plus the receiving end of its fire channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobFire>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn is_scheduled(&self, job_id: JobId) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.contains_key(&job_id))
            .unwrap_or(false)
    }

    pub fn scheduled_jobs(&self) -> Vec<JobId> {
        self.jobs
            .lock()
            .map(|jobs| jobs.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobsService for InMemoryJobService {
    async fn schedule_job(&self, description: JobDescription) -> Result<JobId> {
        if self.sender.is_closed() {
            bail!("Job fire channel is closed");
        }
        let job_id = description.job_id;
        let delay = description.expiration.initial_delay(chrono::Utc::now());
        let period = description.expiration.period();
        let total = description.expiration.total_fires();
        let target = description.target;
        let sender = self.sender.clone();
        let jobs = self.jobs.clone();

        // The handle is inserted before the task can reach its own removal.
        let mut guard = self.jobs.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut fire_count = 0u32;
            loop {
                fire_count += 1;
                let last = period.is_none() || total.is_some_and(|t| fire_count >= t);
                if last {
                    if let Ok(mut jobs) = jobs.lock() {
                        jobs.remove(&job_id);
                    }
                }
                let fire = JobFire {
                    job_id,
                    target: target.clone(),
                    fire_count,
                    last,
                };
                if sender.send(fire).is_err() || last {
                    break;
                }
                if let Some(period) = period {
                    tokio::time::sleep(period).await;
                }
            }
        });
        guard.insert(job_id, handle);
        drop(guard);

        tracing::debug!(
            job_id = %job_id,
            delay_ms = delay.as_millis() as u64,
            ?total,
            "Scheduled job"
        );
        Ok(job_id)
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        let handle = self
            .jobs
            .lock()
            .map_err(|e| anyhow!("Lock: {}", e))?
            .remove(&job_id);
        match handle {
            Some(handle) => {
                handle.abort();
                tracing::debug!(job_id = %job_id, "Cancelled job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let drained: Vec<JoinHandle<()>> = self
            .jobs
            .lock()
            .map_err(|e| anyhow!("Lock: {}", e))?
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in &drained {
            handle.abort();
        }
        tracing::info!(jobs = drained.len(), "Job service shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiration::UNBOUNDED;
    use std::time::Duration;

    fn instance_job(expiration: ExpirationTime) -> JobDescription {
        JobDescription::for_node_instance("p", Uuid::now_v7(), Uuid::now_v7(), 3, expiration)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_once() {
        let (jobs, mut rx) = InMemoryJobService::channel();
        let id = jobs
            .schedule_process_instance_job(instance_job(ExpirationTime::after_ms(500)))
            .await
            .unwrap();
        assert!(jobs.is_scheduled(id));

        let fire = rx.recv().await.unwrap();
        assert_eq!(fire.job_id, id);
        assert_eq!(fire.fire_count, 1);
        assert!(fire.last);
        assert!(!jobs.is_scheduled(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_limit_is_total_fires() {
        let (jobs, mut rx) = InMemoryJobService::channel();
        let id = jobs
            .schedule_job(instance_job(ExpirationTime::repeating(100, 1_000, 3)))
            .await
            .unwrap();

        let counts: Vec<(u32, bool)> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|f| (f.fire_count, f.last))
        .collect();
        assert_eq!(counts, vec![(1, false), (2, false), (3, true)]);
        assert!(!jobs.is_scheduled(id));
        let extra = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(extra.is_err(), "no fourth occurrence");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_unbounded_job() {
        let (jobs, mut rx) = InMemoryJobService::channel();
        let id = jobs
            .schedule_job(instance_job(ExpirationTime::repeating(100, 100, UNBOUNDED)))
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert!(!first.last);

        assert!(jobs.cancel_job(id).await.unwrap());
        assert!(!jobs.cancel_job(id).await.unwrap());
        let after = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(after.is_err());
    }

    #[tokio::test]
    async fn test_target_checked_by_helpers() {
        let (jobs, _rx) = InMemoryJobService::channel();
        let process_job = JobDescription::for_process("p", 1, ExpirationTime::after_ms(10));
        assert!(jobs
            .schedule_process_instance_job(process_job.clone())
            .await
            .is_err());
        assert!(jobs.schedule_process_job(process_job).await.is_ok());
        jobs.shutdown().await.unwrap();
        assert!(jobs.scheduled_jobs().is_empty());
    }
}
