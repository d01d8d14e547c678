use crate::instance::ProcessInstance;
use crate::types::ProcessInstanceId;
use anyhow::Result;
use async_trait::async_trait;

/// Instance persistence. The engine calls it only when a unit of work is
/// flushed; what "persist" means (and when terminal instances are dropped)
/// is up to the implementation.
#[async_trait]
pub trait ProcessInstances: Send + Sync {
    async fn find_by_id(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>>;

    /// All instances of one process definition.
    async fn values(&self, process_id: &str) -> Result<Vec<ProcessInstance>>;

    async fn exists(&self, id: ProcessInstanceId) -> Result<bool>;

    /// Fails with `ProcessError::ProcessInstanceDuplicated` (wrapped) on id collision.
    async fn create(&self, instance: &ProcessInstance) -> Result<()>;

    async fn update(&self, instance: &ProcessInstance) -> Result<()>;

    async fn remove(&self, id: ProcessInstanceId) -> Result<()>;
}
