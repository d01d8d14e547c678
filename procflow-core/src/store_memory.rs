use crate::error::ProcessError;
use crate::events::{EventPublisher, ProcessEvent};
use crate::instance::ProcessInstance;
use crate::store::ProcessInstances;
use crate::types::ProcessInstanceId;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

// ── MemoryProcessInstances ──

/// In-memory instance store for tests and single-process deployments.
///
/// Terminal instances are kept unless `remove_terminal` is set, in which
/// case an update that finishes an instance deletes it.
pub struct MemoryProcessInstances {
    inner: RwLock<HashMap<ProcessInstanceId, ProcessInstance>>,
    remove_terminal: bool,
}

impl MemoryProcessInstances {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            remove_terminal: false,
        }
    }

    pub fn removing_terminal() -> Self {
        Self {
            remove_terminal: true,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|store| store.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryProcessInstances {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessInstances for MemoryProcessInstances {
    async fn find_by_id(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.get(&id).cloned())
    }

    async fn values(&self, process_id: &str) -> Result<Vec<ProcessInstance>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let mut instances: Vec<ProcessInstance> = store
            .values()
            .filter(|i| i.process_id == process_id)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn exists(&self, id: ProcessInstanceId) -> Result<bool> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store.contains_key(&id))
    }

    async fn create(&self, instance: &ProcessInstance) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        if store.contains_key(&instance.id) {
            return Err(ProcessError::ProcessInstanceDuplicated(instance.id.to_string()).into());
        }
        store.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn update(&self, instance: &ProcessInstance) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        if self.remove_terminal && instance.state.is_terminal() {
            store.remove(&instance.id);
            tracing::debug!(
                instance_id = %instance.id,
                state = %instance.state,
                "Removed finished instance"
            );
            return Ok(());
        }
        store.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn remove(&self, id: ProcessInstanceId) -> Result<()> {
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        store.remove(&id);
        Ok(())
    }
}

// ── MemoryEventPublisher ──

/// Records every published event, in order.
#[derive(Default)]
pub struct MemoryEventPublisher {
    events: RwLock<Vec<ProcessEvent>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, id: ProcessInstanceId) -> Vec<ProcessEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.instance_id() == id)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, event: &ProcessEvent) -> Result<()> {
        let mut events = self.events.write().map_err(|e| anyhow!("Lock: {}", e))?;
        events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeKind, ProcessDefinition};
    use crate::types::ProcessState;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn instance() -> ProcessInstance {
        let def = ProcessDefinition::builder("p")
            .node(1, "start", NodeKind::start())
            .node(2, "end", NodeKind::end())
            .connect(1, 2)
            .build()
            .unwrap();
        ProcessInstance::new(Arc::new(def), BTreeMap::new(), None).unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = MemoryProcessInstances::new();
        let pi = instance();
        store.create(&pi).await.unwrap();

        let err = store.create(&pi).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProcessError>(),
            Some(ProcessError::ProcessInstanceDuplicated(_))
        ));
        assert!(store.exists(pi.id).await.unwrap());
        assert_eq!(store.values("p").await.unwrap().len(), 1);
        assert!(store.values("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_instances_removed_when_configured() {
        let store = MemoryProcessInstances::removing_terminal();
        let mut pi = instance();
        store.create(&pi).await.unwrap();

        pi.state = ProcessState::Completed;
        store.update(&pi).await.unwrap();
        assert!(store.find_by_id(pi.id).await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
