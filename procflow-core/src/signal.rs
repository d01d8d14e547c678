//! Signal Manager: event type → listener multimap.
//!
//! Dispatch snapshots the listener list first, so a listener may register or
//! remove listeners (including itself) while a signal is being delivered.

use crate::types::Value;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by `add_event_listener`, used for removal.
pub type ListenerId = u64;

#[async_trait]
pub trait EventListener: Send + Sync {
    /// Receives one signal. Implementations check liveness of their target
    /// before mutating anything; delivery may race with completion.
    async fn signal_event(&self, event_type: &str, payload: &Value) -> Result<()>;
}

struct Registration {
    id: ListenerId,
    listener: Arc<dyn EventListener>,
    once: bool,
}

#[derive(Default)]
pub struct SignalManager {
    listeners: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl SignalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event_listener(
        &self,
        event_type: &str,
        listener: Arc<dyn EventListener>,
    ) -> ListenerId {
        self.register(event_type, listener, false)
    }

    /// Listener removed before its first delivery.
    pub fn add_one_shot_listener(
        &self,
        event_type: &str,
        listener: Arc<dyn EventListener>,
    ) -> ListenerId {
        self.register(event_type, listener, true)
    }

    fn register(
        &self,
        event_type: &str,
        listener: Arc<dyn EventListener>,
        once: bool,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut map = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        map.entry(event_type.to_string())
            .or_default()
            .push(Registration { id, listener, once });
        tracing::trace!(event_type, listener_id = id, "Listener registered");
        id
    }

    /// Returns false if no such registration exists.
    pub fn remove_event_listener(&self, event_type: &str, id: ListenerId) -> bool {
        let mut map = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = map.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(event_type);
        }
        removed
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Deliver `payload` to every listener of `event_type`, in registration
    /// order. Returns the number of listeners reached. A failing listener is
    /// logged and does not stop delivery to the rest.
    pub async fn signal_event(&self, event_type: &str, payload: &Value) -> usize {
        let snapshot: Vec<(ListenerId, Arc<dyn EventListener>)> = {
            let mut map = self.listeners.write().unwrap_or_else(|e| e.into_inner());
            let Some(list) = map.get_mut(event_type) else {
                tracing::debug!(event_type, "Signal has no listeners");
                return 0;
            };
            let snapshot = list.iter().map(|r| (r.id, r.listener.clone())).collect();
            list.retain(|r| !r.once);
            if list.is_empty() {
                map.remove(event_type);
            }
            snapshot
        };

        for (id, listener) in &snapshot {
            if let Err(e) = listener.signal_event(event_type, payload).await {
                tracing::warn!(event_type, listener_id = id, error = %e, "Signal listener failed");
            }
        }
        snapshot.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventListener for Recorder {
        async fn signal_event(&self, event_type: &str, payload: &Value) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{event_type}:{payload}", self.name));
            Ok(())
        }
    }

    /// Removes `target` from the manager when signalled.
    struct Remover {
        manager: Arc<SignalManager>,
        target: Mutex<Option<ListenerId>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventListener for Remover {
        async fn signal_event(&self, event_type: &str, _payload: &Value) -> Result<()> {
            if let Some(id) = *self.target.lock().unwrap() {
                self.manager.remove_event_listener(event_type, id);
            }
            self.log.lock().unwrap().push("remover".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delivers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = SignalManager::new();
        for name in ["a", "b", "c"] {
            manager.add_event_listener("go", Arc::new(Recorder { name, log: log.clone() }));
        }
        manager.add_event_listener("other", Arc::new(Recorder { name: "x", log: log.clone() }));

        assert_eq!(manager.signal_event("go", &json!(1)).await, 3);
        assert_eq!(*log.lock().unwrap(), vec!["a:go:1", "b:go:1", "c:go:1"]);
        assert_eq!(manager.signal_event("missing", &json!(null)).await, 0);
    }

    #[tokio::test]
    async fn test_one_shot_and_removal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = SignalManager::new();
        let keep = manager.add_event_listener(
            "go",
            Arc::new(Recorder {
                name: "keep",
                log: log.clone(),
            }),
        );
        manager.add_one_shot_listener(
            "go",
            Arc::new(Recorder {
                name: "once",
                log: log.clone(),
            }),
        );

        manager.signal_event("go", &json!("p")).await;
        manager.signal_event("go", &json!("q")).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["keep:go:\"p\"", "once:go:\"p\"", "keep:go:\"q\""]
        );

        assert!(manager.remove_event_listener("go", keep));
        assert!(!manager.remove_event_listener("go", keep));
        assert_eq!(manager.listener_count("go"), 0);
    }

    #[tokio::test]
    async fn test_removal_during_dispatch_uses_snapshot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = Arc::new(SignalManager::new());
        let remover = Arc::new(Remover {
            manager: manager.clone(),
            target: Mutex::new(None),
            log: log.clone(),
        });
        manager.add_event_listener("go", remover.clone());
        let victim = manager.add_event_listener(
            "go",
            Arc::new(Recorder {
                name: "victim",
                log: log.clone(),
            }),
        );
        *remover.target.lock().unwrap() = Some(victim);

        // The snapshot still reaches the victim on this delivery.
        assert_eq!(manager.signal_event("go", &json!(0)).await, 2);
        assert_eq!(manager.listener_count("go"), 1);
        assert_eq!(manager.signal_event("go", &json!(0)).await, 1);
        assert_eq!(log.lock().unwrap().len(), 3);
    }
}
