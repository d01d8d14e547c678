#![allow(dead_code)]

use procflow_core::jobs::InMemoryJobService;
use procflow_core::store_memory::MemoryEventPublisher;
use procflow_core::{ProcessDefinition, ProcessEvent, ProcessRuntime, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Harness {
    pub runtime: ProcessRuntime,
    pub events: Arc<MemoryEventPublisher>,
    pub jobs: Arc<InMemoryJobService>,
}

pub fn harness(definitions: Vec<ProcessDefinition>) -> Harness {
    let events = Arc::new(MemoryEventPublisher::new());
    let (service, fires) = InMemoryJobService::channel();
    let jobs = Arc::new(service);
    let runtime = ProcessRuntime::builder()
        .publisher(events.clone())
        .jobs(jobs.clone(), fires)
        .build();
    for def in definitions {
        runtime.register_definition(def).unwrap();
    }
    Harness {
        runtime,
        events,
        jobs,
    }
}

pub fn vars(value: Value) -> BTreeMap<String, Value> {
    serde_json::from_value(value).unwrap()
}

/// Node ids that were entered, in order.
pub fn entered(events: &[ProcessEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::NodeEntered { node_id, .. } => Some(*node_id),
            _ => None,
        })
        .collect()
}
