mod common;

use common::{entered, harness, vars};
use procflow_core::definition::{GatewayKind, SignalScope, StartTrigger};
use procflow_core::{NodeKind, ProcessDefinition, ProcessError, ProcessState};
use serde_json::json;
use std::collections::BTreeMap;

fn approval() -> ProcessDefinition {
    ProcessDefinition::builder("approval")
        .node(1, "start", NodeKind::start())
        .node(
            2,
            "wait for approval",
            NodeKind::CatchEvent {
                event_type: "approved".into(),
                variable: Some("decision".into()),
            },
        )
        .node(3, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_signal_completes_waiting_instance() {
    let h = harness(vec![approval()]);
    let rt = &h.runtime;
    let id = rt.start_process("approval", BTreeMap::new()).await.unwrap();

    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Active);
    assert_eq!(pi.active_nodes(), vec![2]);

    assert_eq!(rt.signal_event("approved", json!("yes")).await, 1);

    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Completed);
    assert!(pi.node_instances().is_empty());
    assert_eq!(pi.variables().get("decision"), Some(&json!("yes")));
    assert_eq!(entered(&h.events.events_for(id)), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unrelated_signal_changes_nothing() {
    let h = harness(vec![approval()]);
    let rt = &h.runtime;
    let id = rt.start_process("approval", BTreeMap::new()).await.unwrap();

    assert_eq!(rt.signal_event("rejected", json!(null)).await, 0);
    rt.signal_process_instance(id, "rejected", json!(null)).await.unwrap();
    assert_eq!(rt.get_instance(id).await.unwrap().active_nodes(), vec![2]);
}

#[tokio::test]
async fn test_instance_signal_reaches_only_its_target() {
    let h = harness(vec![approval()]);
    let rt = &h.runtime;
    let a = rt.start_process("approval", BTreeMap::new()).await.unwrap();
    let b = rt.start_process("approval", BTreeMap::new()).await.unwrap();

    rt.signal_process_instance(a, "approved", json!("a only")).await.unwrap();

    assert_eq!(rt.get_instance(a).await.unwrap().state(), ProcessState::Completed);
    let other = rt.get_instance(b).await.unwrap();
    assert_eq!(other.state(), ProcessState::Active);
    assert!(other.variables().get("decision").is_none());
    assert_eq!(rt.signals().listener_count("approved"), 1);
}

#[tokio::test]
async fn test_broadcast_wakes_every_waiting_instance() {
    let h = harness(vec![approval()]);
    let rt = &h.runtime;
    let ids = [
        rt.start_process("approval", BTreeMap::new()).await.unwrap(),
        rt.start_process("approval", BTreeMap::new()).await.unwrap(),
        rt.start_process("approval", BTreeMap::new()).await.unwrap(),
    ];

    assert_eq!(rt.signal_event("approved", json!(true)).await, 3);
    for id in ids {
        assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
    }
}

#[tokio::test]
async fn test_instance_scoped_throw_is_caught_within_same_operation() {
    let def = ProcessDefinition::builder("ping")
        .node(1, "start", NodeKind::start())
        .node(2, "fork", NodeKind::Split { gateway: GatewayKind::And })
        .node(
            3,
            "catch",
            NodeKind::CatchEvent {
                event_type: "ping".into(),
                variable: Some("got".into()),
            },
        )
        .node(
            4,
            "throw",
            NodeKind::ThrowEvent {
                event_type: "ping".into(),
                scope: SignalScope::ProcessInstance,
                source: Some("message".into()),
            },
        )
        .node(5, "join", NodeKind::Join { gateway: GatewayKind::And })
        .node(6, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .connect(2, 4)
        .connect(3, 5)
        .connect(4, 5)
        .connect(5, 6)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;

    let id = rt
        .start_process("ping", vars(json!({"message": "hello"})))
        .await
        .unwrap();
    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Completed);
    assert_eq!(pi.variables().get("got"), Some(&json!("hello")));
}

#[tokio::test]
async fn test_default_scope_throw_reaches_other_instances() {
    let thrower = ProcessDefinition::builder("thrower")
        .node(1, "start", NodeKind::start())
        .node(
            2,
            "announce",
            NodeKind::ThrowEvent {
                event_type: "approved".into(),
                scope: SignalScope::Default,
                source: Some("verdict".into()),
            },
        )
        .node(3, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .build()
        .unwrap();
    let h = harness(vec![approval(), thrower]);
    let rt = &h.runtime;
    let waiting = rt.start_process("approval", BTreeMap::new()).await.unwrap();

    let throwing = rt
        .start_process("thrower", vars(json!({"verdict": "ok"})))
        .await
        .unwrap();

    assert_eq!(rt.get_instance(throwing).await.unwrap().state(), ProcessState::Completed);
    let pi = rt.get_instance(waiting).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Completed);
    assert_eq!(pi.variables().get("decision"), Some(&json!("ok")));
}

#[tokio::test]
async fn test_signal_start_creates_instance_after_init() {
    let def = ProcessDefinition::builder("on-order")
        .node(
            1,
            "order received",
            NodeKind::Start {
                trigger: StartTrigger::Signal {
                    event_type: "order".into(),
                    variable: Some("order".into()),
                },
            },
        )
        .node(2, "end", NodeKind::end())
        .connect(1, 2)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;

    assert_eq!(rt.signal_event("order", json!({"id": 1})).await, 0);
    rt.init().await.unwrap();
    rt.init().await.unwrap();
    assert_eq!(rt.signals().listener_count("order"), 1);

    assert_eq!(rt.signal_event("order", json!({"id": 7})).await, 1);
    let instances = rt.instances("on-order").await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state(), ProcessState::Completed);
    assert_eq!(instances[0].variables().get("order"), Some(&json!({"id": 7})));

    rt.shutdown().await.unwrap();
    assert_eq!(rt.signals().listener_count("order"), 0);
}

#[tokio::test]
async fn test_signal_to_unknown_instance_fails() {
    let h = harness(vec![approval()]);
    let err = h
        .runtime
        .signal_process_instance(uuid::Uuid::now_v7(), "approved", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::ProcessInstanceNotFound(_)));
}
