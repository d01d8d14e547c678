mod common;

use common::{entered, harness, vars};
use procflow_core::constraint::Constraint;
use procflow_core::definition::{BoundaryTrigger, GatewayKind, StartTrigger, TimerDefinition};
use procflow_core::jobs::{JobFire, JobTarget};
use procflow_core::{NodeKind, ProcessDefinition, ProcessState};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

fn reminder(timer: TimerDefinition) -> ProcessDefinition {
    ProcessDefinition::builder("reminder")
        .node(1, "start", NodeKind::start())
        .node(2, "wait", NodeKind::timer(timer))
        .node(3, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_timer_node_fires_after_duration() {
    let h = harness(vec![reminder(TimerDefinition::duration("1h"))]);
    let rt = &h.runtime;
    rt.init().await.unwrap();
    let id = rt.start_process("reminder", BTreeMap::new()).await.unwrap();

    let job = rt.get_instance(id).await.unwrap().node_instances()[0].data.job_id().unwrap();
    assert!(h.jobs.is_scheduled(job));

    tokio::time::sleep(59 * MINUTE).await;
    assert_eq!(rt.get_instance(id).await.unwrap().active_nodes(), vec![2]);

    tokio::time::sleep(2 * MINUTE).await;
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
    assert!(!h.jobs.is_scheduled(job));
    rt.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_expression_reads_variables() {
    let h = harness(vec![reminder(TimerDefinition::duration("#{delay}"))]);
    let rt = &h.runtime;
    rt.init().await.unwrap();
    let id = rt
        .start_process("reminder", vars(json!({"delay": "PT5M"})))
        .await
        .unwrap();

    tokio::time::sleep(6 * MINUTE).await;
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
    rt.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cycle_timer_continues_on_every_fire() {
    let h = harness(vec![reminder(TimerDefinition::cycle("R3/PT10M"))]);
    let rt = &h.runtime;
    rt.init().await.unwrap();
    let id = rt.start_process("reminder", BTreeMap::new()).await.unwrap();
    let ends = || {
        entered(&h.events.events_for(id))
            .into_iter()
            .filter(|n| *n == 3)
            .count()
    };

    tokio::time::sleep(5 * MINUTE).await;
    assert_eq!(ends(), 1);
    assert_eq!(rt.get_instance(id).await.unwrap().active_nodes(), vec![2]);

    tokio::time::sleep(20 * MINUTE).await;
    assert_eq!(ends(), 3);
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
    rt.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_node_instance_cancels_job_and_late_fire_is_ignored() {
    let def = ProcessDefinition::builder("race")
        .node(1, "start", NodeKind::start())
        .node(2, "fork", NodeKind::Split { gateway: GatewayKind::And })
        .node(3, "deadline", NodeKind::timer(TimerDefinition::duration("PT1H")))
        .node(4, "timed out", NodeKind::end())
        .node(5, "reply", NodeKind::catch_event("reply"))
        .node(6, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .connect(2, 5)
        .connect(3, 4)
        .connect(5, 6)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;
    let id = rt.start_process("race", BTreeMap::new()).await.unwrap();

    let pi = rt.get_instance(id).await.unwrap();
    let timer = pi.node_instances().iter().find(|ni| ni.node_id == 3).unwrap().clone();
    let job_id = timer.data.job_id().unwrap();
    assert!(h.jobs.is_scheduled(job_id));

    rt.cancel_node_instance(id, timer.id).await.unwrap();
    assert!(!h.jobs.is_scheduled(job_id));
    assert_eq!(rt.get_instance(id).await.unwrap().active_nodes(), vec![5]);

    let late = JobFire {
        job_id,
        target: JobTarget::ProcessInstance {
            process_id: "race".into(),
            process_instance_id: id,
            node_instance_id: timer.id,
            node_id: 3,
        },
        fire_count: 1,
        last: true,
    };
    rt.job_fired(late.clone()).await.unwrap();
    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.active_nodes(), vec![5]);
    assert!(!entered(&h.events.events_for(id)).contains(&4));

    rt.signal_process_instance(id, "reply", json!(null)).await.unwrap();
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);

    // Fires for finished instances are dropped as well.
    rt.job_fired(late).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_fire_during_error_is_replayed_on_recovery() {
    let def = ProcessDefinition::builder("settle")
        .node(1, "start", NodeKind::start())
        .node(2, "fork", NodeKind::Split { gateway: GatewayKind::And })
        .node(3, "cool off", NodeKind::timer(TimerDefinition::duration("PT1H")))
        .node(4, "cooled", NodeKind::end())
        .node(5, "size", NodeKind::Split { gateway: GatewayKind::Xor })
        .node(6, "large", NodeKind::set("category", "large"))
        .node(7, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .connect(2, 5)
        .connect(3, 4)
        .connect_when(5, 6, 1, Constraint::parse("amount >= 100").unwrap())
        .connect(6, 7)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;
    rt.init().await.unwrap();
    let id = rt
        .create_instance("settle", vars(json!({"amount": 50})), None)
        .await
        .unwrap();
    assert!(rt.start_instance(id).await.is_err());

    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Error);
    let failed = pi.error().and_then(|e| e.node_instance_id).unwrap();
    let job = pi
        .node_instances()
        .iter()
        .find(|ni| ni.node_id == 3)
        .and_then(|ni| ni.data.job_id())
        .unwrap();

    tokio::time::sleep(120 * MINUTE).await;
    assert!(!h.jobs.is_scheduled(job));
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Error);

    rt.update_variables(id, vars(json!({"amount": 150}))).await.unwrap();
    rt.retrigger_node_instance(id, failed).await.unwrap();

    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Completed);
    assert!(pi.node_instances().is_empty());
    assert!(entered(&h.events.events_for(id)).contains(&4));
    rt.shutdown().await.unwrap();
}

fn escalation(cancel_activity: bool) -> ProcessDefinition {
    ProcessDefinition::builder("escalation")
        .node(1, "start", NodeKind::start())
        .node(2, "answer", NodeKind::catch_event("answer"))
        .node(
            3,
            "overdue",
            NodeKind::Boundary {
                attached_to: 2,
                trigger: BoundaryTrigger::Timer(TimerDefinition::duration("30m")),
                cancel_activity,
            },
        )
        .node(4, "escalate", NodeKind::catch_event("escalation handled"))
        .node(5, "end", NodeKind::end())
        .node(6, "escalation end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 5)
        .connect(3, 4)
        .connect(4, 6)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_interrupting_boundary_timer_cancels_host() {
    let h = harness(vec![escalation(true)]);
    let rt = &h.runtime;
    rt.init().await.unwrap();
    let id = rt.start_process("escalation", BTreeMap::new()).await.unwrap();
    assert_eq!(rt.get_instance(id).await.unwrap().active_nodes(), vec![2]);
    assert_eq!(rt.signals().listener_count("answer"), 1);

    tokio::time::sleep(31 * MINUTE).await;
    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.active_nodes(), vec![4]);
    assert_eq!(rt.signals().listener_count("answer"), 0);

    rt.signal_event("escalation handled", json!(null)).await;
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
    rt.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_completed_host_disarms_boundary_timer() {
    let h = harness(vec![escalation(true)]);
    let rt = &h.runtime;
    rt.init().await.unwrap();
    let id = rt.start_process("escalation", BTreeMap::new()).await.unwrap();
    let boundary_job = rt
        .get_instance(id)
        .await
        .unwrap()
        .node_instances()
        .iter()
        .find(|ni| ni.node_id == 3)
        .and_then(|ni| ni.data.job_id())
        .unwrap();

    rt.signal_event("answer", json!(null)).await;
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
    assert!(!h.jobs.is_scheduled(boundary_job));

    tokio::time::sleep(60 * MINUTE).await;
    assert!(!entered(&h.events.events_for(id)).contains(&4));
    rt.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_non_interrupting_boundary_keeps_host_waiting() {
    let h = harness(vec![escalation(false)]);
    let rt = &h.runtime;
    rt.init().await.unwrap();
    let id = rt.start_process("escalation", BTreeMap::new()).await.unwrap();

    tokio::time::sleep(31 * MINUTE).await;
    let mut active = rt.get_instance(id).await.unwrap().active_nodes();
    active.sort();
    assert_eq!(active, vec![2, 4]);

    rt.signal_event("answer", json!(null)).await;
    rt.signal_event("escalation handled", json!(null)).await;
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
    rt.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_start_creates_an_instance_per_fire() {
    let def = ProcessDefinition::builder("nightly")
        .node(
            1,
            "every hour",
            NodeKind::Start {
                trigger: StartTrigger::Timer(TimerDefinition::cycle("R2/PT1H")),
            },
        )
        .node(2, "end", NodeKind::end())
        .connect(1, 2)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;
    rt.init().await.unwrap();

    tokio::time::sleep(30 * MINUTE).await;
    assert_eq!(rt.instances("nightly").await.unwrap().len(), 1);

    tokio::time::sleep(3 * 60 * MINUTE).await;
    let instances = rt.instances("nightly").await.unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.state() == ProcessState::Completed));
    rt.shutdown().await.unwrap();
}
