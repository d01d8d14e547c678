mod common;

use common::{harness, vars, Harness};
use procflow_core::definition::DataMapping;
use procflow_core::workitem::{
    FnWorkItemHandler, HumanTaskHandler, IdentityPolicy, LifeCycle, Policy, StaticIdentity,
    Transition, WorkItem, WorkItemHandler, CLAIM, COMPLETE, PARAM_ACTOR_ID, RELEASE, SKIP,
};
use procflow_core::{
    NodeKind, ProcessDefinition, ProcessError, ProcessEvent, ProcessInstanceId, ProcessRuntime,
    ProcessState, WorkItemId, WorkItemPhase,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn review(actors: &str) -> ProcessDefinition {
    let mut parameters = BTreeMap::new();
    parameters.insert(PARAM_ACTOR_ID.to_string(), json!(actors));
    parameters.insert("TaskName".to_string(), json!("Review claim"));
    ProcessDefinition::builder("review")
        .node(1, "start", NodeKind::start())
        .node(
            2,
            "review",
            NodeKind::WorkItem {
                work_type: HumanTaskHandler::NAME.into(),
                parameters,
                inputs: vec![DataMapping::new("claim", "Claim")],
                outputs: vec![DataMapping::new("Outcome", "outcome")],
            },
        )
        .node(3, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .build()
        .unwrap()
}

fn user(name: &str) -> Vec<Arc<dyn Policy>> {
    vec![Arc::new(IdentityPolicy::new(name, Vec::<String>::new()))]
}

async fn started(h: &Harness) -> (ProcessInstanceId, WorkItemId) {
    let id = h
        .runtime
        .start_process("review", vars(json!({"claim": 42})))
        .await
        .unwrap();
    let items = h.runtime.work_items(id).await.unwrap();
    assert_eq!(items.len(), 1);
    (id, items[0].id)
}

async fn phase(rt: &ProcessRuntime, id: ProcessInstanceId, wi: WorkItemId) -> WorkItemPhase {
    rt.get_instance(id)
        .await
        .unwrap()
        .work_item(wi)
        .map(|w| w.phase.clone())
        .expect("work item present")
}

#[tokio::test]
async fn test_work_item_created_active_with_mapped_inputs() {
    let h = harness(vec![review("mary,john")]);
    let (id, wi) = started(&h).await;

    let pi = h.runtime.get_instance(id).await.unwrap();
    let item = pi.work_item(wi).unwrap();
    assert_eq!(item.phase, WorkItemPhase::Activated);
    assert_eq!(item.name, "Review claim");
    assert_eq!(item.parameters.get("Claim"), Some(&json!(42)));
    assert_eq!(item.potential_users, vec!["mary".to_string(), "john".to_string()]);
    assert_eq!(pi.active_nodes(), vec![2]);
}

#[tokio::test]
async fn test_claim_release_claim_complete() {
    let h = harness(vec![review("mary,john")]);
    let rt = &h.runtime;
    let (id, wi) = started(&h).await;

    rt.transition_work_item(id, wi, Transition::new(CLAIM).with_policies(user("mary")))
        .await
        .unwrap();
    assert_eq!(phase(rt, id, wi).await, WorkItemPhase::Reserved);

    rt.transition_work_item(id, wi, Transition::new(RELEASE).with_policies(user("mary")))
        .await
        .unwrap();
    assert_eq!(phase(rt, id, wi).await, WorkItemPhase::Activated);

    rt.transition_work_item(id, wi, Transition::new(CLAIM).with_policies(user("john")))
        .await
        .unwrap();
    let owner = rt
        .get_instance(id)
        .await
        .unwrap()
        .work_item(wi)
        .and_then(|w| w.actual_owner.clone());
    assert_eq!(owner.as_deref(), Some("john"));

    let record = rt
        .complete_work_item(id, wi, vars(json!({"Outcome": "approved"})), user("john"))
        .await
        .unwrap();
    assert_eq!(record.to, WorkItemPhase::Completed);
    assert!(record.terminal);
    assert_eq!(record.identity.as_deref(), Some("john"));

    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Completed);
    assert!(pi.work_item(wi).is_none());
    assert_eq!(pi.variables().get("outcome"), Some(&json!("approved")));

    let transitions: Vec<String> = h
        .events
        .events_for(id)
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::WorkItemTransitioned { transition, .. } => Some(transition.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(transitions, vec!["activate", "claim", "release", "claim", "complete"]);
}

#[tokio::test]
async fn test_complete_without_claim_is_illegal() {
    let h = harness(vec![review("mary")]);
    let rt = &h.runtime;
    let (id, wi) = started(&h).await;

    let err = rt
        .complete_work_item(id, wi, BTreeMap::new(), user("mary"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::IllegalTransition { .. }));

    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Active, "rejection is not a failure");
    assert_eq!(phase(rt, id, wi).await, WorkItemPhase::Activated);
}

#[tokio::test]
async fn test_not_authorized_leaves_phase_unchanged() {
    let h = harness(vec![review("mary")]);
    let rt = &h.runtime;
    let (id, wi) = started(&h).await;
    h.events.clear();

    let err = rt
        .transition_work_item(id, wi, Transition::new(CLAIM).with_policies(user("mallory")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessError::NotAuthorized { ref identity, .. } if identity == "mallory"
    ));
    assert_eq!(phase(rt, id, wi).await, WorkItemPhase::Activated);
    assert!(h.events.events().is_empty());

    rt.transition_work_item(id, wi, Transition::new(CLAIM).with_policies(user("mary")))
        .await
        .unwrap();
    let err = rt
        .complete_work_item(id, wi, BTreeMap::new(), user("john"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::NotAuthorized { .. }));
    assert_eq!(phase(rt, id, wi).await, WorkItemPhase::Reserved);
}

#[tokio::test]
async fn test_configured_identity_applies_when_no_policy_given() {
    let definitions = procflow_core::DefinitionRegistry::new();
    definitions.register(review("mary")).unwrap();
    let rt = ProcessRuntime::builder()
        .definitions(Arc::new(definitions))
        .identity(Arc::new(StaticIdentity::new("mary", ["reviewers"])))
        .build();
    let id = rt
        .start_process("review", vars(json!({"claim": 1})))
        .await
        .unwrap();
    let wi = rt.work_items(id).await.unwrap()[0].id;

    let record = rt
        .transition_work_item(id, wi, Transition::new(CLAIM))
        .await
        .unwrap();
    assert_eq!(record.identity.as_deref(), Some("mary"));

    let err = rt
        .transition_work_item(id, wi, Transition::new(COMPLETE).with_policies(user("eve")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::NotAuthorized { .. }));
}

#[tokio::test]
async fn test_skip_and_abort_continue_the_process() {
    let h = harness(vec![review("mary")]);
    let rt = &h.runtime;

    let (skipped, wi) = started(&h).await;
    rt.transition_work_item(skipped, wi, Transition::new(SKIP).with_policies(user("mary")))
        .await
        .unwrap();
    let pi = rt.get_instance(skipped).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Completed);
    assert!(pi.variables().get("outcome").is_none());

    let (aborted, wi) = started(&h).await;
    let record = rt.abort_work_item(aborted, wi, user("mary")).await.unwrap();
    assert_eq!(record.to, WorkItemPhase::Aborted);
    assert_eq!(rt.get_instance(aborted).await.unwrap().state(), ProcessState::Completed);
}

#[tokio::test]
async fn test_aborting_instance_aborts_open_work_items() {
    let h = harness(vec![review("mary")]);
    let rt = &h.runtime;
    let (id, wi) = started(&h).await;

    rt.abort(id).await.unwrap();
    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Aborted);
    assert!(pi.work_items().next().is_none());
    let aborted = h.events.events_for(id).iter().any(|e| {
        matches!(e, ProcessEvent::WorkItemTransitioned { work_item_id, to, .. }
            if *work_item_id == wi && to == "Aborted")
    });
    assert!(aborted);
}

/// Answers every abort with a `complete` carrying a result.
struct CompletesOnAbort;

impl WorkItemHandler for CompletesOnAbort {
    fn name(&self) -> &str {
        "Stubborn"
    }

    fn lifecycle(&self) -> Arc<LifeCycle> {
        Arc::new(LifeCycle::default_lifecycle())
    }

    fn abort(&self, _work_item: &WorkItem, _transition: &Transition) -> Option<Transition> {
        let mut results = BTreeMap::new();
        results.insert("outcome".to_string(), json!("done anyway"));
        Some(Transition::new(COMPLETE).with_data(results))
    }
}

#[tokio::test]
async fn test_follow_up_of_aborted_work_item_is_not_applied() {
    let def = ProcessDefinition::builder("stubborn")
        .node(1, "start", NodeKind::start())
        .node(
            2,
            "task",
            NodeKind::WorkItem {
                work_type: "Stubborn".into(),
                parameters: BTreeMap::new(),
                inputs: Vec::new(),
                outputs: vec![DataMapping::new("outcome", "outcome")],
            },
        )
        .node(3, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;
    rt.register_work_item_handler("Stubborn", Arc::new(CompletesOnAbort));
    let id = rt.start_process("stubborn", BTreeMap::new()).await.unwrap();
    assert_eq!(rt.work_items(id).await.unwrap().len(), 1);

    rt.abort(id).await.unwrap();
    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Aborted);
    assert!(pi.work_items().next().is_none());
    assert_eq!(pi.variables().get("outcome"), None);
    let completed = h.events.events_for(id).iter().any(|e| {
        matches!(e, ProcessEvent::WorkItemTransitioned { to, .. } if to == "Completed")
    });
    assert!(!completed);
}

#[tokio::test]
async fn test_automatic_handler_completes_inline() {
    let def = ProcessDefinition::builder("score")
        .node(1, "start", NodeKind::start())
        .node(
            2,
            "score",
            NodeKind::WorkItem {
                work_type: "Scoring".into(),
                parameters: BTreeMap::new(),
                inputs: vec![DataMapping::new("income", "income")],
                outputs: vec![DataMapping::new("score", "score")],
            },
        )
        .node(3, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;
    rt.register_work_item_handler(
        "Scoring",
        Arc::new(FnWorkItemHandler::new("Scoring", |wi| {
            let income = wi.parameters.get("income").and_then(|v| v.as_i64()).unwrap_or(0);
            let mut results = BTreeMap::new();
            results.insert("score".to_string(), json!(income / 1000));
            Some(results)
        })),
    );

    let id = rt
        .start_process("score", vars(json!({"income": 52000})))
        .await
        .unwrap();
    let pi = rt.get_instance(id).await.unwrap();
    assert_eq!(pi.state(), ProcessState::Completed);
    assert_eq!(pi.variables().get("score"), Some(&json!(52)));
}

#[tokio::test]
async fn test_unknown_work_type_fails_the_instance() {
    let def = ProcessDefinition::builder("orphan")
        .node(1, "start", NodeKind::start())
        .node(2, "task", NodeKind::work_item("Nobody"))
        .node(3, "end", NodeKind::end())
        .connect(1, 2)
        .connect(2, 3)
        .build()
        .unwrap();
    let h = harness(vec![def]);
    let rt = &h.runtime;
    let id = rt.create_instance("orphan", BTreeMap::new(), None).await.unwrap();

    let err = rt.start_instance(id).await.unwrap_err();
    assert!(matches!(err, ProcessError::UnknownWorkItemHandler(ref t) if t == "Nobody"));
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Error);

    rt.register_work_item_handler(
        "Nobody",
        Arc::new(FnWorkItemHandler::new("Nobody", |_| Some(BTreeMap::new()))),
    );
    let pi = rt.get_instance(id).await.unwrap();
    let failed = pi.error().and_then(|e| e.node_instance_id).unwrap();
    rt.retrigger_node_instance(id, failed).await.unwrap();
    assert_eq!(rt.get_instance(id).await.unwrap().state(), ProcessState::Completed);
}
