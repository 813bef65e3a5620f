use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chainfury_engine::{
    AbortCause, Action, ActionContext, ActionRegistry, ChainExecutor, EngineConfig, FnAction, RunOptions, parse_chain_str,
};
use chainfury_types::{ActionSchema, ChainDefinition, FailurePolicy, FieldSpec, FieldType, InputBinding, NodeDefinition, NodeStatus, OutputTarget, RunStatus};
use chainfury_util::text_processing::REDACTED;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use tokio_util::sync::CancellationToken;

/// Sleeps for `config.delay_ms`, ignoring cancellation, then returns `config.value`.
struct SleepAction;

#[async_trait]
impl Action for SleepAction {
    async fn invoke(&self, config: &JsonMap<String, JsonValue>, _inputs: &JsonMap<String, JsonValue>, _ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        let delay_ms = config.get("delay_ms").and_then(JsonValue::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(json!({ "value": config.get("value").cloned().unwrap_or(JsonValue::Null) }))
    }
}

/// Waits up to `config.delay_ms` but gives up as soon as its token is cancelled.
struct CancellableWaitAction;

#[async_trait]
impl Action for CancellableWaitAction {
    async fn invoke(&self, config: &JsonMap<String, JsonValue>, _inputs: &JsonMap<String, JsonValue>, ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        let delay_ms = config.get("delay_ms").and_then(JsonValue::as_u64).unwrap_or(0);
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(anyhow::anyhow!("wait interrupted")),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(json!({ "value": "waited" })),
        }
    }
}

/// Records which nodes invoked it.
struct CountingAction {
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Action for CountingAction {
    async fn invoke(&self, _config: &JsonMap<String, JsonValue>, _inputs: &JsonMap<String, JsonValue>, ctx: &ActionContext) -> anyhow::Result<JsonValue> {
        self.calls.lock().expect("calls lock").push(ctx.node_id.clone());
        Ok(json!({ "value": ctx.node_id }))
    }
}

fn registry_with(calls: Arc<Mutex<Vec<String>>>) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry
        .register(
            "emit",
            ActionSchema::new("returns its config").output("x", FieldSpec::optional(FieldType::Integer)),
            FnAction::new(|config, _| Ok(JsonValue::Object(config.clone()))),
        )
        .expect("emit");
    registry
        .register(
            "double",
            ActionSchema::new("doubles x")
                .input("x", FieldSpec::required(FieldType::Integer))
                .output("y", FieldSpec::optional(FieldType::Integer)),
            FnAction::new(|_, inputs| {
                let x = inputs.get("x").and_then(JsonValue::as_i64).unwrap_or_default();
                Ok(json!({ "y": x * 2 }))
            }),
        )
        .expect("double");
    registry
        .register(
            "pass",
            ActionSchema::new("forwards y").input("y", FieldSpec::required(FieldType::Any)),
            FnAction::new(|_, inputs| Ok(json!({ "value": inputs.get("y").cloned().unwrap_or(JsonValue::Null) }))),
        )
        .expect("pass");
    registry
        .register(
            "fail",
            ActionSchema::new("always fails").with_additional_inputs(),
            FnAction::new(|_, _| Err(anyhow::anyhow!("intentional failure"))),
        )
        .expect("fail");
    registry.register("sleep", ActionSchema::new("sleeps").with_additional_inputs(), SleepAction).expect("sleep");
    registry
        .register("wait", ActionSchema::new("waits until cancelled").with_additional_inputs(), CancellableWaitAction)
        .expect("wait");
    registry
        .register("count", ActionSchema::new("counts invocations").with_additional_inputs(), CountingAction { calls })
        .expect("count");
    registry
        .register(
            "echo",
            ActionSchema::new("echo").with_additional_inputs(),
            FnAction::new(|_, inputs| Ok(JsonValue::Object(inputs.clone()))),
        )
        .expect("echo");
    registry
}

fn executor() -> ChainExecutor {
    ChainExecutor::new(Arc::new(registry_with(Arc::default())), EngineConfig::default())
}

fn abc_chain() -> ChainDefinition {
    parse_chain_str(include_str!("data/abc_chain.yaml")).expect("fixture chain")
}

fn node(id: &str, action_type: &str, reads_from: &[&str]) -> NodeDefinition {
    NodeDefinition {
        id: id.into(),
        action_type: action_type.into(),
        input_bindings: reads_from
            .iter()
            .map(|upstream| (format!("from_{upstream}"), InputBinding::node_output(*upstream, "value")))
            .collect(),
        ..Default::default()
    }
}

fn statuses(entries: &[chainfury_types::TraceEntry]) -> Vec<(&str, NodeStatus)> {
    entries.iter().map(|entry| (entry.node_id.as_str(), entry.status)).collect()
}

#[tokio::test]
async fn linear_chain_produces_mapped_output() {
    let run = executor().run(&abc_chain(), JsonMap::new(), RunOptions::default()).await.expect("run");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(JsonValue::Object(run.final_outputs.clone()), json!({"result": 2}));
    assert_eq!(
        statuses(run.trace.entries()),
        vec![("A", NodeStatus::Succeeded), ("B", NodeStatus::Succeeded), ("C", NodeStatus::Succeeded)]
    );
    assert_eq!(run.trace.get("B").and_then(|entry| entry.inputs.clone()), json!({"x": 1}).as_object().cloned());
    assert!(run.warnings.is_empty());
}

#[tokio::test]
async fn abort_policy_stops_after_failure() {
    let mut chain = abc_chain();
    chain.nodes[1].action_type = "fail".into();

    let error = executor().run(&chain, JsonMap::new(), RunOptions::default()).await.expect_err("aborted");

    assert_eq!(error.failed_node(), Some("B"));
    assert!(matches!(error.cause, AbortCause::NodeFailed { .. }));
    let run = &error.run;
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(
        statuses(run.trace.entries()),
        vec![("A", NodeStatus::Succeeded), ("B", NodeStatus::Failed), ("C", NodeStatus::Skipped)]
    );
    assert!(!run.final_outputs.contains_key("result"));
    let skipped = run.trace.get("C").and_then(|entry| entry.error.clone()).expect("skip reason");
    assert_eq!(skipped.kind, "dependency_failed");
}

#[tokio::test]
async fn abort_marks_dependents_and_other_pending_nodes_differently() {
    let chain = ChainDefinition {
        id: "wide".into(),
        nodes: vec![
            node("a", "count", &[]),
            node("d", "count", &[]),
            node("x", "fail", &["a"]),
            node("e", "count", &["d"]),
            node("c", "count", &["x"]),
            node("g", "count", &["e"]),
            node("h", "count", &["c"]),
        ],
        ..Default::default()
    };

    let error = executor().run(&chain, JsonMap::new(), RunOptions::default()).await.expect_err("aborted");
    let trace = &error.run.trace;

    assert_eq!(trace.status_of("e"), Some(NodeStatus::Succeeded), "sibling in the failing layer finishes");
    for dependent in ["c", "h"] {
        let entry = trace.get(dependent).expect("dependent entry");
        assert_eq!(entry.status, NodeStatus::Skipped);
        assert_eq!(entry.error.as_ref().map(|error| error.kind.as_str()), Some("dependency_failed"));
        assert!(entry.started_at.is_none());
    }
    let unrelated = trace.get("g").expect("unrelated entry");
    assert_eq!(unrelated.status, NodeStatus::Skipped);
    assert_eq!(unrelated.error.as_ref().map(|error| error.kind.as_str()), Some("aborted"));
}

#[tokio::test]
async fn continue_policy_runs_independent_nodes() {
    let mut chain = abc_chain();
    chain.nodes[1].action_type = "fail".into();
    chain.failure_policy = Some(FailurePolicy::Continue);
    chain.nodes.push(NodeDefinition {
        id: "D".into(),
        action_type: "emit".into(),
        config: json!({"x": 7}).as_object().cloned().unwrap_or_default(),
        ..Default::default()
    });
    chain.output_mapping.insert("d".into(), OutputTarget::new("D", "x"));

    let run = executor().run(&chain, JsonMap::new(), RunOptions::default()).await.expect("completed");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.trace.status_of("D"), Some(NodeStatus::Succeeded));
    assert_eq!(run.trace.status_of("B"), Some(NodeStatus::Failed));
    assert_eq!(run.trace.status_of("C"), Some(NodeStatus::Skipped));
    assert_eq!(JsonValue::Object(run.final_outputs.clone()), json!({"d": 7}));
    assert_eq!(run.warnings.len(), 1);
    assert_eq!(run.warnings[0].output, "result");
}

#[tokio::test]
async fn continue_policy_invokes_each_resolvable_node_once() {
    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let executor = ChainExecutor::new(Arc::new(registry_with(Arc::clone(&calls))), EngineConfig::default());
    let chain = ChainDefinition {
        id: "fanout".into(),
        nodes: vec![
            node("broken", "fail", &[]),
            node("s1", "count", &[]),
            node("s2", "count", &[]),
            node("t", "count", &["s1"]),
            node("u", "count", &["broken"]),
            node("v", "count", &["u", "s2"]),
        ],
        failure_policy: Some(FailurePolicy::Continue),
        ..Default::default()
    };

    let run = executor.run(&chain, JsonMap::new(), RunOptions::default()).await.expect("completed");

    let mut invoked = calls.lock().expect("calls lock").clone();
    invoked.sort();
    assert_eq!(invoked, vec!["s1", "s2", "t"]);
    assert_eq!(run.trace.status_of("u"), Some(NodeStatus::Skipped));
    assert_eq!(run.trace.status_of("v"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn repeated_runs_are_identical() {
    let executor = executor();
    let chain = abc_chain();
    let first = executor.run(&chain, JsonMap::new(), RunOptions::default()).await.expect("first");
    let second = executor.run(&chain, JsonMap::new(), RunOptions::default()).await.expect("second");

    assert_eq!(first.final_outputs, second.final_outputs);
    assert_eq!(first.trace.node_ids(), second.trace.node_ids());
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn trace_follows_declaration_order_not_completion_order() {
    let mut slow = node("slow", "sleep", &[]);
    slow.config = json!({"delay_ms": 60, "value": "s"}).as_object().cloned().unwrap_or_default();
    let mut fast = node("fast", "sleep", &[]);
    fast.config = json!({"delay_ms": 0, "value": "f"}).as_object().cloned().unwrap_or_default();
    let chain = ChainDefinition {
        id: "order".into(),
        nodes: vec![slow, fast, node("join", "echo", &["slow", "fast"])],
        ..Default::default()
    };

    let run = executor().run(&chain, JsonMap::new(), RunOptions::default()).await.expect("run");
    assert_eq!(run.trace.node_ids(), vec!["slow", "fast", "join"]);
    assert_eq!(
        run.node_outputs.get("join").cloned().map(JsonValue::Object),
        Some(json!({"from_slow": "s", "from_fast": "f"}))
    );
}

#[tokio::test]
async fn single_permit_still_completes_wide_layers() {
    let config = EngineConfig {
        max_concurrency: 1,
        ..Default::default()
    };
    let executor = ChainExecutor::new(Arc::new(registry_with(Arc::default())), config);
    let chain = ChainDefinition {
        id: "narrow".into(),
        nodes: (0..5).map(|index| node(&format!("n{index}"), "count", &[])).collect(),
        ..Default::default()
    };

    let run = executor.run(&chain, JsonMap::new(), RunOptions::default()).await.expect("run");
    assert_eq!(run.trace.count(NodeStatus::Succeeded), 5);
}

#[tokio::test]
async fn timeouts_are_action_failures() {
    let mut slow = node("slow", "sleep", &[]);
    slow.config = json!({"delay_ms": 2_000}).as_object().cloned().unwrap_or_default();
    slow.timeout_ms = Some(20);
    let chain = ChainDefinition {
        id: "timeout".into(),
        nodes: vec![slow, node("after", "count", &["slow"])],
        ..Default::default()
    };

    let error = executor().run(&chain, JsonMap::new(), RunOptions::default()).await.expect_err("timed out");
    let entry = error.run.trace.get("slow").expect("entry");
    assert_eq!(entry.status, NodeStatus::Failed);
    assert_eq!(entry.error.as_ref().map(|error| error.kind.as_str()), Some("timeout"));
    assert_eq!(error.run.trace.status_of("after"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn cancellation_skips_nodes_that_have_not_started() {
    let mut slow = node("slow", "sleep", &[]);
    slow.config = json!({"delay_ms": 100, "value": 1}).as_object().cloned().unwrap_or_default();
    let chain = ChainDefinition {
        id: "cancel".into(),
        nodes: vec![slow, node("next", "count", &["slow"])],
        ..Default::default()
    };
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let options = RunOptions {
        cancellation: token,
        ..Default::default()
    };
    let error = executor().run(&chain, JsonMap::new(), options).await.expect_err("cancelled");

    assert!(matches!(error.cause, AbortCause::Cancelled));
    assert_eq!(error.run.status, RunStatus::Aborted);
    assert_eq!(error.run.trace.status_of("slow"), Some(NodeStatus::Succeeded));
    let next = error.run.trace.get("next").expect("entry");
    assert_eq!(next.status, NodeStatus::Skipped);
    assert_eq!(next.error.as_ref().map(|error| error.kind.as_str()), Some("cancelled"));
}

fn cancel_after(token: &CancellationToken, delay_ms: u64) {
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        canceller.cancel();
    });
}

#[tokio::test]
async fn cancellation_during_last_layer_aborts_even_when_actions_finish() {
    let mut slow = node("slow", "sleep", &[]);
    slow.config = json!({"delay_ms": 100, "value": 1}).as_object().cloned().unwrap_or_default();
    let chain = ChainDefinition {
        id: "cancel-last".into(),
        nodes: vec![slow],
        ..Default::default()
    };
    let token = CancellationToken::new();
    cancel_after(&token, 20);

    let options = RunOptions {
        cancellation: token.clone(),
        ..Default::default()
    };
    let error = executor().run(&chain, JsonMap::new(), options).await.expect_err("cancelled");

    assert!(token.is_cancelled());
    assert!(matches!(error.cause, AbortCause::Cancelled));
    assert_eq!(error.run.status, RunStatus::Aborted);
    assert_eq!(error.run.trace.status_of("slow"), Some(NodeStatus::Succeeded));
}

#[tokio::test]
async fn in_flight_action_honouring_its_token_fails_as_cancelled() {
    let mut waiting = node("waiting", "wait", &[]);
    waiting.config = json!({"delay_ms": 5_000}).as_object().cloned().unwrap_or_default();
    let chain = ChainDefinition {
        id: "cancel-in-flight".into(),
        nodes: vec![waiting],
        ..Default::default()
    };
    let token = CancellationToken::new();
    cancel_after(&token, 20);

    let options = RunOptions {
        cancellation: token,
        ..Default::default()
    };
    let error = executor().run(&chain, JsonMap::new(), options).await.expect_err("cancelled");

    assert!(matches!(error.cause, AbortCause::Cancelled));
    assert_eq!(error.run.status, RunStatus::Aborted);
    let entry = error.run.trace.get("waiting").expect("entry");
    assert_eq!(entry.status, NodeStatus::Failed);
    assert_eq!(entry.error.as_ref().map(|error| error.kind.as_str()), Some("cancelled"));
}

#[tokio::test]
async fn queued_nodes_start_when_they_get_a_slot() {
    let config = EngineConfig {
        max_concurrency: 1,
        ..Default::default()
    };
    let executor = ChainExecutor::new(Arc::new(registry_with(Arc::default())), config);
    let sleeper = |id: &str| {
        let mut sleeper = node(id, "sleep", &[]);
        sleeper.config = json!({"delay_ms": 40, "value": id}).as_object().cloned().unwrap_or_default();
        sleeper
    };
    let chain = ChainDefinition {
        id: "queued".into(),
        nodes: vec![sleeper("first"), sleeper("second")],
        ..Default::default()
    };

    let run = executor.run(&chain, JsonMap::new(), RunOptions::default()).await.expect("run");
    let first = run.trace.get("first").expect("first");
    let second = run.trace.get("second").expect("second");
    assert!(second.started_at >= first.finished_at);
    assert!(second.started_at.is_some());
}

#[tokio::test]
async fn secret_chain_inputs_are_redacted_in_trace() {
    let mut chain = ChainDefinition {
        id: "secret".into(),
        nodes: vec![NodeDefinition {
            id: "call".into(),
            action_type: "echo".into(),
            input_bindings: [("credential".to_string(), InputBinding::input("token")), ("topic".to_string(), InputBinding::input("topic"))]
                .into_iter()
                .collect(),
            ..Default::default()
        }],
        ..Default::default()
    };
    chain.inputs.insert("token".into(), FieldSpec::required(FieldType::String).secret());
    chain.inputs.insert("topic".into(), FieldSpec::optional(FieldType::String).with_default("rust"));

    let inputs = json!({"token": "hunter2"}).as_object().cloned().unwrap_or_default();
    let run = executor().run(&chain, inputs, RunOptions::default()).await.expect("run");

    let snapshot = run.trace.get("call").and_then(|entry| entry.inputs.clone()).expect("inputs");
    assert_eq!(snapshot["credential"], json!(REDACTED));
    assert_eq!(snapshot["topic"], json!("rust"));
    assert_eq!(run.node_outputs["call"]["credential"], json!("hunter2"));
}
