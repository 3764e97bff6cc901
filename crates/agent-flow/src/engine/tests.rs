use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::crypto::SealedTokenIssuer;
use crate::events::Emitter;
use crate::model::{ExecutionState, RunEngineState, Workflow};
use crate::runtime::mock::{MemoryDatasets, MemoryWorkspaces, MockReply, MockRuntime};
use crate::runtime::RuntimeRequest;
use crate::invoker::INTERRUPTED;
use crate::store::{MemoryStore, ObjectStore};

const NS: &str = "default";
const IDLE: Duration = Duration::from_secs(10);

struct Harness {
    store: StoreClient,
    runtime: MockRuntime,
    datasets: Arc<MemoryDatasets>,
    controller: Controller,
}

fn config() -> FlowConfig {
    FlowConfig {
        snapshot_interval_ms: 20,
        ..FlowConfig::default()
    }
}

fn harness(respond: impl Fn(&RuntimeRequest) -> MockReply + Send + Sync + 'static) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), respond)
}

fn harness_on(
    backend: Arc<dyn ObjectStore>,
    respond: impl Fn(&RuntimeRequest) -> MockReply + Send + Sync + 'static,
) -> Harness {
    let store = StoreClient::new(backend);
    let runtime = MockRuntime::new(respond);
    let datasets = Arc::new(MemoryDatasets::new());
    let tokens = Arc::new(SealedTokenIssuer::random(Duration::from_secs(60)).unwrap());
    let invoker = Invoker::new(
        store.clone(),
        Arc::new(runtime.clone()),
        Arc::new(MemoryWorkspaces::new()),
        tokens,
        Emitter::new(store.clone(), config()),
        config(),
    );
    let engine = Engine::new(store.clone(), invoker, datasets.clone(), config());
    Harness {
        store,
        runtime,
        datasets,
        controller: Controller::new(engine, NS),
    }
}

impl Harness {
    async fn workflow(&self, name: &str, yaml: &str) {
        let workflow = Workflow::from_yaml(NS, name, yaml).unwrap();
        self.store.create(&workflow).await.unwrap();
    }

    async fn execute(&self, name: &str, workflow: &str, input: &str) -> WorkflowExecution {
        self.store
            .create(&WorkflowExecution::new(NS, name, workflow, input))
            .await
            .unwrap();
        tokio_test::assert_ok!(self.controller.reconcile_until_idle(IDLE).await);
        self.store.get(NS, name).await.unwrap()
    }

    fn inputs(&self) -> Vec<String> {
        self.runtime.requests().into_iter().map(|r| r.input).collect()
    }

    async fn steps(&self) -> Vec<WorkflowStep> {
        self.store.list(NS, &Selector::everything()).await.unwrap()
    }

    async fn runs(&self) -> Vec<Run> {
        self.store.list(NS, &Selector::everything()).await.unwrap()
    }
}

fn is_condition(request: &RuntimeRequest) -> bool {
    request.input.contains("TRUE or FALSE")
}

const SEQUENCE: &str = r#"
steps:
  - id: greet
    invoke: { input: "Greet the user" }
  - id: shout
    invoke: { input: "Shout {{ steps.greet.output.text }}" }
output: "steps.shout.output.text"
"#;

#[tokio::test]
async fn test_sequence_chains_runs_and_sets_output() {
    let h = harness(|req| {
        if req.input.contains("Shout") {
            MockReply::text("HELLO THERE")
        } else {
            MockReply::text("hello there")
        }
    });
    h.workflow("seq", SEQUENCE).await;

    let execution = h.execute("we1", "seq", "context").await;
    assert_eq!(execution.status.state, ExecutionState::Complete);
    assert_eq!(execution.status.output.as_deref(), Some("HELLO THERE"));
    assert_eq!(execution.status.step_names.len(), 3);
    assert!(execution.status.ended_at.is_some());

    assert_eq!(
        h.inputs(),
        vec!["context\n\nGreet the user".to_string(), "Shout hello there".to_string()]
    );
    let requests = h.runtime.requests();
    assert!(requests[0].chat_state.is_none());
    assert!(requests[1].chat_state.is_some());
    assert_eq!(requests[0].thread_name, requests[1].thread_name);

    // The second turn continues from the first one.
    let first: WorkflowStep = h.store.get(NS, &execution.status.step_names[0]).await.unwrap();
    let second_run: Run = h
        .store
        .get(NS, &naming::run_name(&execution.status.step_names[1]))
        .await
        .unwrap();
    assert_eq!(second_run.spec.previous_run_name, first.status.last_run_name);
    assert_eq!(first.status.run_names.len(), 1);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let h = harness(|_| MockReply::text("done"));
    h.workflow("seq", SEQUENCE).await;
    h.execute("we1", "seq", "").await;

    let steps = h.steps().await;
    let runs = h.runs().await;
    for step in &steps {
        h.controller.reconcile(&Key::Step(step.metadata.name.clone())).await.unwrap();
    }
    h.controller.reconcile(&Key::Execution("we1".into())).await.unwrap();
    h.controller.reconcile_until_idle(IDLE).await.unwrap();

    assert_eq!(h.steps().await, steps);
    assert_eq!(h.runs().await, runs);
    assert_eq!(h.runtime.requests().len(), 2);
}

#[tokio::test]
async fn test_step_waits_for_predecessor() {
    let h = harness(|_| MockReply::text("done"));
    h.workflow("seq", SEQUENCE).await;
    h.store
        .create(&WorkflowExecution::new(NS, "we1", "seq", ""))
        .await
        .unwrap();

    let engine = h.controller.engine();
    engine.reconcile_execution(NS, "we1").await.unwrap();
    let execution: WorkflowExecution = h.store.get(NS, "we1").await.unwrap();
    assert_eq!(execution.status.state, ExecutionState::Pending);

    let second = &execution.status.step_names[1];
    engine.reconcile_step(NS, second).await.unwrap();
    let step: WorkflowStep = h.store.get(NS, second).await.unwrap();
    assert_eq!(step.status.state, StepState::Pending);
    assert!(step.status.run_names.is_empty());
    assert!(h.runtime.requests().is_empty());
}

const BRANCH: &str = r#"
steps:
  - id: check
    if:
      condition: the sky is blue
      steps:
        - id: happy
          invoke: { input: "Celebrate" }
      else:
        - id: sad
          invoke: { input: "Mourn" }
"#;

async fn run_branch(answer: &'static str) -> (WorkflowExecution, Vec<String>) {
    let h = harness(move |req| {
        if is_condition(req) {
            MockReply::text(answer)
        } else if req.input.contains("Celebrate") {
            MockReply::text("party")
        } else {
            MockReply::text("tears")
        }
    });
    h.workflow("branch", BRANCH).await;
    let execution = h.execute("we1", "branch", "").await;
    (execution, h.inputs())
}

#[tokio::test]
async fn test_if_takes_then_branch_on_yes() {
    let (execution, inputs) = run_branch("Yes").await;
    assert_eq!(execution.status.state, ExecutionState::Complete);
    assert_eq!(execution.status.output.as_deref(), Some("party"));
    assert_eq!(inputs.len(), 2);
    assert!(inputs[0].contains("Condition: the sky is blue"));
    assert_eq!(inputs[1], "Celebrate");
}

#[tokio::test]
async fn test_if_takes_else_branch_on_no() {
    let (execution, inputs) = run_branch("no").await;
    assert_eq!(execution.status.state, ExecutionState::Complete);
    assert_eq!(execution.status.output.as_deref(), Some("tears"));
    assert_eq!(inputs[1], "Mourn");
}

#[tokio::test]
async fn test_if_fails_on_ambiguous_answer() {
    let (execution, inputs) = run_branch("maybe").await;
    assert_eq!(execution.status.state, ExecutionState::Error);
    assert!(execution
        .status
        .error
        .unwrap()
        .contains("ambiguous condition result"));
    assert_eq!(inputs.len(), 1);
}

#[tokio::test]
async fn test_if_with_empty_branch_completes_with_condition_run() {
    let h = harness(|_| MockReply::text("false"));
    h.workflow(
        "branch",
        r#"
steps:
  - id: check
    if:
      condition: anything left to do
      steps:
        - id: work
          invoke: { input: "Work" }
"#,
    )
    .await;
    let execution = h.execute("we1", "branch", "").await;
    assert_eq!(execution.status.state, ExecutionState::Complete);
    assert_eq!(execution.status.output.as_deref(), Some("false"));
}

#[tokio::test]
async fn test_while_fails_after_bound_plus_final_check() {
    let h = harness(|req| {
        if is_condition(req) {
            MockReply::text("TRUE")
        } else {
            MockReply::text("fixed")
        }
    });
    h.workflow(
        "retry",
        r#"
steps:
  - id: retry
    while:
      condition: the tests still fail
      maxLoops: 2
      steps:
        - id: fix
          invoke: { input: "Fix the failing test" }
"#,
    )
    .await;
    let execution = h.execute("we1", "retry", "").await;
    assert_eq!(execution.status.state, ExecutionState::Error);
    assert!(execution.status.error.unwrap().contains("MaxLoops exceeded"));

    let requests = h.runtime.requests();
    assert_eq!(requests.iter().filter(|r| is_condition(r)).count(), 3);
    assert_eq!(requests.iter().filter(|r| !is_condition(r)).count(), 2);
}

#[tokio::test]
async fn test_while_stops_when_condition_turns_false() {
    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    let h = harness(move |req| {
        if is_condition(req) {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                MockReply::text("true")
            } else {
                MockReply::text("false")
            }
        } else {
            MockReply::text("patched")
        }
    });
    h.workflow(
        "retry",
        r#"
steps:
  - id: retry
    while:
      condition: the tests still fail
      steps:
        - id: fix
          invoke: { input: "Fix the failing test" }
"#,
    )
    .await;
    let execution = h.execute("we1", "retry", "").await;
    assert_eq!(execution.status.state, ExecutionState::Complete);
    assert_eq!(execution.status.output.as_deref(), Some("patched"));
    assert_eq!(checks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_for_each_failure_keeps_other_runs() {
    let h = harness(|req| {
        if req.input.contains("Review b") {
            MockReply::error("cannot read b")
        } else {
            MockReply::text("fine")
        }
    });
    h.workflow(
        "each",
        r#"
steps:
  - id: each
    forEach:
      items: "workflow.input.json.files"
      var: file
      steps:
        - id: review
          invoke: { input: "Review {{ file }}" }
"#,
    )
    .await;
    let execution = h.execute("we1", "each", r#"{"files": ["a", "b"]}"#).await;
    assert_eq!(execution.status.state, ExecutionState::Error);
    let error = execution.status.error.unwrap();
    assert!(error.contains("item 1"), "{}", error);
    assert!(error.contains("cannot read b"), "{}", error);

    let runs = h.runs().await;
    assert_eq!(runs.len(), 2);
    let ok = runs
        .iter()
        .find(|r| r.spec.input.ends_with("Review a"))
        .unwrap();
    assert_eq!(ok.status.state, RunEngineState::Continue);
    assert_eq!(ok.status.output.as_deref(), Some("fine"));
}

#[tokio::test]
async fn test_for_each_completes_every_element() {
    let h = harness(|req| MockReply::text(format!("seen {}", req.input.len())));
    h.workflow(
        "each",
        r#"
steps:
  - id: each
    forEach:
      items: "[1, 2, 3]"
      steps:
        - id: say
          invoke: { input: "Number {{ item }}" }
"#,
    )
    .await;
    let execution = h.execute("we1", "each", "").await;
    assert_eq!(execution.status.state, ExecutionState::Complete);
    let mut inputs = h.inputs();
    inputs.sort();
    assert_eq!(inputs, vec!["Number 1", "Number 2", "Number 3"]);
}

const DATASET_LOOP: &str = r#"
steps:
  - id: each
    loop:
      dataDescription: open issues
      steps:
        - id: triage
          invoke: { input: "Triage {{ item.name }}" }
"#;

#[tokio::test]
async fn test_loop_iterates_dataset_in_order() {
    let h = harness(|req| {
        if req.input.contains("NOT_FOUND") {
            MockReply::text("The dataset is ds1issues")
        } else {
            MockReply::text("triaged")
        }
    });
    let thread = h
        .controller
        .engine()
        .invoker()
        .resolve_thread(
            NS,
            &ThreadRequest {
                name: "shared".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let workspace = thread.status.workspace_id.unwrap();
    h.datasets
        .insert(&workspace, "ds1issues", &["issue one", "issue two"]);
    h.workflow("loop", DATASET_LOOP).await;

    let mut execution = WorkflowExecution::new(NS, "we1", "loop", "");
    execution.spec.thread_name = Some("shared".into());
    h.store.create(&execution).await.unwrap();
    h.controller.reconcile_until_idle(IDLE).await.unwrap();

    let execution: WorkflowExecution = h.store.get(NS, "we1").await.unwrap();
    assert_eq!(execution.status.state, ExecutionState::Complete);
    assert_eq!(execution.status.thread_name.as_deref(), Some("shared"));
    let inputs = h.inputs();
    assert_eq!(inputs.len(), 3);
    assert!(inputs[0].contains("open issues"));
    assert_eq!(inputs[1], "issue one\n\nTriage element-0");
    assert_eq!(inputs[2], "issue two\n\nTriage element-1");
}

#[tokio::test]
async fn test_loop_without_dataset_fails() {
    let h = harness(|_| MockReply::text("NOT_FOUND"));
    h.workflow("loop", DATASET_LOOP).await;
    let execution = h.execute("we1", "loop", "").await;
    assert_eq!(execution.status.state, ExecutionState::Error);
    assert!(execution.status.error.unwrap().contains("dataset not found"));
}

#[tokio::test]
async fn test_subflow_output_flows_back() {
    let h = harness(|req| {
        if req.input.contains("Start") {
            MockReply::text("begun")
        } else if req.input.contains("Inner") {
            MockReply::text("inner done")
        } else {
            MockReply::text("wrapped")
        }
    });
    h.workflow(
        "child",
        r#"
steps:
  - id: inner
    invoke: { input: "Inner work on {{ workflow.input.text }}" }
"#,
    )
    .await;
    h.workflow(
        "parent",
        r#"
steps:
  - id: first
    invoke: { input: "Start" }
  - id: nested
    subflow:
      workflow: child
      input: "from {{ steps.first.output.text }}"
  - id: last
    invoke: { input: "Wrap up {{ steps.nested.output.text }}" }
"#,
    )
    .await;

    let execution = h.execute("we1", "parent", "").await;
    assert_eq!(execution.status.state, ExecutionState::Complete);
    assert_eq!(execution.status.output.as_deref(), Some("wrapped"));

    let inputs = h.inputs();
    assert_eq!(inputs.len(), 3);
    assert!(inputs[1].ends_with("Inner work on from begun"), "{}", inputs[1]);
    assert_eq!(inputs[2], "Wrap up inner done");

    let requests = h.runtime.requests();
    assert!(requests.iter().all(|r| r.thread_name == requests[0].thread_name));

    let nested: WorkflowStep = h.store.get(NS, &execution.status.step_names[1]).await.unwrap();
    let sub: WorkflowExecution = h
        .store
        .get(NS, &naming::subflow_execution_name(&nested.metadata.name))
        .await
        .unwrap();
    assert_eq!(sub.status.state, ExecutionState::Complete);
    let output_run: Run = h
        .store
        .get(NS, nested.status.last_run_name.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(output_run.status.output.as_deref(), Some("inner done"));
}

#[tokio::test]
async fn test_missing_workflow_fails_execution() {
    let h = harness(|_| MockReply::text("unused"));
    let execution = h.execute("we1", "nowhere", "").await;
    assert_eq!(execution.status.state, ExecutionState::Error);
    assert!(execution.status.error.unwrap().contains("workflow nowhere not found"));
}

#[tokio::test]
async fn test_run_error_fails_step_and_execution() {
    let h = harness(|_| MockReply::error("model unavailable"));
    h.workflow("seq", SEQUENCE).await;
    let execution = h.execute("we1", "seq", "").await;
    assert_eq!(execution.status.state, ExecutionState::Error);
    assert!(execution.status.error.unwrap().contains("model unavailable"));
    // The second step never started.
    assert_eq!(h.runtime.requests().len(), 1);
}

#[tokio::test]
async fn test_restart_ends_run_left_in_flight() {
    let backend: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let before = harness_on(backend.clone(), |_| MockReply::text("thinking").stalled());
    before.workflow("seq", SEQUENCE).await;
    before
        .store
        .create(&WorkflowExecution::new(NS, "we1", "seq", ""))
        .await
        .unwrap();
    // The first turn never ends.
    assert!(before
        .controller
        .reconcile_until_idle(Duration::from_millis(300))
        .await
        .is_err());
    assert_eq!(before.runtime.requests().len(), 1);

    let after = harness_on(backend, |_| MockReply::text("unused"));
    tokio_test::assert_ok!(after.controller.reconcile_until_idle(IDLE).await);

    let execution: WorkflowExecution = after.store.get(NS, "we1").await.unwrap();
    assert_eq!(execution.status.state, ExecutionState::Error);
    assert!(execution.status.error.unwrap().contains(INTERRUPTED));
    assert!(after.runtime.requests().is_empty());
}

#[tokio::test]
async fn test_bad_expression_fails_step() {
    let h = harness(|_| MockReply::text("ok"));
    h.workflow(
        "each",
        r#"
steps:
  - id: each
    forEach:
      items: "workflow.input.text"
      steps:
        - id: say
          invoke: { input: "x" }
"#,
    )
    .await;
    let execution = h.execute("we1", "each", "not a list").await;
    assert_eq!(execution.status.state, ExecutionState::Error);
    assert!(execution.status.error.unwrap().contains("expression error"));
}

#[tokio::test]
async fn test_controller_run_drives_execution() {
    let h = harness(|_| MockReply::text("done"));
    h.workflow("seq", SEQUENCE).await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let controller = h.controller.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { controller.run(token).await });

    h.store
        .create(&WorkflowExecution::new(NS, "we1", "seq", ""))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + IDLE;
    loop {
        let execution: WorkflowExecution = h.store.get(NS, "we1").await.unwrap();
        if execution.status.state.is_terminal() {
            assert_eq!(execution.status.state, ExecutionState::Complete);
            assert_eq!(execution.status.output.as_deref(), Some("done"));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "execution did not finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    handle.await.unwrap().unwrap();
}
