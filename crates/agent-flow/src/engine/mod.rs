//! Step state machine.
//!
//! Each step kind is a handler that looks at the stored state of a step and
//! its related objects and returns the step's desired state together with
//! the complete set of children it wants to exist. Handlers never wait: a
//! step whose work is still in flight reports `Running` and is looked at
//! again on the next change. The surrounding driver ([`Controller`]) calls
//! [`Engine::reconcile_execution`] and [`Engine::reconcile_step`] whenever
//! something relevant changed.
//!
//! - **execution**: expands the top-level chain and rolls it up
//! - **invoke**: one agent turn (plus internal passthrough turns)
//! - **condition**: `if`, answered by the model
//! - **while_loop**: bounded condition/body iterations
//! - **for_each**: one parallel chain per array element
//! - **dataset_loop**: sequential chains over a dataset found at runtime
//! - **subflow**: a nested execution sharing the thread

mod chain;
mod condition;
pub mod controller;
mod dataset_loop;
mod execution;
mod for_each;
mod invoke;
pub mod naming;
mod step;
mod subflow;
mod while_loop;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::FlowConfig;
use crate::error::AppResult;
use crate::expr::{ExpressionEvaluator, Scope, StepGraph};
use crate::invoker::{InvokeRequest, Invoker, ThreadRequest};
use crate::model::{Resource, Run, StepState, WorkflowExecution, WorkflowStep};
use crate::runtime::DatasetReader;
use crate::store::{Selector, StoreClient};

pub use condition::parse_truthy;
pub use controller::{Controller, Key};

/// Shared collaborators of every handler.
#[derive(Clone)]
pub struct Engine {
    store: StoreClient,
    invoker: Invoker,
    evaluator: ExpressionEvaluator,
    datasets: Arc<dyn DatasetReader>,
    config: FlowConfig,
}

impl Engine {
    pub fn new(
        store: StoreClient,
        invoker: Invoker,
        datasets: Arc<dyn DatasetReader>,
        config: FlowConfig,
    ) -> Self {
        Self {
            store: store.with_retries(config.status_update_retries),
            invoker,
            evaluator: ExpressionEvaluator::new(),
            datasets,
            config,
        }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Every stored step of `execution`, by name.
    async fn stored_steps(
        &self,
        execution: &WorkflowExecution,
    ) -> AppResult<HashMap<String, WorkflowStep>> {
        let steps: Vec<WorkflowStep> = self
            .store
            .list(
                execution.namespace(),
                &Selector::field("spec.workflowExecutionName", execution.name()),
            )
            .await?;
        Ok(steps
            .into_iter()
            .map(|s| (s.metadata.name.clone(), s))
            .collect())
    }

    /// Expression scope of the step being reconciled.
    async fn scope(&self, view: &StepView<'_>) -> AppResult<Scope> {
        let graph = StepGraph::load(&self.store, view.execution).await?;
        Scope::step(Arc::new(graph), view.step)
    }

    async fn run_of(&self, step: &WorkflowStep) -> AppResult<Option<Run>> {
        match &step.status.last_run_name {
            Some(run) => self.store.find(step.namespace(), run).await,
            None => Ok(None),
        }
    }

    /// The run a new turn of `step` continues from.
    ///
    /// The predecessor's last run when it has one, otherwise whatever the
    /// enclosing step continues from, up to the execution's own anchor.
    async fn anchor(&self, view: &StepView<'_>) -> AppResult<Option<String>> {
        let mut cursor = view.step.clone();
        loop {
            if let Some(after) = &cursor.spec.after_step_name {
                let predecessor = match view.stored.get(after) {
                    Some(s) => Some(s.clone()),
                    None => self.store.find::<WorkflowStep>(cursor.namespace(), after).await?,
                };
                if let Some(run) = predecessor.and_then(|s| s.status.last_run_name) {
                    return Ok(Some(run));
                }
            }
            let Some(parent) = cursor.spec.parent_step_name.clone() else {
                return Ok(view.execution.spec.previous_run_name.clone());
            };
            cursor = match view.stored.get(&parent) {
                Some(s) => s.clone(),
                None => match self.store.find::<WorkflowStep>(cursor.namespace(), &parent).await? {
                    Some(s) => s,
                    None => return Ok(view.execution.spec.previous_run_name.clone()),
                },
            };
        }
    }

    async fn invoke_request(
        &self,
        view: &StepView<'_>,
        run_name: &str,
        input: String,
    ) -> AppResult<InvokeRequest> {
        Ok(InvokeRequest {
            namespace: view.step.namespace().to_string(),
            thread: thread_request(view.execution),
            run_name: run_name.to_string(),
            owner: Some(view.step.owner_ref()),
            previous_run_name: self.anchor(view).await?,
            input,
            tools: Vec::new(),
            agent: None,
            workflow_step_name: Some(view.step.name().to_string()),
            workflow_execution_name: Some(view.execution.name().to_string()),
        })
    }
}

/// Thread an execution runs in. Executions own the threads they create.
pub(crate) fn thread_request(execution: &WorkflowExecution) -> ThreadRequest {
    match &execution.spec.thread_name {
        Some(name) => ThreadRequest {
            name: name.clone(),
            workflow_execution_name: Some(execution.name().to_string()),
            ..Default::default()
        },
        None => ThreadRequest {
            name: naming::thread_name(execution.name()),
            agent_name: None,
            workflow_execution_name: Some(execution.name().to_string()),
            owner: Some(execution.owner_ref()),
        },
    }
}

/// A child object a step wants to exist.
#[derive(Debug, Clone)]
pub(crate) enum Child {
    Step(WorkflowStep),
    Execution(WorkflowExecution),
}

/// Result of one handler pass.
#[derive(Debug)]
pub(crate) struct Advance {
    /// Complete desired child set; `None` leaves children untouched.
    children: Option<Vec<Child>>,
    state: StepState,
    last_run_name: Option<String>,
    run_name: Option<String>,
    error: Option<String>,
}

impl Advance {
    fn new(children: Vec<Child>, state: StepState) -> Self {
        Self {
            children: Some(children),
            state,
            last_run_name: None,
            run_name: None,
            error: None,
        }
    }

    pub fn running(children: Vec<Child>) -> Self {
        Self::new(children, StepState::Running)
    }

    pub fn complete(children: Vec<Child>, last_run_name: Option<String>) -> Self {
        Self {
            last_run_name,
            ..Self::new(children, StepState::Complete)
        }
    }

    pub fn failed(children: Vec<Child>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(children, StepState::Error)
        }
    }

    /// Failure that leaves existing children alone.
    pub fn failed_in_place(error: impl Into<String>) -> Self {
        Self {
            children: None,
            ..Self::failed(Vec::new(), error)
        }
    }

    /// Record `run_name` as a run started by this step.
    pub fn with_run(mut self, run_name: String) -> Self {
        self.last_run_name = Some(run_name.clone());
        self.run_name = Some(run_name);
        self
    }
}

/// What a handler gets to look at.
pub(crate) struct StepView<'a> {
    pub execution: &'a WorkflowExecution,
    pub step: &'a WorkflowStep,
    /// All steps of the execution as currently stored.
    pub stored: HashMap<String, WorkflowStep>,
}

impl StepView<'_> {
    /// Stored version of a desired child.
    pub fn stored(&self, child: &WorkflowStep) -> Option<&WorkflowStep> {
        self.stored.get(&child.metadata.name)
    }
}
