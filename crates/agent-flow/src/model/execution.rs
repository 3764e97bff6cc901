//! Workflow executions and the step instances they expand into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::{index, status_resource, Kind, ObjectMeta};
use super::workflow::Step;
use crate::codec::CompressedBlob;

/// Overall state of one workflow execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Pending,
    Running,
    Error,
    Complete,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Error | ExecutionState::Complete)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// State of one step instance. `Complete` and `Error` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Running,
    Complete,
    Error,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Complete | StepState::Error)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One run of a workflow against one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub metadata: ObjectMeta,
    pub spec: WorkflowExecutionSpec,
    #[serde(default)]
    pub status: WorkflowExecutionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionSpec {
    pub workflow_name: String,
    #[serde(default)]
    pub input: String,
    /// Thread to run in; a new thread is created when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    /// Chat continuity anchor for the first step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_run_name: Option<String>,
    /// Set when this execution is the body of a subflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionStatus {
    #[serde(default)]
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    /// Names of the top-level step chain, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

status_resource!(
    WorkflowExecution,
    Kind::WorkflowExecution,
    WorkflowExecutionSpec,
    WorkflowExecutionStatus,
    |this| index([
        ("spec.workflowName", Some(this.spec.workflow_name.as_str())),
        ("spec.parentStepName", this.spec.parent_step_name.as_deref()),
    ])
);

impl WorkflowExecution {
    pub fn new(namespace: &str, name: &str, workflow_name: &str, input: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(namespace, name),
            spec: WorkflowExecutionSpec {
                workflow_name: workflow_name.to_string(),
                input: input.to_string(),
                ..Default::default()
            },
            status: WorkflowExecutionStatus::default(),
        }
    }
}

/// One node of the dynamically expanded step graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub metadata: ObjectMeta,
    pub spec: WorkflowStepSpec,
    #[serde(default)]
    pub status: WorkflowStepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepSpec {
    pub workflow_execution_name: String,
    pub workflow_name: String,
    /// Position in the expanded graph; the name is derived from it.
    pub path: Vec<String>,
    /// Execution-order predecessor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_step_name: Option<String>,
    /// Start without waiting for `after_step_name` to complete.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dont_wait: bool,
    /// Control-construct step that spawned this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_name: Option<String>,
    pub step: Step,
    /// Seed text prepended to the rendered instructions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Loop element bound for this step and its descendants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_item: Option<CompressedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_item_var: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepStatus {
    #[serde(default)]
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowStepStatus {
    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = StepState::Error;
        self.error = Some(message.into());
    }

    pub fn complete(&mut self, last_run_name: Option<String>) {
        self.state = StepState::Complete;
        if last_run_name.is_some() {
            self.last_run_name = last_run_name;
        }
    }
}

status_resource!(
    WorkflowStep,
    Kind::WorkflowStep,
    WorkflowStepSpec,
    WorkflowStepStatus,
    |this| index([
        (
            "spec.workflowExecutionName",
            Some(this.spec.workflow_execution_name.as_str())
        ),
        ("spec.parentStepName", this.spec.parent_step_name.as_deref()),
        ("spec.afterStepName", this.spec.after_step_name.as_deref()),
    ])
);

impl WorkflowStep {
    /// The manifest id this instance executes.
    pub fn step_id(&self) -> &str {
        &self.spec.step.id
    }
}
