//! Threads, runs, and their durable recovery state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::{index, status_resource, Kind, ObjectMeta, Resource};
use crate::codec::CompressedBlob;

/// Engine state of one agent turn, as reported by the execution runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEngineState {
    #[default]
    Creating,
    Running,
    /// Blocked on an interactive prompt.
    Waiting,
    /// The turn produced its answer; the conversation may continue.
    Continue,
    /// The turn ended without an answer (aborted).
    Finished,
    Error,
}

impl RunEngineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunEngineState::Continue | RunEngineState::Finished | RunEngineState::Error
        )
    }
}

impl std::fmt::Display for RunEngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Continue => write!(f, "continue"),
            Self::Finished => write!(f, "finished"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A conversation context chaining sequential runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ThreadSpec,
    #[serde(default)]
    pub status: ThreadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_execution_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_state: Option<RunEngineState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_error: Option<String>,
}

status_resource!(
    Thread,
    Kind::Thread,
    ThreadSpec,
    ThreadStatus,
    |this| index([(
        "spec.workflowExecutionName",
        this.spec.workflow_execution_name.as_deref()
    )])
);

/// One agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub metadata: ObjectMeta,
    pub spec: RunSpec,
    #[serde(default)]
    pub status: RunStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub thread_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Previous turn in the same conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_run_name: Option<String>,
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_execution_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    #[serde(default)]
    pub state: RunEngineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

status_resource!(
    Run,
    Kind::Run,
    RunSpec,
    RunStatus,
    |this| index([
        ("spec.threadName", Some(this.spec.thread_name.as_str())),
        ("spec.previousRunName", this.spec.previous_run_name.as_deref()),
        ("spec.workflowStepName", this.spec.workflow_step_name.as_deref()),
    ])
);

/// Durable recovery record of a run, named after the run.
///
/// Content only grows until `done` is written, exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RunStateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStateSpec {
    #[serde(default)]
    pub thread_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<CompressedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_frame: Option<CompressedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_state: Option<CompressedBlob>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Resource for RunState {
    const KIND: Kind = Kind::RunState;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn fields(&self) -> BTreeMap<String, String> {
        index([("spec.threadName", Some(self.spec.thread_name.as_str()))])
    }
}

/// An interactive question raised by the runtime during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub metadata: ObjectMeta,
    pub spec: PromptSpec,
    #[serde(default)]
    pub status: PromptStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptSpec {
    pub run_name: String,
    pub thread_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<BTreeMap<String, String>>,
}

status_resource!(
    Prompt,
    Kind::Prompt,
    PromptSpec,
    PromptStatus,
    |this| index([
        ("spec.runName", Some(this.spec.run_name.as_str())),
        ("spec.threadName", Some(this.spec.thread_name.as_str())),
    ])
);
