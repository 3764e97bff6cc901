//! Records exchanged through the object store.
//!
//! - [`workflow`]: authored manifests
//! - [`execution`]: executions and expanded step instances
//! - [`run`]: threads, runs, run state and prompts
//! - [`progress`]: the streamed progress frame

pub mod execution;
pub mod meta;
pub mod progress;
pub mod run;
pub mod workflow;

pub use execution::{
    ExecutionState, StepState, WorkflowExecution, WorkflowExecutionSpec, WorkflowExecutionStatus,
    WorkflowStep, WorkflowStepSpec, WorkflowStepStatus,
};
pub use meta::{Kind, ObjectMeta, OwnerRef, Resource, StatusResource};
pub use progress::{Progress, PromptProgress, ToolProgress};
pub use run::{
    Prompt, PromptSpec, PromptStatus, Run, RunEngineState, RunSpec, RunState, RunStateSpec,
    RunStatus, Thread, ThreadSpec, ThreadStatus,
};
pub use workflow::{
    ForEachSpec, IfSpec, InvokeSpec, LoopSpec, PassthroughSpec, Step, StepBody, SubflowSpec,
    WhileSpec, Workflow, WorkflowManifest, DEFAULT_ITEM_VAR,
};
