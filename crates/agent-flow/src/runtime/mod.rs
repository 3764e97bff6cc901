//! Contracts of the external collaborators the engine drives.
//!
//! The execution runtime runs one agent turn and reports cumulative call
//! frames; datasets and workspaces are consumed through small traits.
//! [`mock`] holds in-memory implementations used by tests.

pub mod external;
pub mod mock;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::RunEngineState;

pub use external::{DatasetElement, DatasetReader, WorkspaceProvider};

/// Tool name used for the chat-visible top-level call.
pub const CHAT_TOOL: &str = "chat";

/// A tool or agent available to a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instructions: String,
}

/// The tool graph a turn executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    #[serde(default)]
    pub entry_tool: String,
    #[serde(default)]
    pub tool_set: BTreeMap<String, ToolDef>,
}

impl Program {
    pub fn tool(&self, name: &str) -> Option<&ToolDef> {
        self.tool_set.get(name)
    }
}

/// Tool invocation requested from within a call's output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCall {
    pub tool_name: String,
    #[serde(default)]
    pub input: String,
}

/// One output of a call. `content` is cumulative for the whole turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOutput {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_calls: BTreeMap<String, SubCall>,
}

/// A call frame: one tool invocation inside a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub id: String,
    /// `None` for the chat-visible top-level call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: Vec<CallOutput>,
}

/// Call frames of a turn keyed by call id.
pub type CallFrames = BTreeMap<String, CallFrame>;

/// Interactive question raised by a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
}

/// Raw event reported by a running turn.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    CallProgress(CallFrame),
    CallFinish(CallFrame),
    Prompt(PromptRequest),
}

/// Everything needed to start one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeRequest {
    pub run_name: String,
    pub thread_name: String,
    pub workspace_id: Option<String>,
    pub agent: Option<String>,
    pub input: String,
    pub tools: Vec<String>,
    /// Opaque chat state of the previous turn in the thread.
    pub chat_state: Option<serde_json::Value>,
    /// Capability token the runtime presents on side-channel calls.
    pub token: String,
}

/// A turn in flight.
#[async_trait]
pub trait RuntimeExecution: Send + Sync {
    fn program(&self) -> Program;
    fn call_frames(&self) -> CallFrames;
    fn chat_state(&self) -> Option<serde_json::Value>;
    fn state(&self) -> RunEngineState;
    /// Final text output, once the turn has produced one.
    fn output(&self) -> Option<String>;
    fn error(&self) -> Option<String>;

    /// Deliver the answer (or failure) for a prompt raised by this turn.
    async fn respond_prompt(
        &self,
        prompt_id: &str,
        response: Result<BTreeMap<String, String>, String>,
    ) -> anyhow::Result<()>;
}

/// The external tool-using model runtime.
///
/// The event channel closes once the turn reaches a terminal state.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn start(
        &self,
        request: RuntimeRequest,
    ) -> anyhow::Result<(Arc<dyn RuntimeExecution>, mpsc::Receiver<RuntimeEvent>)>;
}
