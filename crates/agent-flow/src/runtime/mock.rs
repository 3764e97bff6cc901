//! In-memory collaborators for tests and local runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{
    AgentRuntime, CallFrame, CallFrames, CallOutput, DatasetElement, DatasetReader, Program,
    PromptRequest, RuntimeEvent, RuntimeExecution, RuntimeRequest, SubCall, ToolDef,
    WorkspaceProvider, CHAT_TOOL,
};
use crate::model::RunEngineState;

const TOP_CALL_ID: &str = "call-0";

/// Scripted answer for one turn.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    /// Output text, revealed cumulatively one chunk at a time.
    pub chunks: Vec<String>,
    /// `(tool, input)` sub-calls made before the answer completes.
    pub tool_calls: Vec<(String, String)>,
    pub prompt: Option<PromptRequest>,
    pub error: Option<String>,
    pub aborted: bool,
    /// Stop after the output chunks and never finish the turn.
    pub stalled: bool,
}

impl MockReply {
    /// Answer `text`, streamed word by word.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut chunks = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            current.push(ch);
            if ch == ' ' {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() || chunks.is_empty() {
            chunks.push(current);
        }
        Self {
            chunks,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn aborted() -> Self {
        Self {
            aborted: true,
            ..Default::default()
        }
    }

    /// Same reply, but the turn hangs once its text is out.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>, input: impl Into<String>) -> Self {
        self.tool_calls.push((tool.into(), input.into()));
        self
    }

    pub fn with_prompt(mut self, message: impl Into<String>, fields: &[&str]) -> Self {
        self.prompt = Some(PromptRequest {
            id: "prompt-0".to_string(),
            message: message.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            sensitive: false,
        });
        self
    }

    fn output(&self) -> String {
        self.chunks.concat()
    }
}

type Responder = dyn Fn(&RuntimeRequest) -> MockReply + Send + Sync;

/// Runtime whose answers are computed from the request by a closure.
#[derive(Clone)]
pub struct MockRuntime {
    respond: Arc<Responder>,
    requests: Arc<Mutex<Vec<RuntimeRequest>>>,
}

impl MockRuntime {
    pub fn new(respond: impl Fn(&RuntimeRequest) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            respond: Arc::new(respond),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answers every turn with the same text.
    pub fn constant(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| MockReply::text(text.clone()))
    }

    /// Requests received so far, in start order.
    pub fn requests(&self) -> Vec<RuntimeRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn start(
        &self,
        request: RuntimeRequest,
    ) -> anyhow::Result<(Arc<dyn RuntimeExecution>, mpsc::Receiver<RuntimeEvent>)> {
        let reply = (self.respond)(&request);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let mut tool_set = BTreeMap::new();
        tool_set.insert(
            CHAT_TOOL.to_string(),
            ToolDef {
                name: CHAT_TOOL.to_string(),
                description: "Chat with the user".to_string(),
                instructions: String::new(),
            },
        );
        for tool in request.tools.iter().chain(reply.tool_calls.iter().map(|(t, _)| t)) {
            tool_set.entry(tool.clone()).or_insert_with(|| ToolDef {
                name: tool.clone(),
                description: format!("Mock tool {}", tool),
                instructions: String::new(),
            });
        }

        let execution = Arc::new(MockExecution {
            state: Mutex::new(MockState {
                program: Program {
                    entry_tool: CHAT_TOOL.to_string(),
                    tool_set,
                },
                frames: CallFrames::new(),
                chat_state: request.chat_state.clone(),
                state: RunEngineState::Running,
                output: None,
                error: None,
            }),
            pending_prompt: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(play(execution.clone(), request, reply, tx));
        Ok((execution, rx))
    }
}

struct MockState {
    program: Program,
    frames: CallFrames,
    chat_state: Option<serde_json::Value>,
    state: RunEngineState,
    output: Option<String>,
    error: Option<String>,
}

type PromptAnswer = Result<BTreeMap<String, String>, String>;

struct MockExecution {
    state: Mutex<MockState>,
    pending_prompt: Mutex<Option<(String, oneshot::Sender<PromptAnswer>)>>,
}

impl MockExecution {
    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn put_frame(&self, frame: &CallFrame) {
        self.with_state(|s| {
            s.frames.insert(frame.id.clone(), frame.clone());
        });
    }
}

#[async_trait]
impl RuntimeExecution for MockExecution {
    fn program(&self) -> Program {
        self.with_state(|s| s.program.clone())
    }

    fn call_frames(&self) -> CallFrames {
        self.with_state(|s| s.frames.clone())
    }

    fn chat_state(&self) -> Option<serde_json::Value> {
        self.with_state(|s| s.chat_state.clone())
    }

    fn state(&self) -> RunEngineState {
        self.with_state(|s| s.state)
    }

    fn output(&self) -> Option<String> {
        self.with_state(|s| s.output.clone())
    }

    fn error(&self) -> Option<String> {
        self.with_state(|s| s.error.clone())
    }

    async fn respond_prompt(&self, prompt_id: &str, response: PromptAnswer) -> anyhow::Result<()> {
        let pending = self
            .pending_prompt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some((id, tx)) if id == prompt_id => tx
                .send(response)
                .map_err(|_| anyhow!("turn no longer waiting on prompt {}", prompt_id)),
            Some(other) => {
                *self
                    .pending_prompt
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(other);
                Err(anyhow!("unknown prompt {}", prompt_id))
            }
            None => Err(anyhow!("no prompt pending")),
        }
    }
}

/// Plays a scripted reply as cumulative frames, then closes the feed.
async fn play(
    execution: Arc<MockExecution>,
    request: RuntimeRequest,
    reply: MockReply,
    events: mpsc::Sender<RuntimeEvent>,
) {
    let mut top = CallFrame {
        id: TOP_CALL_ID.to_string(),
        parent_id: None,
        tool_name: CHAT_TOOL.to_string(),
        input: request.input.clone(),
        output: vec![CallOutput::default()],
    };

    let mut content = String::new();
    for chunk in &reply.chunks {
        content.push_str(chunk);
        top.output[0].content = content.clone();
        execution.put_frame(&top);
        let _ = events.send(RuntimeEvent::CallProgress(top.clone())).await;
        tokio::task::yield_now().await;
    }

    if reply.stalled {
        events.closed().await;
        return;
    }

    for (idx, (tool, input)) in reply.tool_calls.iter().enumerate() {
        let call_id = format!("call-{}", idx + 1);
        let child = CallFrame {
            id: call_id.clone(),
            parent_id: Some(TOP_CALL_ID.to_string()),
            tool_name: tool.clone(),
            input: input.clone(),
            output: vec![CallOutput {
                content: format!("{} done", tool),
                ..Default::default()
            }],
        };
        execution.put_frame(&child);
        let _ = events.send(RuntimeEvent::CallFinish(child)).await;

        top.output[0].sub_calls.insert(
            call_id,
            SubCall {
                tool_name: tool.clone(),
                input: input.clone(),
            },
        );
        execution.put_frame(&top);
        let _ = events.send(RuntimeEvent::CallProgress(top.clone())).await;
    }

    let mut error = reply.error.clone();
    let mut output = reply.output();
    if let Some(prompt) = reply.prompt.clone() {
        let (tx, rx) = oneshot::channel();
        *execution
            .pending_prompt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((prompt.id.clone(), tx));
        execution.with_state(|s| s.state = RunEngineState::Waiting);
        let _ = events.send(RuntimeEvent::Prompt(prompt)).await;
        match rx.await {
            Ok(Ok(answer)) => {
                let values: Vec<String> = answer.values().cloned().collect();
                output.push_str(&values.join(","));
                top.output[0].content = output.clone();
            }
            Ok(Err(message)) => error = Some(message),
            Err(_) => error = Some("prompt abandoned".to_string()),
        }
    }

    execution.put_frame(&top);
    let mut history: Vec<serde_json::Value> = request
        .chat_state
        .as_ref()
        .and_then(|s| s.get("history"))
        .and_then(|h| h.as_array())
        .cloned()
        .unwrap_or_default();
    history.push(serde_json::json!({"user": request.input, "assistant": output}));

    execution.with_state(|s| {
        s.chat_state = Some(serde_json::json!({ "history": history }));
        if let Some(message) = error {
            s.state = RunEngineState::Error;
            s.error = Some(message);
        } else if reply.aborted {
            s.state = RunEngineState::Finished;
        } else {
            s.state = RunEngineState::Continue;
            s.output = Some(output);
        }
    });
    let _ = events.send(RuntimeEvent::CallFinish(top)).await;
}

/// Datasets held in memory, keyed by `(workspace, dataset)`.
#[derive(Debug, Default)]
pub struct MemoryDatasets {
    datasets: Mutex<HashMap<(String, String), Vec<DatasetElement>>>,
}

impl MemoryDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workspace_id: &str, dataset_id: &str, contents: &[&str]) {
        let elements = contents
            .iter()
            .enumerate()
            .map(|(idx, c)| DatasetElement {
                name: format!("element-{}", idx),
                contents: c.to_string(),
            })
            .collect();
        self.datasets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((workspace_id.to_string(), dataset_id.to_string()), elements);
    }
}

#[async_trait]
impl DatasetReader for MemoryDatasets {
    async fn read(
        &self,
        workspace_id: &str,
        dataset_id: &str,
    ) -> anyhow::Result<Option<Vec<DatasetElement>>> {
        Ok(self
            .datasets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(workspace_id.to_string(), dataset_id.to_string()))
            .cloned())
    }
}

/// Workspace provider that only hands out ids.
#[derive(Debug, Default)]
pub struct MemoryWorkspaces {
    next: AtomicU64,
    live: Mutex<HashSet<String>>,
}

impl MemoryWorkspaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of workspaces created and not yet removed.
    pub fn live(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl WorkspaceProvider for MemoryWorkspaces {
    async fn create(&self, provider_type: &str) -> anyhow::Result<String> {
        let id = format!("{}-ws-{}", provider_type, self.next.fetch_add(1, Ordering::SeqCst));
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        Ok(id)
    }

    async fn remove(&self, workspace_id: &str) -> anyhow::Result<()> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workspace_id);
        Ok(())
    }
}
