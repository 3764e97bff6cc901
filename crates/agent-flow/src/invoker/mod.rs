//! Starts agent turns and streams their progress.
//!
//! [`Invoker::invoke`] resolves the conversation thread, records the
//! [`Run`], and starts the turn on the [`AgentRuntime`] without waiting for
//! it. A background task then diffs the runtime's cumulative output into
//! [`Progress`] frames, persists the run's [`RunState`] on a fixed interval
//! and once more when the turn ends, and finally writes run and thread
//! status.
//!
//! A run is driven only by the invoker that started it. [`Invoker::recover`]
//! ends runs that no turn in this process is driving, such as runs left
//! behind by a restart.

mod diff;
mod prompt;
mod stream;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::CompressedBlob;
use crate::config::FlowConfig;
use crate::crypto::{Claims, TokenIssuer};
use crate::error::{AppError, AppResult};
use crate::events::Emitter;
use crate::model::{
    ObjectMeta, OwnerRef, Progress, Resource, Run, RunEngineState, RunSpec, RunState,
    RunStateSpec, RunStatus, Thread, ThreadSpec, ThreadStatus,
};
use crate::result_ext::ResultExt;
use crate::runtime::{
    AgentRuntime, CallFrame, CallFrames, CallOutput, Program, RuntimeRequest, WorkspaceProvider,
    CHAT_TOOL,
};
use crate::store::StoreClient;

pub use diff::{CallTracker, TOOL_CALL_MARKER, WAITING_MARKER};

const DEFAULT_AGENT: &str = "default";

/// Error recorded on runs found unfinished with nobody driving them.
pub const INTERRUPTED: &str = "run interrupted";

type RunKey = (String, String);

/// Marks a run as driven by this invoker until dropped.
pub(crate) struct ActiveRun {
    runs: Arc<Mutex<HashSet<RunKey>>>,
    key: RunKey,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Thread to run in, created on first use.
#[derive(Debug, Clone, Default)]
pub struct ThreadRequest {
    pub name: String,
    pub agent_name: Option<String>,
    pub workflow_execution_name: Option<String>,
    /// Owner of a newly created thread.
    pub owner: Option<OwnerRef>,
}

/// One agent turn to start.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    pub namespace: String,
    pub thread: ThreadRequest,
    /// Run names are chosen by the caller so a retried invoke finds its run.
    pub run_name: String,
    /// Owner of the run record. Defaults to the thread.
    pub owner: Option<OwnerRef>,
    /// Conversation anchor. Defaults to the thread's latest run.
    pub previous_run_name: Option<String>,
    pub input: String,
    pub tools: Vec<String>,
    pub agent: Option<String>,
    pub workflow_step_name: Option<String>,
    pub workflow_execution_name: Option<String>,
}

/// Result of [`Invoker::invoke`].
#[derive(Debug)]
pub struct InvokeResponse {
    pub run: Run,
    pub thread: Thread,
    /// False when the run already existed and nothing was started.
    pub started: bool,
    /// Progress of this turn; closes when the turn ends.
    pub progress: mpsc::UnboundedReceiver<Progress>,
}

/// Starts turns on the execution runtime.
#[derive(Clone)]
pub struct Invoker {
    store: StoreClient,
    runtime: Arc<dyn AgentRuntime>,
    workspaces: Arc<dyn WorkspaceProvider>,
    tokens: Arc<dyn TokenIssuer>,
    emitter: Emitter,
    config: FlowConfig,
    active: Arc<Mutex<HashSet<RunKey>>>,
}

impl Invoker {
    pub fn new(
        store: StoreClient,
        runtime: Arc<dyn AgentRuntime>,
        workspaces: Arc<dyn WorkspaceProvider>,
        tokens: Arc<dyn TokenIssuer>,
        emitter: Emitter,
        config: FlowConfig,
    ) -> Self {
        Self {
            store: store.with_retries(config.status_update_retries),
            runtime,
            workspaces,
            tokens,
            emitter,
            config,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn run_key(run: &Run) -> RunKey {
        (run.namespace().to_string(), run.name().to_string())
    }

    fn track(&self, run: &Run) -> ActiveRun {
        let key = Self::run_key(run);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        ActiveRun {
            runs: self.active.clone(),
            key,
        }
    }

    /// Whether a turn in this process is driving `run`.
    pub fn is_active(&self, run: &Run) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&Self::run_key(run))
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Find the thread, creating it and its workspace when missing.
    ///
    /// A workspace created for a thread that could not be stored is removed
    /// again.
    pub async fn resolve_thread(&self, namespace: &str, request: &ThreadRequest) -> AppResult<Thread> {
        if let Some(thread) = self.store.find::<Thread>(namespace, &request.name).await? {
            return Ok(thread);
        }

        let workspace_id = self
            .workspaces
            .create(&self.config.workspace_provider)
            .await
            .map_err(|e| AppError::Workspace(format!("failed to create workspace: {}", e)))?;

        let mut metadata = ObjectMeta::named(namespace, &request.name);
        metadata.owner = request.owner.clone();
        let thread = Thread {
            metadata,
            spec: ThreadSpec {
                agent_name: request.agent_name.clone(),
                workflow_execution_name: request.workflow_execution_name.clone(),
                description: None,
            },
            status: ThreadStatus {
                workspace_id: Some(workspace_id.clone()),
                ..Default::default()
            },
        };

        match self.store.create(&thread).await {
            Ok(created) => {
                info!(thread = %request.name, workspace = %workspace_id, "Created thread");
                Ok(created)
            }
            Err(e) => {
                self.workspaces
                    .remove(&workspace_id)
                    .await
                    .warn_and_discard(format!("removing workspace {}", workspace_id));
                match e {
                    AppError::AlreadyExists(_) => self.store.get(namespace, &request.name).await,
                    e => Err(e),
                }
            }
        }
    }

    /// Delete a thread and the workspace backing it.
    pub async fn delete_thread(&self, namespace: &str, name: &str) -> AppResult<()> {
        let Some(thread) = self.store.find::<Thread>(namespace, name).await? else {
            return Ok(());
        };
        self.store.delete::<Thread>(namespace, name).await?;
        if let Some(workspace_id) = thread.status.workspace_id {
            self.workspaces
                .remove(&workspace_id)
                .await
                .map_err(|e| AppError::Workspace(format!("failed to remove workspace: {}", e)))?;
        }
        info!(thread = %name, "Deleted thread");
        Ok(())
    }

    fn run_record(&self, request: &InvokeRequest, thread: &Thread) -> Run {
        let mut metadata = ObjectMeta::named(&request.namespace, &request.run_name);
        metadata.owner = Some(request.owner.clone().unwrap_or_else(|| thread.owner_ref()));
        Run {
            metadata,
            spec: RunSpec {
                thread_name: thread.metadata.name.clone(),
                agent_name: request.agent.clone(),
                previous_run_name: request
                    .previous_run_name
                    .clone()
                    .or_else(|| thread.status.last_run_name.clone()),
                input: request.input.clone(),
                tools: request.tools.clone(),
                workflow_step_name: request.workflow_step_name.clone(),
                workflow_execution_name: request.workflow_execution_name.clone(),
            },
            status: RunStatus {
                state: RunEngineState::Creating,
                ..Default::default()
            },
        }
    }

    /// Create the run record, returning `None` when it already exists.
    async fn create_run(&self, run: &Run) -> AppResult<Option<Run>> {
        match self.store.create(run).await {
            Ok(created) => Ok(Some(created)),
            Err(AppError::AlreadyExists(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn existing(run: Run, thread: Thread) -> InvokeResponse {
        let (_, progress) = mpsc::unbounded_channel();
        InvokeResponse {
            run,
            thread,
            started: false,
            progress,
        }
    }

    async fn previous_chat_state(
        &self,
        namespace: &str,
        previous: Option<&str>,
    ) -> AppResult<Option<CompressedBlob>> {
        let Some(previous) = previous else {
            return Ok(None);
        };
        Ok(self
            .store
            .find::<RunState>(namespace, previous)
            .await?
            .and_then(|state| state.spec.chat_state))
    }

    async fn point_thread_at(&self, thread: &Thread, run: &Run) -> AppResult<Thread> {
        let run_name = run.metadata.name.clone();
        self.store
            .mutate_status::<Thread, _>(thread.namespace(), thread.name(), |status| {
                status.last_run_name = Some(run_name.clone());
                status.last_run_state = Some(run.status.state);
                status.last_run_output = run.status.output.clone();
                status.last_run_error = run.status.error.clone();
            })
            .await
    }

    /// Start one turn. Returns as soon as the runtime accepted it.
    pub async fn invoke(&self, request: InvokeRequest) -> AppResult<InvokeResponse> {
        let namespace = request.namespace.as_str();
        let thread = self.resolve_thread(namespace, &request.thread).await?;

        if let Some(run) = self.store.find::<Run>(namespace, &request.run_name).await? {
            debug!(run = %request.run_name, "Run already exists");
            return Ok(Self::existing(run, thread));
        }
        let Some(run) = self.create_run(&self.run_record(&request, &thread)).await? else {
            let run = self.store.get(namespace, &request.run_name).await?;
            return Ok(Self::existing(run, thread));
        };
        let active = self.track(&run);
        let run_name = run.metadata.name.clone();

        let chat_state = self
            .previous_chat_state(namespace, run.spec.previous_run_name.as_deref())
            .await?
            .map(|blob| blob.decode::<serde_json::Value>())
            .transpose()?;

        let token = self.tokens.mint(Claims {
            run: run_name.clone(),
            thread: thread.metadata.name.clone(),
            agent: request.agent.clone().unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            step: request.workflow_step_name.clone(),
            expires_at: Utc::now(),
        })?;

        let thread = self.point_thread_at(&thread, &run).await?;

        self.emitter.start_run(&run_name);
        let started = self
            .runtime
            .start(RuntimeRequest {
                run_name: run_name.clone(),
                thread_name: thread.metadata.name.clone(),
                workspace_id: thread.status.workspace_id.clone(),
                agent: request.agent.clone(),
                input: request.input.clone(),
                tools: request.tools.clone(),
                chat_state,
                token,
            })
            .await;

        let (execution, events) = match started {
            Ok(started) => started,
            Err(e) => {
                let message = format!("failed to start run: {}", e);
                warn!(run = %run_name, error = %message, "Runtime rejected run");
                let run = self
                    .store
                    .update_status(
                        &run,
                        RunStatus {
                            state: RunEngineState::Error,
                            error: Some(message.clone()),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                stream::seal_state(self, &run, Some(message.clone())).await?;
                self.point_thread_at(&thread, &run).await?;
                self.emitter.finish(&run_name, Some(message));
                return Ok(Self::existing(run, thread));
            }
        };

        let run = self
            .store
            .update_status(
                &run,
                RunStatus {
                    state: RunEngineState::Running,
                    ..Default::default()
                },
            )
            .await?;
        info!(run = %run_name, thread = %thread.metadata.name, "Started run");

        let (tx, progress) = mpsc::unbounded_channel();
        tokio::spawn(stream::stream(
            self.clone(),
            run.clone(),
            execution,
            events,
            tx,
            active,
        ));

        Ok(InvokeResponse {
            run,
            thread,
            started: true,
            progress,
        })
    }

    /// Settle `run` when nothing in this process is driving it.
    ///
    /// A run that is not terminal and has no live turn here was left behind
    /// by an earlier process, or by an invoke that failed before the turn
    /// started. It is ended with [`INTERRUPTED`]; its persisted progress
    /// stays readable and watchers see it end. Other runs are returned as is.
    pub async fn recover(&self, run: Run) -> AppResult<Run> {
        if run.status.state.is_terminal() || self.is_active(&run) {
            return Ok(run);
        }
        let current = self
            .store
            .find::<Run>(run.namespace(), run.name())
            .await?
            .unwrap_or(run);
        if current.status.state.is_terminal() || self.is_active(&current) {
            return Ok(current);
        }

        warn!(run = %current.name(), state = %current.status.state, "Ending interrupted run");
        stream::seal_state(self, &current, Some(INTERRUPTED.to_string())).await?;
        let status = RunStatus {
            state: RunEngineState::Error,
            output: None,
            error: Some(INTERRUPTED.to_string()),
            ended_at: Some(Utc::now()),
        };
        stream::finish_records(self, &current, status).await
    }

    /// Record a turn whose output is `text` without consulting the model.
    ///
    /// The run joins the thread's conversation like any other turn.
    pub async fn echo(&self, request: InvokeRequest, text: &str) -> AppResult<Run> {
        let namespace = request.namespace.as_str();
        let thread = self.resolve_thread(namespace, &request.thread).await?;
        if let Some(run) = self.store.find::<Run>(namespace, &request.run_name).await? {
            return Ok(run);
        }

        let mut run = self.run_record(&request, &thread);
        run.status = RunStatus {
            state: RunEngineState::Continue,
            output: Some(text.to_string()),
            error: None,
            ended_at: Some(Utc::now()),
        };
        let Some(run) = self.create_run(&run).await? else {
            return self.store.get(namespace, &request.run_name).await;
        };
        let run_name = run.metadata.name.clone();

        let mut frames = CallFrames::new();
        frames.insert(
            "call-0".to_string(),
            CallFrame {
                id: "call-0".to_string(),
                parent_id: None,
                tool_name: CHAT_TOOL.to_string(),
                input: request.input.clone(),
                output: vec![CallOutput {
                    content: text.to_string(),
                    ..Default::default()
                }],
            },
        );
        let chat_state = self
            .previous_chat_state(namespace, run.spec.previous_run_name.as_deref())
            .await?;
        let state = RunState {
            metadata: ObjectMeta::named(namespace, &run_name).owned_by(run.owner_ref()),
            spec: RunStateSpec {
                thread_name: thread.metadata.name.clone(),
                program: Some(CompressedBlob::encode(&Program::default())?),
                call_frame: Some(CompressedBlob::encode(&frames)?),
                chat_state,
                done: true,
                error: None,
            },
        };
        match self.store.create(&state).await {
            Ok(_) | Err(AppError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        self.point_thread_at(&thread, &run).await?;
        self.emitter.start_run(&run_name);
        self.emitter.snapshot(&run_name, Program::default(), frames);
        self.emitter.finish(&run_name, None);
        debug!(run = %run_name, "Recorded passthrough run");
        Ok(run)
    }
}
