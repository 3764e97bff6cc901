//! Interactive prompts raised by a running turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use super::Invoker;
use crate::error::{AppError, AppResult};
use crate::model::{
    ObjectMeta, Progress, Prompt, PromptProgress, PromptSpec, PromptStatus, Resource, Run,
};
use crate::runtime::{PromptRequest, RuntimeExecution};

type Answer = Result<BTreeMap<String, String>, String>;

impl Invoker {
    /// Persist the prompt, announce it, and wait (bounded) for an answer.
    ///
    /// The turn always gets an answer: store failures are delivered to it
    /// as a failed answer instead of leaving it waiting.
    pub(super) async fn handle_prompt(
        &self,
        run: &Run,
        execution: Arc<dyn RuntimeExecution>,
        request: PromptRequest,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> AppResult<()> {
        let answer = match self.await_answer(run, &request, progress).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(run = %run.name(), prompt = %request.id, error = %e, "Prompt failed");
                Err(format!("prompt {} failed: {}", request.id, e))
            }
        };

        execution
            .respond_prompt(&request.id, answer)
            .await
            .map_err(|e| AppError::Runtime(format!("failed to deliver prompt answer: {}", e)))
    }

    async fn await_answer(
        &self,
        run: &Run,
        request: &PromptRequest,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> AppResult<Answer> {
        let run_name = run.metadata.name.clone();
        let name = format!("{}-{}", run_name, request.id);
        let prompt = Prompt {
            metadata: ObjectMeta::named(run.namespace(), &name).owned_by(run.owner_ref()),
            spec: PromptSpec {
                run_name: run_name.clone(),
                thread_name: run.spec.thread_name.clone(),
                message: request.message.clone(),
                fields: request.fields.clone(),
                sensitive: request.sensitive,
            },
            status: PromptStatus::default(),
        };
        match self.store.create(&prompt).await {
            Ok(_) | Err(AppError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        let frame = Progress {
            prompt: Some(PromptProgress {
                name: name.clone(),
                message: request.message.clone(),
                fields: request.fields.clone(),
                sensitive: request.sensitive,
            }),
            ..Progress::content(&run_name, "")
        };
        let _ = progress.send(frame.clone());
        self.emitter.progress(&run_name, frame);
        info!(run = %run_name, prompt = %name, "Waiting on prompt");

        let deadline = Instant::now() + self.config.prompt_timeout();
        let mut poll = tokio::time::interval(self.config.prompt_poll_interval());
        loop {
            poll.tick().await;
            match self.store.get::<Prompt>(run.namespace(), &name).await {
                Ok(current) => {
                    if let Some(response) = current.status.response {
                        return Ok(Ok(response));
                    }
                }
                // Transient store trouble is retried until the deadline.
                Err(e) if e.is_transient() => {
                    warn!(run = %run_name, prompt = %name, error = %e, "Polling prompt failed");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                warn!(run = %run_name, prompt = %name, "Prompt timed out");
                return Ok(Err(format!("prompt {} timed out", name)));
            }
        }
    }
}
