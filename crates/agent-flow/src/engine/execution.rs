//! Execution-level reconciliation: expand the top-level chain and roll up
//! its state.

use chrono::Utc;
use tracing::{debug, info};

use super::chain::{chain_state, Chain, ChainState};
use super::{thread_request, Engine};
use crate::error::AppResult;
use crate::model::{
    ExecutionState, PassthroughSpec, Resource, Run, Step, StepBody, StepState, Workflow,
    WorkflowExecution, WorkflowExecutionStatus,
};

const OUTPUT_ID: &str = "output";

impl Engine {
    /// Expand and roll up one execution.
    pub async fn reconcile_execution(&self, namespace: &str, name: &str) -> AppResult<()> {
        let Some(execution) = self.store.find::<WorkflowExecution>(namespace, name).await? else {
            debug!(execution = %name, "Execution gone, nothing to reconcile");
            return Ok(());
        };
        if execution.status.state.is_terminal() {
            return Ok(());
        }

        let Some(workflow) = self
            .store
            .find::<Workflow>(namespace, &execution.spec.workflow_name)
            .await?
        else {
            let message = format!("workflow {} not found", execution.spec.workflow_name);
            return self
                .write_execution_status(&execution, |status| {
                    status.state = ExecutionState::Error;
                    status.error = Some(message.clone());
                    status.ended_at = Some(Utc::now());
                })
                .await;
        };

        let thread = self
            .invoker
            .resolve_thread(namespace, &thread_request(&execution))
            .await?;

        let mut steps = Chain::under_execution(&execution)
            .seeded(Some(execution.spec.input.clone()))
            .build(&[], &workflow.spec.steps);
        if let Some(expression) = &workflow.spec.output {
            let output = Chain::under_execution(&execution)
                .after(steps.last().map(|s| s.metadata.name.clone()))
                .single(
                    vec![OUTPUT_ID.to_string()],
                    Step::new(
                        OUTPUT_ID,
                        StepBody::Passthrough(PassthroughSpec {
                            text: None,
                            expression: Some(expression.clone()),
                        }),
                    ),
                );
            steps.push(output);
        }

        let steps = self
            .store
            .apply(&execution.owner_ref(), namespace, steps, true)
            .await?;
        let stored = self.stored_steps(&execution).await?;

        let step_names: Vec<String> = steps.iter().map(|s| s.metadata.name.clone()).collect();
        let thread_name = thread.metadata.name.clone();
        let state = chain_state(&steps, &stored);
        let output = match &state {
            ChainState::Complete {
                last_run_name: Some(run),
            } => self
                .store
                .find::<Run>(namespace, run)
                .await?
                .and_then(|r| r.status.output),
            _ => None,
        };
        let started = steps
            .first()
            .and_then(|s| stored.get(&s.metadata.name))
            .is_some_and(|s| s.status.state != StepState::Pending);

        self.write_execution_status(&execution, |status| {
            status.thread_name = Some(thread_name.clone());
            status.step_names = step_names.clone();
            match &state {
                ChainState::Running => {
                    status.state = if started {
                        ExecutionState::Running
                    } else {
                        ExecutionState::Pending
                    };
                }
                ChainState::Failed(message) => {
                    status.state = ExecutionState::Error;
                    status.error = Some(message.clone());
                    status.ended_at = Some(Utc::now());
                }
                ChainState::Complete { .. } => {
                    status.state = ExecutionState::Complete;
                    status.output = output.clone();
                    status.ended_at = Some(Utc::now());
                }
            }
        })
        .await
    }

    async fn write_execution_status<F>(&self, execution: &WorkflowExecution, mut mutate: F) -> AppResult<()>
    where
        F: FnMut(&mut WorkflowExecutionStatus) + Send,
    {
        let stored = self
            .store
            .mutate_status::<WorkflowExecution, _>(execution.namespace(), execution.name(), |status| {
                if !status.state.is_terminal() {
                    mutate(status);
                }
            })
            .await?;
        if stored.status.state != execution.status.state {
            info!(
                execution = %execution.name(),
                workflow = %execution.spec.workflow_name,
                state = %stored.status.state,
                error = ?stored.status.error,
                "Execution state changed"
            );
        }
        Ok(())
    }
}
