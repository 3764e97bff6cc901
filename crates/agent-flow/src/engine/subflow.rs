//! `subflow` steps: a nested execution in the same thread.
//!
//! Once the nested execution completes, an output step records its output
//! as a run of this step, so callers see a single last run regardless of
//! nesting depth.

use super::chain::Chain;
use super::invoke::seeded;
use super::{naming, thread_request, Advance, Child, Engine, StepView};
use crate::error::AppResult;
use crate::model::{
    ExecutionState, ObjectMeta, PassthroughSpec, StepBody, StepState, Step, SubflowSpec,
    WorkflowExecution, WorkflowExecutionSpec, WorkflowExecutionStatus,
};

const OUTPUT_ID: &str = "output";

impl Engine {
    pub(super) async fn advance_subflow(
        &self,
        view: &StepView<'_>,
        spec: &SubflowSpec,
    ) -> AppResult<Advance> {
        let step = view.step;
        let name = naming::subflow_execution_name(&step.metadata.name);
        let input = match &spec.input {
            Some(template) => {
                let scope = self.scope(view).await?;
                self.evaluator.render(template, &scope)?
            }
            None => String::new(),
        };
        let nested = WorkflowExecution {
            metadata: ObjectMeta::named("", name.clone()),
            spec: WorkflowExecutionSpec {
                workflow_name: spec.workflow.clone(),
                input: seeded(step.spec.input.as_deref(), &input),
                thread_name: Some(thread_request(view.execution).name),
                previous_run_name: self.anchor(view).await?,
                parent_step_name: Some(step.metadata.name.clone()),
            },
            status: WorkflowExecutionStatus::default(),
        };
        let mut children = vec![Child::Execution(nested)];

        let Some(stored) = self
            .store
            .find::<WorkflowExecution>(&step.metadata.namespace, &name)
            .await?
        else {
            return Ok(Advance::running(children));
        };
        match stored.status.state {
            ExecutionState::Complete => {}
            ExecutionState::Error => {
                return Ok(Advance::failed(
                    children,
                    format!(
                        "subflow {} failed: {}",
                        spec.workflow,
                        stored.status.error.as_deref().unwrap_or("unknown error")
                    ),
                ))
            }
            _ => return Ok(Advance::running(children)),
        }

        let mut output = Chain::under_step(step)
            .after(stored.status.step_names.last().cloned())
            .single(
                naming::child_path(&step.spec.path, &[OUTPUT_ID]),
                Step::new(
                    OUTPUT_ID,
                    StepBody::Passthrough(PassthroughSpec {
                        text: Some(stored.status.output.clone().unwrap_or_default()),
                        expression: None,
                    }),
                ),
            );
        // Chained after the nested execution's last step for chat
        // continuity only; it is already complete.
        output.spec.dont_wait = true;
        children.push(Child::Step(output.clone()));

        Ok(match view.stored(&output) {
            Some(s) if s.status.state == StepState::Complete => {
                Advance::complete(children, s.status.last_run_name.clone())
            }
            Some(s) if s.status.state == StepState::Error => Advance::failed(
                children,
                s.status.error.clone().unwrap_or_else(|| "output step failed".to_string()),
            ),
            _ => Advance::running(children),
        })
    }
}
