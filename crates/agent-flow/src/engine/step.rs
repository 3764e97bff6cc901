//! Per-step reconciliation: gating, dispatch, child apply, status write.

use tracing::{debug, info};

use super::{Advance, Child, Engine, StepView};
use crate::error::{AppError, AppResult};
use crate::model::{Resource, StepBody, StepState, WorkflowExecution, WorkflowStep};

impl Engine {
    /// Advance one step as far as its stored surroundings allow.
    pub async fn reconcile_step(&self, namespace: &str, name: &str) -> AppResult<()> {
        let Some(step) = self.store.find::<WorkflowStep>(namespace, name).await? else {
            debug!(step = %name, "Step gone, nothing to reconcile");
            return Ok(());
        };
        if step.status.state.is_terminal() {
            return Ok(());
        }

        if !self.predecessor_complete(&step).await? {
            if step.status.state != StepState::Pending {
                self.store
                    .mutate_status::<WorkflowStep, _>(namespace, name, |status| {
                        status.state = StepState::Pending;
                    })
                    .await?;
            }
            debug!(step = %name, after = ?step.spec.after_step_name, "Waiting for predecessor");
            return Ok(());
        }

        let Some(execution) = self
            .store
            .find::<WorkflowExecution>(namespace, &step.spec.workflow_execution_name)
            .await?
        else {
            debug!(step = %name, "Execution gone, leaving step to cascade");
            return Ok(());
        };

        let view = StepView {
            execution: &execution,
            step: &step,
            stored: self.stored_steps(&execution).await?,
        };
        let advance = match self.advance(&view).await {
            Ok(advance) => advance,
            Err(AppError::Expression(message)) => {
                Advance::failed_in_place(format!("expression error: {}", message))
            }
            Err(e) => return Err(e),
        };

        self.apply_children(&step, advance.children.as_deref()).await?;
        self.write_step_status(&step, advance).await
    }

    async fn predecessor_complete(&self, step: &WorkflowStep) -> AppResult<bool> {
        let Some(after) = &step.spec.after_step_name else {
            return Ok(true);
        };
        if step.spec.dont_wait {
            return Ok(true);
        }
        Ok(self
            .store
            .find::<WorkflowStep>(step.namespace(), after)
            .await?
            .is_some_and(|s| s.status.state == StepState::Complete))
    }

    async fn advance(&self, view: &StepView<'_>) -> AppResult<Advance> {
        match &view.step.spec.step.body {
            StepBody::Invoke(spec) => self.advance_invoke(view, spec).await,
            StepBody::Passthrough(spec) => self.advance_passthrough(view, spec).await,
            StepBody::If(spec) => self.advance_if(view, spec).await,
            StepBody::While(spec) => self.advance_while(view, spec).await,
            StepBody::ForEach(spec) => self.advance_for_each(view, spec).await,
            StepBody::Loop(spec) => self.advance_loop(view, spec).await,
            StepBody::Subflow(spec) => self.advance_subflow(view, spec).await,
        }
    }

    /// Make `children` the complete owned child set of `owner`.
    async fn apply_children(&self, owner: &WorkflowStep, children: Option<&[Child]>) -> AppResult<()> {
        let Some(children) = children else {
            return Ok(());
        };
        let mut steps = Vec::new();
        let mut executions = Vec::new();
        for child in children {
            match child {
                Child::Step(s) => steps.push(s.clone()),
                Child::Execution(e) => executions.push(e.clone()),
            }
        }
        let owner_ref = owner.owner_ref();
        self.store
            .apply(&owner_ref, owner.namespace(), steps, true)
            .await?;
        self.store
            .apply(&owner_ref, owner.namespace(), executions, true)
            .await?;
        Ok(())
    }

    async fn write_step_status(&self, step: &WorkflowStep, advance: Advance) -> AppResult<()> {
        let stored = self
            .store
            .mutate_status::<WorkflowStep, _>(step.namespace(), step.name(), |status| {
                if status.state.is_terminal() {
                    return;
                }
                status.state = advance.state;
                status.error = advance.error.clone();
                if advance.last_run_name.is_some() {
                    status.last_run_name = advance.last_run_name.clone();
                }
                if let Some(run) = &advance.run_name {
                    if !status.run_names.contains(run) {
                        status.run_names.push(run.clone());
                    }
                }
            })
            .await?;

        if stored.status.state != step.status.state {
            info!(
                step = %step.name(),
                id = %step.step_id(),
                kind = step.spec.step.body.kind_name(),
                state = %stored.status.state,
                error = ?stored.status.error,
                "Step state changed"
            );
        }
        Ok(())
    }
}
