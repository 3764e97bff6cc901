//! `while` steps.
//!
//! Iteration `i` lives under `[.., i]`: a condition step, then (when the
//! condition holds) the body chained after it. Iteration `i + 1` starts
//! only once the body of iteration `i` is complete. One check past the
//! bound is made; if the condition still holds the step fails.

use super::chain::{chain_state, Chain, ChainState};
use super::condition::{condition_step, Verdict, CONDITION_ID};
use super::{naming, Advance, Child, Engine, StepView};
use crate::error::AppResult;
use crate::model::WhileSpec;

impl Engine {
    pub(super) async fn advance_while(
        &self,
        view: &StepView<'_>,
        spec: &WhileSpec,
    ) -> AppResult<Advance> {
        let max_loops = spec.max_loops.unwrap_or(self.config.default_max_loops);
        let chain = Chain::under_step(view.step);
        let mut children = Vec::new();
        let mut after: Option<String> = None;
        let mut body_run: Option<String> = None;

        for iteration in 0..=max_loops {
            let base = naming::child_path(&view.step.spec.path, &[&iteration.to_string()]);
            let seed = if iteration == 0 {
                view.step.spec.input.clone()
            } else {
                None
            };
            let condition = condition_step(
                &chain.clone().after(after.clone()).seeded(seed),
                naming::child_path(&base, &[CONDITION_ID]),
                &spec.condition,
            );
            children.push(Child::Step(condition.clone()));

            let condition_run = match self.verdict(view, &condition).await? {
                Verdict::Waiting => return Ok(Advance::running(children)),
                Verdict::Failed(message) => return Ok(Advance::failed(children, message)),
                Verdict::Holds { value: false, run_name } => {
                    return Ok(Advance::complete(children, body_run.or(run_name)));
                }
                Verdict::Holds { value: true, run_name } => run_name,
            };
            if iteration == max_loops {
                return Ok(Advance::failed(
                    children,
                    format!("MaxLoops exceeded: condition still true after {} loops", max_loops),
                ));
            }

            let body = chain
                .clone()
                .after(Some(condition.metadata.name.clone()))
                .build(&naming::child_path(&base, &["body"]), &spec.steps);
            let state = chain_state(&body, &view.stored);
            after = Some(
                body.last()
                    .map(|s| s.metadata.name.clone())
                    .unwrap_or_else(|| condition.metadata.name.clone()),
            );
            children.extend(body.into_iter().map(Child::Step));

            match state {
                ChainState::Running => return Ok(Advance::running(children)),
                ChainState::Failed(message) => return Ok(Advance::failed(children, message)),
                ChainState::Complete { last_run_name } => {
                    body_run = last_run_name.or(condition_run);
                }
            }
        }

        Ok(Advance::failed(children, "MaxLoops exceeded"))
    }
}
