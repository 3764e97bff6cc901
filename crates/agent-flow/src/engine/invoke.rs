//! Leaf steps: one agent turn, or one recorded turn with fixed output.

use tracing::info;

use super::{naming, Advance, Engine, StepView};
use crate::error::AppResult;
use crate::model::{InvokeSpec, PassthroughSpec, Resource, Run, RunEngineState};

impl Engine {
    pub(super) async fn advance_invoke(
        &self,
        view: &StepView<'_>,
        spec: &InvokeSpec,
    ) -> AppResult<Advance> {
        let run_name = naming::run_name(view.step.name());
        if let Some(run) = self.store.find::<Run>(view.step.namespace(), &run_name).await? {
            let run = self.invoker.recover(run).await?;
            return Ok(run_outcome(&run));
        }

        let scope = self.scope(view).await?;
        let rendered = self.evaluator.render(&spec.input, &scope)?;
        let mut request = self
            .invoke_request(view, &run_name, seeded(view.step.spec.input.as_deref(), &rendered))
            .await?;
        request.tools = spec.tools.clone();
        request.agent = spec.agent.clone();

        let response = self.invoker.invoke(request).await?;
        if response.started {
            info!(step = %view.step.name(), run = %run_name, "Started step run");
        }
        Ok(run_outcome(&response.run))
    }

    pub(super) async fn advance_passthrough(
        &self,
        view: &StepView<'_>,
        spec: &PassthroughSpec,
    ) -> AppResult<Advance> {
        let run_name = naming::run_name(view.step.name());
        if let Some(run) = self.store.find::<Run>(view.step.namespace(), &run_name).await? {
            return Ok(run_outcome(&run));
        }

        let text = match (&spec.text, &spec.expression) {
            (Some(text), _) => text.clone(),
            (None, Some(expression)) => {
                let scope = self.scope(view).await?;
                json_text(self.evaluator.eval(expression, &scope)?)
            }
            (None, None) => String::new(),
        };
        let input = view.step.spec.input.clone().unwrap_or_default();
        let request = self.invoke_request(view, &run_name, input).await?;
        let run = self.invoker.echo(request, &text).await?;
        Ok(run_outcome(&run))
    }
}

/// Step outcome implied by the state of the run it started.
pub(super) fn run_outcome(run: &Run) -> Advance {
    let name = run.metadata.name.clone();
    let advance = match run.status.state {
        RunEngineState::Continue => Advance::complete(Vec::new(), None),
        RunEngineState::Finished => Advance::failed(Vec::new(), "Aborted"),
        RunEngineState::Error => Advance::failed(
            Vec::new(),
            run.status.error.clone().unwrap_or_else(|| "run failed".to_string()),
        ),
        _ => Advance::running(Vec::new()),
    };
    advance.with_run(name)
}

/// Instructions prefixed by the chain seed, if any.
pub(super) fn seeded(seed: Option<&str>, instructions: &str) -> String {
    match seed {
        Some(seed) if !seed.trim().is_empty() => format!("{}\n\n{}", seed, instructions),
        _ => instructions.to_string(),
    }
}

/// Plain text for a JSON value: strings as they are, anything else encoded.
pub(super) fn json_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
