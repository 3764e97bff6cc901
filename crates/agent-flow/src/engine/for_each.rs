//! `forEach` steps: one independent chain per array element.

use super::chain::{chain_state, Chain, ChainState};
use super::{naming, Advance, Child, Engine, StepView};
use crate::codec::CompressedBlob;
use crate::error::AppResult;
use crate::model::ForEachSpec;

impl Engine {
    pub(super) async fn advance_for_each(
        &self,
        view: &StepView<'_>,
        spec: &ForEachSpec,
    ) -> AppResult<Advance> {
        let scope = self.scope(view).await?;
        let items = self.evaluator.eval_array(&spec.items, &scope)?;
        let chain = Chain::under_step(view.step).seeded(view.step.spec.input.clone());

        let mut children = Vec::new();
        let mut states = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let element = chain
                .clone()
                .with_item(CompressedBlob::encode(item)?, &spec.var)
                .build(
                    &naming::child_path(&view.step.spec.path, &["item", &idx.to_string()]),
                    &spec.steps,
                );
            states.push(chain_state(&element, &view.stored));
            children.extend(element.into_iter().map(Child::Step));
        }

        // Elements still running are left alone when another one fails.
        if let Some((idx, message)) = states.iter().enumerate().find_map(|(idx, s)| match s {
            ChainState::Failed(message) => Some((idx, message)),
            _ => None,
        }) {
            return Ok(Advance::failed(children, format!("item {}: {}", idx, message)));
        }
        if states.iter().any(|s| *s == ChainState::Running) {
            return Ok(Advance::running(children));
        }
        let last_run_name = states.into_iter().rev().find_map(|s| match s {
            ChainState::Complete { last_run_name } => last_run_name,
            _ => None,
        });
        Ok(Advance::complete(children, last_run_name))
    }
}
