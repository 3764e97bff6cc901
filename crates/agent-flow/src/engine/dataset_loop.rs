//! `loop` steps: iterate a dataset the model locates at runtime.
//!
//! A data step asks the model for the dataset's identifier. The dataset is
//! then read directly from the thread's workspace and its elements are
//! processed one after another, each chain seeded with the element's
//! contents.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::chain::{chain_state, Chain, ChainState};
use super::{naming, thread_request, Advance, Child, Engine, StepView};
use crate::codec::CompressedBlob;
use crate::error::{AppError, AppResult};
use crate::model::{LoopSpec, Resource, Step, StepState, Thread};

const DATA_ID: &str = "data";
const DATASET_ID_PATTERN: &str = r"\bds1[a-z0-9]+\b";
const NOT_FOUND: &str = "NOT_FOUND";

fn data_instructions(description: Option<&str>) -> String {
    let what = match description {
        Some(d) if !d.trim().is_empty() => format!("the dataset described as: {}", d.trim()),
        None | Some(_) => "the dataset to iterate over".to_string(),
    };
    format!(
        "Find the identifier of {} in the conversation so far, including tool output. \
         Dataset identifiers start with ds1 followed by lowercase letters and digits. \
         Reply with only the identifier, or {} if there is none.",
        what, NOT_FOUND
    )
}

static DATASET_ID: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn dataset_id_pattern() -> AppResult<&'static Regex> {
    DATASET_ID
        .get_or_init(|| Regex::new(DATASET_ID_PATTERN))
        .as_ref()
        .map_err(|e| AppError::Internal(format!("dataset id pattern: {}", e)))
}

/// First dataset identifier mentioned in `text`.
pub(super) fn find_dataset_id(text: &str) -> AppResult<Option<String>> {
    Ok(dataset_id_pattern()?
        .find(text)
        .map(|m| m.as_str().to_string()))
}

impl Engine {
    pub(super) async fn advance_loop(&self, view: &StepView<'_>, spec: &LoopSpec) -> AppResult<Advance> {
        let path = &view.step.spec.path;
        let chain = Chain::under_step(view.step);
        let data = chain.clone().seeded(view.step.spec.input.clone()).single(
            naming::child_path(path, &[DATA_ID]),
            Step::invoke(DATA_ID, data_instructions(spec.data_description.as_deref())),
        );
        let mut children = vec![Child::Step(data.clone())];

        let Some(stored_data) = view.stored(&data) else {
            return Ok(Advance::running(children));
        };
        match stored_data.status.state {
            StepState::Complete => {}
            StepState::Error => {
                return Ok(Advance::failed(
                    children,
                    format!(
                        "data step failed: {}",
                        stored_data.status.error.as_deref().unwrap_or("unknown error")
                    ),
                ))
            }
            _ => return Ok(Advance::running(children)),
        }

        let answer = self
            .run_of(stored_data)
            .await?
            .and_then(|run| run.status.output)
            .unwrap_or_default();
        let Some(dataset_id) = find_dataset_id(&answer)? else {
            return Ok(Advance::failed(children, "dataset not found"));
        };

        let thread_name = thread_request(view.execution).name;
        let workspace_id = self
            .store
            .find::<Thread>(view.step.namespace(), &thread_name)
            .await?
            .and_then(|t| t.status.workspace_id);
        let Some(workspace_id) = workspace_id else {
            return Ok(Advance::failed(
                children,
                format!("thread {} has no workspace", thread_name),
            ));
        };
        let elements = self
            .datasets
            .read(&workspace_id, &dataset_id)
            .await
            .map_err(|e| AppError::Dataset(format!("reading {}: {}", dataset_id, e)))?;
        let Some(elements) = elements else {
            return Ok(Advance::failed(
                children,
                format!("dataset not found: {}", dataset_id),
            ));
        };
        debug!(step = %view.step.metadata.name, dataset = %dataset_id, elements = elements.len(), "Iterating dataset");

        let mut after = Some(data.metadata.name.clone());
        let mut last_run_name = stored_data.status.last_run_name.clone();
        for (idx, element) in elements.iter().enumerate() {
            let item = CompressedBlob::encode(element)?;
            let body = chain
                .clone()
                .after(after.clone())
                .seeded(Some(element.contents.clone()))
                .with_item(item, &spec.var)
                .build(
                    &naming::child_path(path, &["item", &idx.to_string()]),
                    &spec.steps,
                );
            let state = chain_state(&body, &view.stored);
            if let Some(last) = body.last() {
                after = Some(last.metadata.name.clone());
            }
            children.extend(body.into_iter().map(Child::Step));

            match state {
                ChainState::Running => return Ok(Advance::running(children)),
                ChainState::Failed(message) => {
                    return Ok(Advance::failed(children, format!("item {}: {}", idx, message)))
                }
                ChainState::Complete { last_run_name: run } => {
                    if run.is_some() {
                        last_run_name = run;
                    }
                }
            }
        }

        Ok(Advance::complete(children, last_run_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_dataset_id() {
        assert_eq!(
            find_dataset_id("The dataset is ds1abc42.").unwrap().as_deref(),
            Some("ds1abc42")
        );
        assert_eq!(find_dataset_id("NOT_FOUND").unwrap(), None);
        assert_eq!(find_dataset_id("xds1abc").unwrap(), None);
        assert_eq!(find_dataset_id("ds1").unwrap(), None);
    }

    #[test]
    fn test_dataset_id_pattern_is_compiled_once() {
        let first = dataset_id_pattern().unwrap();
        let second = dataset_id_pattern().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_data_instructions_mention_sentinel() {
        let text = data_instructions(Some(" open issues "));
        assert!(text.contains("described as: open issues"));
        assert!(text.contains(NOT_FOUND));
        assert!(data_instructions(None).contains("dataset to iterate over"));
    }
}
