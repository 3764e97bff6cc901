//! `if` steps and the condition steps shared with `while`.

use super::chain::{chain_state, Chain, ChainState};
use super::{naming, Advance, Child, Engine, StepView};
use crate::error::AppResult;
use crate::model::{IfSpec, StepState, Step, WorkflowStep};

/// Manifest id of synthesized condition steps.
pub(super) const CONDITION_ID: &str = "condition";

/// Interpret a model answer as a boolean.
///
/// Case, surrounding whitespace and quotes are ignored. Returns `None` for
/// anything that is not clearly one of `true/yes/t/y` or `false/no/f/n`.
pub fn parse_truthy(answer: &str) -> Option<bool> {
    let cleaned = answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c.is_whitespace())
        .to_ascii_lowercase();
    match cleaned.as_str() {
        "true" | "yes" | "t" | "y" => Some(true),
        "false" | "no" | "f" | "n" => Some(false),
        _ => None,
    }
}

fn condition_instructions(condition: &str) -> String {
    format!(
        "Decide whether the following condition holds, based on the conversation so far.\n\n\
         Condition: {}\n\n\
         Reply with exactly one word: TRUE or FALSE.",
        condition.trim()
    )
}

/// Condition step asking `condition` at `path`.
pub(super) fn condition_step(chain: &Chain, path: Vec<String>, condition: &str) -> WorkflowStep {
    chain.single(path, Step::invoke(CONDITION_ID, condition_instructions(condition)))
}

/// What a condition step has decided so far.
#[derive(Debug, PartialEq)]
pub(super) enum Verdict {
    Waiting,
    Holds {
        value: bool,
        run_name: Option<String>,
    },
    Failed(String),
}

impl Engine {
    pub(super) async fn verdict(
        &self,
        view: &StepView<'_>,
        condition: &WorkflowStep,
    ) -> AppResult<Verdict> {
        let Some(stored) = view.stored(condition) else {
            return Ok(Verdict::Waiting);
        };
        match stored.status.state {
            StepState::Error => Ok(Verdict::Failed(format!(
                "condition failed: {}",
                stored.status.error.as_deref().unwrap_or("unknown error")
            ))),
            StepState::Complete => {
                let answer = self
                    .run_of(stored)
                    .await?
                    .and_then(|run| run.status.output)
                    .unwrap_or_default();
                Ok(match parse_truthy(&answer) {
                    Some(value) => Verdict::Holds {
                        value,
                        run_name: stored.status.last_run_name.clone(),
                    },
                    None => Verdict::Failed(format!(
                        "ambiguous condition result: {:?}",
                        answer.trim()
                    )),
                })
            }
            _ => Ok(Verdict::Waiting),
        }
    }

    pub(super) async fn advance_if(&self, view: &StepView<'_>, spec: &IfSpec) -> AppResult<Advance> {
        let path = &view.step.spec.path;
        let chain = Chain::under_step(view.step);
        let condition = condition_step(
            &chain.clone().seeded(view.step.spec.input.clone()),
            naming::child_path(path, &[CONDITION_ID]),
            &spec.condition,
        );
        let mut children = vec![Child::Step(condition.clone())];

        let (value, condition_run) = match self.verdict(view, &condition).await? {
            Verdict::Waiting => return Ok(Advance::running(children)),
            Verdict::Failed(message) => return Ok(Advance::failed(children, message)),
            Verdict::Holds { value, run_name } => (value, run_name),
        };

        let (segment, steps) = if value {
            ("then", &spec.steps)
        } else {
            ("else", &spec.else_steps)
        };
        let branch = chain
            .after(Some(condition.metadata.name.clone()))
            .build(&naming::child_path(path, &[segment]), steps);
        let state = chain_state(&branch, &view.stored);
        children.extend(branch.into_iter().map(Child::Step));

        Ok(match state {
            ChainState::Running => Advance::running(children),
            ChainState::Failed(message) => Advance::failed(children, message),
            ChainState::Complete { last_run_name } => {
                Advance::complete(children, last_run_name.or(condition_run))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_truthy() {
        for yes in ["TRUE", "Yes", " y ", "\"true\"", "'T'", "yes\n"] {
            assert_eq!(parse_truthy(yes), Some(true), "{:?}", yes);
        }
        for no in ["false", "No", "N", "`f`", "  FALSE  "] {
            assert_eq!(parse_truthy(no), Some(false), "{:?}", no);
        }
        for unclear in ["maybe", "", "true.", "yes and no", "TRUE FALSE"] {
            assert_eq!(parse_truthy(unclear), None, "{:?}", unclear);
        }
    }

    #[test]
    fn test_condition_instructions_ask_for_one_word() {
        let text = condition_instructions("  the build is green ");
        assert!(text.contains("Condition: the build is green\n"));
        assert!(text.ends_with("TRUE or FALSE."));
    }
}
