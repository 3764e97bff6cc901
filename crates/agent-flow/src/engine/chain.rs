//! Expansion of step lists into chained step instances.

use std::collections::HashMap;

use super::naming;
use crate::codec::CompressedBlob;
use crate::model::{
    ObjectMeta, Step, StepState, WorkflowExecution, WorkflowStep, WorkflowStepSpec,
    WorkflowStepStatus,
};

/// Builds the instances of a step list: each waits for the one before it.
#[derive(Debug, Clone)]
pub(crate) struct Chain {
    execution_name: String,
    workflow_name: String,
    parent_step_name: Option<String>,
    after: Option<String>,
    seed: Option<String>,
    for_item: Option<CompressedBlob>,
    for_item_var: Option<String>,
}

impl Chain {
    /// Top-level steps of an execution.
    pub fn under_execution(execution: &WorkflowExecution) -> Self {
        Self {
            execution_name: execution.metadata.name.clone(),
            workflow_name: execution.spec.workflow_name.clone(),
            parent_step_name: None,
            after: None,
            seed: None,
            for_item: None,
            for_item_var: None,
        }
    }

    /// Steps spawned by a control step.
    pub fn under_step(parent: &WorkflowStep) -> Self {
        Self {
            execution_name: parent.spec.workflow_execution_name.clone(),
            workflow_name: parent.spec.workflow_name.clone(),
            parent_step_name: Some(parent.metadata.name.clone()),
            after: None,
            seed: None,
            for_item: None,
            for_item_var: None,
        }
    }

    /// The first step waits for `after`.
    pub fn after(mut self, after: Option<String>) -> Self {
        self.after = after;
        self
    }

    /// Text prepended to the first step's instructions.
    pub fn seeded(mut self, seed: Option<String>) -> Self {
        self.seed = seed.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_item(mut self, item: CompressedBlob, var: &str) -> Self {
        self.for_item = Some(item);
        self.for_item_var = Some(var.to_string());
        self
    }

    /// One standalone instance at `path`.
    pub fn single(&self, path: Vec<String>, step: Step) -> WorkflowStep {
        let name = naming::step_name(&self.execution_name, &path);
        WorkflowStep {
            metadata: ObjectMeta::named("", name),
            spec: WorkflowStepSpec {
                workflow_execution_name: self.execution_name.clone(),
                workflow_name: self.workflow_name.clone(),
                path,
                after_step_name: self.after.clone(),
                dont_wait: false,
                parent_step_name: self.parent_step_name.clone(),
                step,
                input: self.seed.clone(),
                for_item: self.for_item.clone(),
                for_item_var: self.for_item_var.clone(),
            },
            status: WorkflowStepStatus::default(),
        }
    }

    /// Instances of `steps` under `base`, each after the previous one.
    pub fn build(&self, base: &[String], steps: &[Step]) -> Vec<WorkflowStep> {
        let mut out: Vec<WorkflowStep> = Vec::with_capacity(steps.len());
        for (idx, step) in steps.iter().enumerate() {
            let link = match out.last() {
                Some(prev) => Self {
                    after: Some(prev.metadata.name.clone()),
                    seed: None,
                    ..self.clone()
                },
                None => self.clone(),
            };
            out.push(link.single(naming::child_path(base, &[&idx.to_string()]), step.clone()));
        }
        out
    }
}

/// Aggregate progress of a chain of instances.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChainState {
    Running,
    Complete { last_run_name: Option<String> },
    Failed(String),
}

/// Inspect the stored state of `chain`.
///
/// Any failed instance fails the chain. The chain is complete when every
/// instance is; its last run is the last one produced along it.
pub(crate) fn chain_state(chain: &[WorkflowStep], stored: &HashMap<String, WorkflowStep>) -> ChainState {
    let mut last_run_name = None;
    let mut complete = true;
    for step in chain {
        match stored.get(&step.metadata.name) {
            Some(s) if s.status.state == StepState::Error => {
                return ChainState::Failed(format!(
                    "step {} failed: {}",
                    s.step_id(),
                    s.status.error.as_deref().unwrap_or("unknown error")
                ));
            }
            Some(s) if s.status.state == StepState::Complete => {
                if s.status.last_run_name.is_some() {
                    last_run_name = s.status.last_run_name.clone();
                }
            }
            _ => complete = false,
        }
    }
    if complete {
        ChainState::Complete { last_run_name }
    } else {
        ChainState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowExecution;

    fn steps() -> Vec<Step> {
        vec![Step::invoke("a", "do a"), Step::invoke("b", "do b")]
    }

    #[test]
    fn test_build_links_and_seeds_first_only() {
        let execution = WorkflowExecution::new("default", "we1", "wf", "input");
        let chain = Chain::under_execution(&execution)
            .after(Some("before".into()))
            .seeded(Some("context".into()))
            .build(&[], &steps());

        assert_eq!(chain[0].spec.after_step_name.as_deref(), Some("before"));
        assert_eq!(chain[0].spec.input.as_deref(), Some("context"));
        assert_eq!(
            chain[1].spec.after_step_name.as_deref(),
            Some(chain[0].metadata.name.as_str())
        );
        assert!(chain[1].spec.input.is_none());
        assert_eq!(chain[1].spec.path, vec!["1".to_string()]);
    }

    #[test]
    fn test_chain_state() {
        let execution = WorkflowExecution::new("default", "we1", "wf", "");
        let chain = Chain::under_execution(&execution).build(&[], &steps());
        let mut stored: HashMap<String, WorkflowStep> = HashMap::new();
        assert_eq!(chain_state(&chain, &stored), ChainState::Running);

        for (step, run) in chain.iter().zip(["r1", "r2"]) {
            let mut s = step.clone();
            s.status.complete(Some(run.into()));
            stored.insert(s.metadata.name.clone(), s);
        }
        assert_eq!(
            chain_state(&chain, &stored),
            ChainState::Complete {
                last_run_name: Some("r2".into())
            }
        );

        let second = stored.get_mut(&chain[1].metadata.name).unwrap();
        second.status.fail("boom");
        assert!(matches!(chain_state(&chain, &stored), ChainState::Failed(m) if m.contains("boom")));

        assert_eq!(
            chain_state(&[], &stored),
            ChainState::Complete { last_run_name: None }
        );
    }
}
