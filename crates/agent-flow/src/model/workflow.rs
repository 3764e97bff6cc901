//! Workflow manifests.
//!
//! A workflow is an ordered list of steps. Each step carries exactly one
//! body kind; control bodies (`if`, `while`, `forEach`, `loop`) nest further
//! step lists, `subflow` references another workflow by name.
//!
//! ```yaml
//! description: triage an issue
//! steps:
//!   - id: summarize
//!     invoke:
//!       input: "Summarize {{ workflow.input.text }}"
//!   - id: check
//!     if:
//!       condition: the summary mentions a security problem
//!       steps:
//!         - id: escalate
//!           invoke: { input: "Draft an escalation note" }
//!       else:
//!         - id: close
//!           invoke: { input: "Draft a closing comment" }
//! output: "{{ steps.check.output.text }}"
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::meta::{Kind, ObjectMeta, Resource};
use crate::error::{AppError, AppResult};

/// Default loop variable for `forEach` and `loop` bodies.
pub const DEFAULT_ITEM_VAR: &str = "item";

/// A stored workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowManifest,
}

impl Resource for Workflow {
    const KIND: Kind = Kind::Workflow;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Workflow {
    /// Parse and validate a YAML manifest.
    pub fn from_yaml(namespace: &str, name: &str, yaml: &str) -> AppResult<Self> {
        let spec: WorkflowManifest = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(Self {
            metadata: ObjectMeta::named(namespace, name),
            spec,
        })
    }
}

/// The authored content of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Expression evaluated after the last step; its value becomes the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl WorkflowManifest {
    pub fn validate(&self) -> AppResult<()> {
        validate_steps(&self.steps, "steps")?;
        if let Some(output) = &self.output {
            if output.trim().is_empty() {
                return Err(AppError::Validation(
                    "output expression must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One manifest step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub body: StepBody,
}

impl Step {
    pub fn new(id: impl Into<String>, body: StepBody) -> Self {
        Self {
            id: id.into(),
            description: None,
            body,
        }
    }

    pub fn invoke(id: impl Into<String>, input: impl Into<String>) -> Self {
        Self::new(
            id,
            StepBody::Invoke(InvokeSpec {
                input: input.into(),
                ..Default::default()
            }),
        )
    }
}

/// Closed set of step kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepBody {
    Invoke(InvokeSpec),
    If(IfSpec),
    While(WhileSpec),
    ForEach(ForEachSpec),
    Loop(LoopSpec),
    Subflow(SubflowSpec),
    /// Produces a run whose output is given text (or an expression's value)
    /// without consulting the model.
    Passthrough(PassthroughSpec),
}

impl StepBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepBody::Invoke(_) => "invoke",
            StepBody::If(_) => "if",
            StepBody::While(_) => "while",
            StepBody::ForEach(_) => "forEach",
            StepBody::Loop(_) => "loop",
            StepBody::Subflow(_) => "subflow",
            StepBody::Passthrough(_) => "passthrough",
        }
    }
}

/// A single agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeSpec {
    /// Instructions; rendered as a template before the turn starts.
    pub input: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfSpec {
    /// Natural-language condition answered by the model.
    pub condition: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, rename = "else")]
    pub else_steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhileSpec {
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loops: Option<u32>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachSpec {
    /// Expression producing an array.
    pub items: String,
    #[serde(default = "default_item_var")]
    pub var: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Iterate a dataset located at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSpec {
    /// Hint given to the model when locating the dataset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_description: Option<String>,
    #[serde(default = "default_item_var")]
    pub var: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowSpec {
    pub workflow: String,
    /// Input template for the nested execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

fn default_item_var() -> String {
    DEFAULT_ITEM_VAR.to_string()
}

fn validate_steps(steps: &[Step], location: &str) -> AppResult<()> {
    let mut seen = HashSet::new();
    for (idx, step) in steps.iter().enumerate() {
        let here = format!("{}[{}]", location, idx);
        if step.id.trim().is_empty() {
            return Err(AppError::Validation(format!("{}: step id is required", here)));
        }
        if step.id == "parent" {
            return Err(AppError::Validation(format!(
                "{}: 'parent' is reserved and cannot be used as a step id",
                here
            )));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(AppError::Validation(format!(
                "{}: duplicate step id '{}'",
                here, step.id
            )));
        }
        validate_body(&step.body, &format!("{}({})", here, step.id))?;
    }
    Ok(())
}

fn validate_body(body: &StepBody, here: &str) -> AppResult<()> {
    let required = |value: &str, what: &str| -> AppResult<()> {
        if value.trim().is_empty() {
            Err(AppError::Validation(format!("{}: {} is required", here, what)))
        } else {
            Ok(())
        }
    };

    match body {
        StepBody::Invoke(spec) => required(&spec.input, "invoke.input"),
        StepBody::If(spec) => {
            required(&spec.condition, "if.condition")?;
            validate_steps(&spec.steps, &format!("{}.if.steps", here))?;
            validate_steps(&spec.else_steps, &format!("{}.if.else", here))
        }
        StepBody::While(spec) => {
            required(&spec.condition, "while.condition")?;
            if spec.max_loops == Some(0) {
                return Err(AppError::Validation(format!(
                    "{}: while.maxLoops must be at least 1",
                    here
                )));
            }
            validate_steps(&spec.steps, &format!("{}.while.steps", here))
        }
        StepBody::ForEach(spec) => {
            required(&spec.items, "forEach.items")?;
            required(&spec.var, "forEach.var")?;
            validate_steps(&spec.steps, &format!("{}.forEach.steps", here))
        }
        StepBody::Loop(spec) => {
            required(&spec.var, "loop.var")?;
            validate_steps(&spec.steps, &format!("{}.loop.steps", here))
        }
        StepBody::Subflow(spec) => required(&spec.workflow, "subflow.workflow"),
        StepBody::Passthrough(spec) => {
            if spec.text.is_none() && spec.expression.is_none() {
                Err(AppError::Validation(format!(
                    "{}: passthrough needs text or expression",
                    here
                )))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
description: triage
steps:
  - id: summarize
    invoke:
      input: "Summarize {{ workflow.input.text }}"
  - id: check
    if:
      condition: the summary mentions a security problem
      steps:
        - id: escalate
          invoke: { input: "Draft an escalation note" }
      else:
        - id: close
          invoke: { input: "Draft a closing comment" }
  - id: each
    forEach:
      items: "workflow.input.json.files"
      var: file
      steps:
        - id: review
          invoke: { input: "Review {{ file }}" }
  - id: retry
    while:
      condition: the tests still fail
      maxLoops: 2
      steps:
        - id: fix
          invoke: { input: "Fix the failing test" }
output: "steps.check.output.text"
"#;

    #[test]
    fn test_parse_manifest() {
        let wf = Workflow::from_yaml("default", "triage", MANIFEST).unwrap();
        assert_eq!(wf.metadata.name, "triage");
        assert_eq!(wf.spec.steps.len(), 4);
        assert_eq!(wf.spec.steps[1].body.kind_name(), "if");
        match &wf.spec.steps[1].body {
            StepBody::If(spec) => {
                assert_eq!(spec.steps[0].id, "escalate");
                assert_eq!(spec.else_steps[0].id, "close");
            }
            other => panic!("unexpected body {:?}", other),
        }
        match &wf.spec.steps[2].body {
            StepBody::ForEach(spec) => assert_eq!(spec.var, "file"),
            other => panic!("unexpected body {:?}", other),
        }
        match &wf.spec.steps[3].body {
            StepBody::While(spec) => assert_eq!(spec.max_loops, Some(2)),
            other => panic!("unexpected body {:?}", other),
        }
        assert!(wf.spec.output.is_some());
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let yaml = r#"
steps:
  - id: a
    invoke: { input: "x" }
  - id: a
    invoke: { input: "y" }
"#;
        let err = Workflow::from_yaml("default", "dup", yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_nested_validation() {
        let yaml = r#"
steps:
  - id: loop
    while:
      condition: go on
      maxLoops: 0
      steps: []
"#;
        let err = Workflow::from_yaml("default", "bad", yaml).unwrap_err();
        assert!(err.to_string().contains("maxLoops"));
    }

    #[test]
    fn test_reserved_parent_id() {
        let yaml = r#"
steps:
  - id: parent
    invoke: { input: "x" }
"#;
        assert!(Workflow::from_yaml("default", "bad", yaml).is_err());
    }

    #[test]
    fn test_default_item_var() {
        let yaml = r#"
steps:
  - id: each
    forEach:
      items: "[1, 2]"
      steps:
        - id: say
          invoke: { input: "{{ item }}" }
"#;
        let wf = Workflow::from_yaml("default", "each", yaml).unwrap();
        match &wf.spec.steps[0].body {
            StepBody::ForEach(spec) => assert_eq!(spec.var, DEFAULT_ITEM_VAR),
            other => panic!("unexpected body {:?}", other),
        }
    }
}
