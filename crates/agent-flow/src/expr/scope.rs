//! Host-controlled objects exposed to expressions.
//!
//! Expressions never see raw records. `workflow`, `steps`, and each step
//! resolve their properties on demand from a [`StepGraph`] snapshot:
//! `steps.<id>` searches the siblings of the current step first, then the
//! siblings of each ancestor, up to the top level.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use minijinja::value::{Enumerator, Object, ObjectRepr, Value};

use crate::error::AppResult;
use crate::model::{Run, WorkflowExecution, WorkflowStep, DEFAULT_ITEM_VAR};
use crate::store::{Selector, StoreClient};

/// Snapshot of one execution's steps and their latest runs.
#[derive(Debug, Default)]
pub struct StepGraph {
    input: String,
    steps: HashMap<String, WorkflowStep>,
    runs: HashMap<String, Run>,
}

impl StepGraph {
    pub fn new(input: impl Into<String>, steps: Vec<WorkflowStep>, runs: Vec<Run>) -> Self {
        Self {
            input: input.into(),
            steps: steps
                .into_iter()
                .map(|s| (s.metadata.name.clone(), s))
                .collect(),
            runs: runs
                .into_iter()
                .map(|r| (r.metadata.name.clone(), r))
                .collect(),
        }
    }

    /// Read the current step graph of `execution` from the store.
    pub async fn load(store: &StoreClient, execution: &WorkflowExecution) -> AppResult<Self> {
        let namespace = execution.metadata.namespace.as_str();
        let steps: Vec<WorkflowStep> = store
            .list(
                namespace,
                &Selector::field("spec.workflowExecutionName", execution.metadata.name.clone()),
            )
            .await?;

        let mut runs = Vec::new();
        for step in &steps {
            if let Some(run_name) = &step.status.last_run_name {
                if let Some(run) = store.find::<Run>(namespace, run_name).await? {
                    runs.push(run);
                }
            }
        }

        Ok(Self::new(execution.spec.input.clone(), steps, runs))
    }

    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.get(name)
    }

    fn run_of(&self, step: &WorkflowStep) -> Option<&Run> {
        step.status
            .last_run_name
            .as_ref()
            .and_then(|name| self.runs.get(name))
    }

    /// Resolve a step by manifest id as seen from `from`.
    fn resolve(&self, from: Option<&WorkflowStep>, id: &str) -> Option<&WorkflowStep> {
        let anchor: &[String] = from.map(|s| s.spec.path.as_slice()).unwrap_or(&[]);
        let mut scope = from.and_then(|s| s.spec.parent_step_name.clone());

        loop {
            let best = self
                .steps
                .values()
                .filter(|s| s.spec.parent_step_name == scope && s.step_id() == id)
                .max_by(|a, b| {
                    common_prefix(&a.spec.path, anchor)
                        .cmp(&common_prefix(&b.spec.path, anchor))
                        .then_with(|| b.metadata.name.cmp(&a.metadata.name))
                });
            if best.is_some() {
                return best;
            }
            let parent = self.steps.get(scope.as_deref()?)?;
            scope = parent.spec.parent_step_name.clone();
        }
    }

    /// Manifest ids visible from `from`, nearest scope first.
    fn visible_ids(&self, from: Option<&WorkflowStep>) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let mut scope = from.and_then(|s| s.spec.parent_step_name.clone());
        loop {
            let mut level: Vec<String> = self
                .steps
                .values()
                .filter(|s| s.spec.parent_step_name == scope)
                .map(|s| s.step_id().to_string())
                .filter(|id| !ids.contains(id))
                .collect();
            level.sort();
            level.dedup();
            ids.extend(level);
            match scope.as_deref().and_then(|name| self.steps.get(name)) {
                Some(parent) => scope = parent.spec.parent_step_name.clone(),
                None => return ids,
            }
        }
    }
}

/// Variables visible to one expression.
#[derive(Debug, Clone)]
pub struct Scope {
    graph: Arc<StepGraph>,
    current: Option<String>,
    item: Option<(String, serde_json::Value)>,
}

impl Scope {
    /// Scope of an execution-level expression: top-level steps only.
    pub fn execution(graph: Arc<StepGraph>) -> Self {
        Self {
            graph,
            current: None,
            item: None,
        }
    }

    /// Scope of an expression evaluated on behalf of `step`.
    ///
    /// The nearest loop element on the step's ancestry is bound under its
    /// variable name.
    pub fn step(graph: Arc<StepGraph>, step: &WorkflowStep) -> AppResult<Self> {
        let mut item = None;
        let mut cursor = Some(step);
        while let Some(node) = cursor {
            if let Some(blob) = &node.spec.for_item {
                let var = node
                    .spec
                    .for_item_var
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ITEM_VAR.to_string());
                item = Some((var, blob.decode::<serde_json::Value>()?));
                break;
            }
            cursor = node
                .spec
                .parent_step_name
                .as_deref()
                .and_then(|name| graph.step(name));
        }

        Ok(Self {
            graph,
            current: Some(step.metadata.name.clone()),
            item,
        })
    }

    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }

    pub(crate) fn context(&self) -> Value {
        let mut vars: HashMap<String, Value> = HashMap::new();
        if let Some((var, value)) = &self.item {
            vars.insert(var.clone(), json_to_value(value));
        }
        vars.insert(
            "workflow".to_string(),
            Value::from_object(WorkflowObject {
                graph: self.graph.clone(),
                current: self.current.clone(),
            }),
        );
        vars.insert(
            "steps".to_string(),
            Value::from_object(StepsObject {
                graph: self.graph.clone(),
                current: self.current.clone(),
            }),
        );
        Value::from_object(vars)
    }
}

fn common_prefix(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// The `workflow` variable.
#[derive(Debug)]
pub(crate) struct WorkflowObject {
    pub graph: Arc<StepGraph>,
    pub current: Option<String>,
}

impl Object for WorkflowObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "input" => Some(Value::from_object(TextObject::new(self.graph.input.clone()))),
            "steps" => Some(Value::from_object(StepsObject {
                graph: self.graph.clone(),
                current: self.current.clone(),
            })),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["input", "steps"])
    }
}

/// The `steps` variable, resolving ids relative to the current step.
#[derive(Debug)]
pub(crate) struct StepsObject {
    pub graph: Arc<StepGraph>,
    pub current: Option<String>,
}

impl StepsObject {
    fn current(&self) -> Option<&WorkflowStep> {
        self.current.as_deref().and_then(|name| self.graph.step(name))
    }
}

impl Object for StepsObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;
        let step = if key == "parent" {
            let parent = self.current()?.spec.parent_step_name.as_deref()?;
            self.graph.step(parent)?
        } else {
            self.graph.resolve(self.current(), key)?
        };
        Some(Value::from_object(StepObject {
            graph: self.graph.clone(),
            name: step.metadata.name.clone(),
        }))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let ids = self.graph.visible_ids(self.current());
        Enumerator::Values(ids.into_iter().map(Value::from).collect())
    }
}

/// One resolved step.
#[derive(Debug)]
pub(crate) struct StepObject {
    graph: Arc<StepGraph>,
    name: String,
}

impl Object for StepObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let step = self.graph.step(&self.name)?;
        match key.as_str()? {
            "id" => Some(Value::from(step.step_id())),
            "state" => Some(Value::from(step.status.state.to_string())),
            "input" => {
                let run = self.graph.run_of(step)?;
                Some(Value::from_object(TextObject::new(run.spec.input.clone())))
            }
            "output" => {
                let output = self.graph.run_of(step)?.status.output.clone()?;
                Some(Value::from_object(TextObject::new(output)))
            }
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["id", "state", "input", "output"])
    }
}

/// Raw text with a `.text` facet and a lazily parsed `.json` facet.
#[derive(Debug)]
pub(crate) struct TextObject {
    raw: String,
}

impl TextObject {
    pub fn new(raw: String) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl Object for TextObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "text" => Some(Value::from(self.raw.clone())),
            // Unparseable JSON simply leaves the facet undefined.
            "json" => serde_json::from_str::<serde_json::Value>(&self.raw)
                .ok()
                .map(|v| json_to_value(&v)),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["text", "json"])
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Convert a JSON value into a template value.
pub(crate) fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::from(()),
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => {
            Value::from(items.iter().map(json_to_value).collect::<Vec<_>>())
        }
        serde_json::Value::Object(map) => {
            let items: HashMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect();
            Value::from_object(items)
        }
    }
}
