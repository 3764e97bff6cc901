//! Expression compilation and typed evaluation.

use minijinja::value::ValueKind;
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior, Value};

use super::scope::{json_to_value, Scope, TextObject};
use crate::error::{AppError, AppResult};

/// Evaluates expressions and renders templates against a [`Scope`].
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn environment<'s>(&self) -> Environment<'s> {
        let mut env = Environment::new();
        // Missing keys chain to undefined instead of failing the lookup.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        env.add_filter("tojson", filter_tojson);
        env.add_filter("fromjson", filter_fromjson);
        env.add_filter("default", filter_default);
        env.add_filter("trim", filter_trim);
        env.add_filter("lines", filter_lines);

        env.add_test("defined", test_defined);
        env.add_test("undefined", test_undefined);
        env
    }

    fn eval_value(&self, expression: &str, scope: &Scope) -> AppResult<Value> {
        let env = self.environment();
        let compiled = env.compile_expression(expression).map_err(|e| {
            AppError::Expression(format!("failed to parse expression '{}': {}", expression, e))
        })?;
        compiled.eval(scope.context()).map_err(|e| {
            AppError::Expression(format!("failed to evaluate '{}': {}", expression, e))
        })
    }

    /// Evaluate to a JSON value. Undefined results become `null`.
    pub fn eval(&self, expression: &str, scope: &Scope) -> AppResult<serde_json::Value> {
        let value = self.eval_value(expression, scope)?;
        Ok(value_to_json(&value))
    }

    pub fn eval_bool(&self, expression: &str, scope: &Scope) -> AppResult<bool> {
        let value = self.eval_value(expression, scope)?;
        match value.kind() {
            ValueKind::Bool => Ok(value.is_true()),
            other => Err(AppError::Expression(format!(
                "'{}' evaluated to {} where a boolean was expected",
                expression, other
            ))),
        }
    }

    /// Evaluate to text. Step inputs and outputs count as their raw text.
    pub fn eval_string(&self, expression: &str, scope: &Scope) -> AppResult<String> {
        let value = self.eval_value(expression, scope)?;
        if let Some(s) = value.as_str() {
            return Ok(s.to_string());
        }
        if let Some(text) = value.downcast_object_ref::<TextObject>() {
            return Ok(text.raw().to_string());
        }
        Err(AppError::Expression(format!(
            "'{}' evaluated to {} where a string was expected",
            expression,
            value.kind()
        )))
    }

    pub fn eval_array(&self, expression: &str, scope: &Scope) -> AppResult<Vec<serde_json::Value>> {
        let value = self.eval_value(expression, scope)?;
        match (value.kind(), value_to_json(&value)) {
            (ValueKind::Seq, serde_json::Value::Array(items)) => Ok(items),
            (other, _) => Err(AppError::Expression(format!(
                "'{}' evaluated to {} where an array was expected",
                expression, other
            ))),
        }
    }

    /// Render a template. Text without template syntax is returned as is.
    pub fn render(&self, template: &str, scope: &Scope) -> AppResult<String> {
        if !contains_template_syntax(template) {
            return Ok(template.to_string());
        }
        let env = self.environment();
        env.render_str(template, scope.context())
            .map_err(|e| AppError::Expression(format!("template render error: {}", e)))
    }
}

fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

/// Convert a template value back to JSON.
fn value_to_json(value: &Value) -> serde_json::Value {
    if value.is_undefined() || value.is_none() {
        return serde_json::Value::Null;
    }
    if let Some(text) = value.downcast_object_ref::<TextObject>() {
        return serde_json::Value::String(text.raw().to_string());
    }
    match value.kind() {
        ValueKind::Bool => serde_json::Value::Bool(value.is_true()),
        ValueKind::Number => {
            if let Some(i) = value.as_i64() {
                serde_json::Value::Number(i.into())
            } else {
                f64::try_from(value.clone())
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        ValueKind::String => serde_json::Value::String(value.to_string()),
        ValueKind::Seq | ValueKind::Iterable => match value.try_iter() {
            Ok(iter) => serde_json::Value::Array(iter.map(|v| value_to_json(&v)).collect()),
            Err(_) => serde_json::Value::Null,
        },
        ValueKind::Map => {
            let mut map = serde_json::Map::new();
            if let Ok(keys) = value.try_iter() {
                for key in keys {
                    if let Ok(item) = value.get_item(&key) {
                        if !item.is_undefined() {
                            map.insert(key.to_string(), value_to_json(&item));
                        }
                    }
                }
            }
            serde_json::Value::Object(map)
        }
        _ => serde_json::Value::String(value.to_string()),
    }
}

fn filter_tojson(value: &Value) -> Result<String, Error> {
    serde_json::to_string(&value_to_json(value))
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("tojson error: {}", e)))
}

fn filter_fromjson(value: &Value) -> Result<Value, Error> {
    let s = value.to_string();
    let parsed: serde_json::Value = serde_json::from_str(&s).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("fromjson error: {}", e),
        )
    })?;
    Ok(json_to_value(&parsed))
}

fn filter_default(value: &Value, default: Option<&Value>) -> Value {
    if value.is_undefined() || value.is_none() {
        default.cloned().unwrap_or(Value::from(""))
    } else {
        value.clone()
    }
}

fn filter_trim(value: &Value) -> String {
    value.to_string().trim().to_string()
}

/// Split text into its non-empty lines.
fn filter_lines(value: &Value) -> Vec<String> {
    value
        .to_string()
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn test_defined(value: &Value) -> bool {
    !value.is_undefined()
}

fn test_undefined(value: &Value) -> bool {
    value.is_undefined()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressedBlob;
    use crate::expr::StepGraph;
    use crate::model::{
        ObjectMeta, Run, RunSpec, RunStatus, Step, WorkflowStep, WorkflowStepSpec,
        WorkflowStepStatus,
    };
    use std::sync::Arc;

    fn step(name: &str, id: &str, path: &[&str], parent: Option<&str>, run: Option<&str>) -> WorkflowStep {
        WorkflowStep {
            metadata: ObjectMeta::named("default", name),
            spec: WorkflowStepSpec {
                workflow_execution_name: "we".into(),
                workflow_name: "wf".into(),
                path: path.iter().map(|s| s.to_string()).collect(),
                after_step_name: None,
                dont_wait: false,
                parent_step_name: parent.map(str::to_string),
                step: Step::invoke(id, "do it"),
                input: None,
                for_item: None,
                for_item_var: None,
            },
            status: WorkflowStepStatus {
                last_run_name: run.map(str::to_string),
                ..Default::default()
            },
        }
    }

    fn run(name: &str, input: &str, output: &str) -> Run {
        Run {
            metadata: ObjectMeta::named("default", name),
            spec: RunSpec {
                input: input.into(),
                ..Default::default()
            },
            status: RunStatus {
                output: Some(output.into()),
                ..Default::default()
            },
        }
    }

    /// `fetch` at the top level, and a `forEach` step `each` whose
    /// children include another `fetch`.
    fn graph() -> Arc<StepGraph> {
        let steps = vec![
            step("s-fetch", "fetch", &["0"], None, Some("r-top")),
            step("s-each", "each", &["1"], None, None),
            step("s-inner-fetch", "fetch", &["1", "0", "0"], Some("s-each"), Some("r-inner")),
            step("s-inner-use", "use", &["1", "0", "1"], Some("s-each"), None),
            step("s-other-fetch", "fetch", &["1", "1", "0"], Some("s-each"), Some("r-other")),
            step("s-other-use", "use", &["1", "1", "1"], Some("s-each"), None),
            step("s-last", "last", &["2"], None, None),
        ];
        let runs = vec![
            run("r-top", "fetch things", r#"{"items": [1, 2, 3], "name": "top"}"#),
            run("r-inner", "inner", "inner output"),
            run("r-other", "other", "other output"),
        ];
        Arc::new(StepGraph::new(r#"{"files": ["a.txt", "b.txt"]}"#, steps, runs))
    }

    fn scope_of(graph: &Arc<StepGraph>, name: &str) -> Scope {
        let step = graph.step(name).unwrap().clone();
        Scope::step(graph.clone(), &step).unwrap()
    }

    #[test]
    fn test_workflow_input_json() {
        let eval = ExpressionEvaluator::new();
        let scope = Scope::execution(graph());
        let files = eval.eval_array("workflow.input.json.files", &scope).unwrap();
        assert_eq!(files, vec![serde_json::json!("a.txt"), serde_json::json!("b.txt")]);
        assert_eq!(
            eval.eval_string("workflow.input.text", &scope).unwrap(),
            r#"{"files": ["a.txt", "b.txt"]}"#
        );
    }

    #[test]
    fn test_nearest_sibling_wins() {
        let eval = ExpressionEvaluator::new();
        let g = graph();

        let inner = scope_of(&g, "s-inner-use");
        assert_eq!(eval.eval_string("steps.fetch.output.text", &inner).unwrap(), "inner output");

        let other = scope_of(&g, "s-other-use");
        assert_eq!(eval.eval_string("steps.fetch.output.text", &other).unwrap(), "other output");

        let top = scope_of(&g, "s-last");
        assert_eq!(
            eval.eval("steps.fetch.output.json.name", &top).unwrap(),
            serde_json::json!("top")
        );
    }

    #[test]
    fn test_parent_and_workflow_steps() {
        let eval = ExpressionEvaluator::new();
        let g = graph();
        let inner = scope_of(&g, "s-inner-use");
        assert_eq!(eval.eval_string("steps.parent.id", &inner).unwrap(), "each");
        assert_eq!(
            eval.eval_string("workflow.steps.fetch.input.text", &inner).unwrap(),
            "inner"
        );
        assert_eq!(
            eval.eval_string("steps.fetch.output", &inner).unwrap(),
            "inner output"
        );
    }

    #[test]
    fn test_undefined_chains() {
        let eval = ExpressionEvaluator::new();
        let scope = Scope::execution(graph());
        assert_eq!(
            eval.eval("steps.missing.output.json.x", &scope).unwrap(),
            serde_json::Value::Null
        );
        assert!(eval.eval_bool("steps.missing is undefined", &scope).unwrap());
        // Plain text output has no json facet.
        let g = graph();
        let inner = scope_of(&g, "s-inner-use");
        assert!(eval.eval_bool("steps.fetch.output.json is undefined", &inner).unwrap());
    }

    #[test]
    fn test_typed_mismatch_is_error() {
        let eval = ExpressionEvaluator::new();
        let scope = Scope::execution(graph());
        assert!(matches!(
            eval.eval_array("workflow.input.text", &scope),
            Err(AppError::Expression(_))
        ));
        assert!(matches!(
            eval.eval_bool("'yes'", &scope),
            Err(AppError::Expression(_))
        ));
        assert!(matches!(
            eval.eval("steps.(", &scope),
            Err(AppError::Expression(_))
        ));
    }

    #[test]
    fn test_for_item_binding() {
        let eval = ExpressionEvaluator::new();
        let g = graph();
        let mut looped = g.step("s-inner-use").unwrap().clone();
        looped.spec.for_item = Some(CompressedBlob::encode(&serde_json::json!({"file": "a.txt"})).unwrap());
        looped.spec.for_item_var = Some("doc".into());
        let scope = Scope::step(g.clone(), &looped).unwrap();
        assert_eq!(eval.eval_string("doc.file", &scope).unwrap(), "a.txt");
        assert_eq!(
            eval.render("Summarize {{ doc.file }} using {{ steps.fetch.output }}", &scope).unwrap(),
            "Summarize a.txt using inner output"
        );
    }

    #[test]
    fn test_render_passthrough_and_filters() {
        let eval = ExpressionEvaluator::new();
        let scope = Scope::execution(graph());
        assert_eq!(eval.render("no templates here", &scope).unwrap(), "no templates here");
        assert_eq!(
            eval.render("{{ steps.fetch.output.json.items | tojson }}", &scope).unwrap(),
            "[1,2,3]"
        );
        assert_eq!(
            eval.eval("'[1, 2]' | fromjson", &scope).unwrap(),
            serde_json::json!([1, 2])
        );
    }
}
