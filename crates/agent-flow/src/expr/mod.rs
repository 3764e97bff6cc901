//! Jinja-style expressions over workflow state.
//!
//! Expressions are minijinja expressions (`steps.fetch.output.json.items`)
//! and step instructions are minijinja templates. Scope variables are
//! host objects resolved against a snapshot of the execution's steps.

mod evaluator;
mod scope;

pub use evaluator::ExpressionEvaluator;
pub use scope::{Scope, StepGraph};
