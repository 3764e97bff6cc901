//! Deterministic object names.
//!
//! Names are derived from the position of an object in the expanded graph,
//! so re-expanding the same graph always yields the same names and applies
//! are idempotent.

use uuid::Uuid;

fn digest(parts: &[&str]) -> String {
    let joined = parts.join("\u{1f}");
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, joined.as_bytes());
    id.simple().to_string()[..16].to_string()
}

/// Name of the step at `path` of `execution`.
pub fn step_name(execution: &str, path: &[String]) -> String {
    let mut parts = vec![execution];
    parts.extend(path.iter().map(String::as_str));
    format!("wfs-{}", digest(&parts))
}

/// Name of the run a step starts.
pub fn run_name(step_name: &str) -> String {
    format!("{}-run", step_name)
}

/// Name of the thread an execution creates when none is given.
pub fn thread_name(execution: &str) -> String {
    format!("wft-{}", digest(&[execution]))
}

/// Name of the nested execution spawned by a subflow step.
pub fn subflow_execution_name(step_name: &str) -> String {
    format!("{}-sub", step_name)
}

/// `base` extended by `segments`.
pub fn child_path(base: &[String], segments: &[&str]) -> Vec<String> {
    base.iter()
        .cloned()
        .chain(segments.iter().map(|s| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_stable_and_distinct() {
        let a = step_name("we1", &child_path(&[], &["0"]));
        assert_eq!(a, step_name("we1", &["0".to_string()]));
        assert_ne!(a, step_name("we2", &["0".to_string()]));
        assert_ne!(a, step_name("we1", &["1".to_string()]));
        // Segment boundaries matter.
        assert_ne!(
            step_name("we1", &child_path(&[], &["1", "0"])),
            step_name("we1", &child_path(&[], &["10"]))
        );
        assert!(a.starts_with("wfs-"));
        assert_eq!(a.len(), 20);
    }
}
