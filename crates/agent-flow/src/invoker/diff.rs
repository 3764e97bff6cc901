//! Cumulative call output to `Progress` deltas.
//!
//! The runtime reports the whole text of a call on every update. The
//! tracker remembers what it has seen per call id and output index and
//! turns growth into content deltas. Two literal markers embedded in the
//! text form a positional protocol: [`WAITING_MARKER`] toggles the
//! waiting-on-model flag and [`TOOL_CALL_MARKER`] starts a
//! `name -> partial input` fragment. Text that contains a marker literally
//! is treated as protocol, never as content.

use std::collections::{BTreeMap, HashMap};

use crate::model::{Progress, ToolProgress};
use crate::runtime::{CallFrame, CallFrames, Program, SubCall};

pub const TOOL_CALL_MARKER: &str = "<tool call> ";
pub const WAITING_MARKER: &str = "Waiting for model response...";

const TOOL_NAME_SEPARATOR: &str = " -> ";

/// Per-consumer diff state across the calls of one run.
#[derive(Debug, Default)]
pub struct CallTracker {
    calls: HashMap<String, CallState>,
}

#[derive(Debug, Default)]
struct CallState {
    seen: Vec<String>,
    sub_calls: BTreeMap<String, SubCall>,
    markers: MarkerState,
}

#[derive(Debug, Default)]
struct MarkerState {
    /// Tail that may be the start of a marker split across deltas.
    pending: String,
    waiting: bool,
    in_tool: bool,
    tool_name: Option<String>,
    /// Tool fragment text before the name separator arrived.
    name_buffer: String,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// New frames for every chat-visible call in `frames`.
    pub fn frames(&mut self, run_name: &str, program: &Program, frames: &CallFrames) -> Vec<Progress> {
        frames
            .values()
            .flat_map(|frame| self.frame(run_name, program, frame))
            .collect()
    }

    /// New frames for one call. Nested calls produce nothing.
    pub fn frame(&mut self, run_name: &str, program: &Program, frame: &CallFrame) -> Vec<Progress> {
        if frame.parent_id.is_some() {
            return Vec::new();
        }

        let state = self.calls.entry(frame.id.clone()).or_default();
        let mut out = Vec::new();

        for (idx, output) in frame.output.iter().enumerate() {
            if state.seen.len() <= idx {
                state.seen.resize(idx + 1, String::new());
            }
            let seen = &state.seen[idx];
            let content = &output.content;

            let delta = if content == seen || seen.starts_with(content.as_str()) {
                // Unchanged, or an older snapshot than one already processed.
                None
            } else if content.starts_with(seen.as_str()) {
                Some(content[seen.len()..].to_string())
            } else {
                state.markers = MarkerState::default();
                Some(content.clone())
            };

            if let Some(delta) = delta {
                state.seen[idx] = content.clone();
                state.markers.feed(run_name, &delta, &mut out);
            }

            for (call_id, sub_call) in &output.sub_calls {
                if state.sub_calls.get(call_id) == Some(sub_call) {
                    continue;
                }
                state.sub_calls.insert(call_id.clone(), sub_call.clone());
                let description = program
                    .tool(&sub_call.tool_name)
                    .map(|t| t.description.clone())
                    .unwrap_or_default();
                out.push(Progress::tool(
                    run_name,
                    ToolProgress {
                        name: sub_call.tool_name.clone(),
                        description,
                        input: sub_call.input.clone(),
                        ..Default::default()
                    },
                ));
            }
        }

        out
    }

    /// Release text held back as a possible marker start.
    pub fn flush(&mut self, run_name: &str) -> Vec<Progress> {
        let mut out = Vec::new();
        let mut ids: Vec<String> = self.calls.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(state) = self.calls.get_mut(&id) {
                let pending = std::mem::take(&mut state.markers.pending);
                state.markers.emit(run_name, &pending, &mut out);
            }
        }
        out
    }
}

impl MarkerState {
    fn feed(&mut self, run_name: &str, delta: &str, out: &mut Vec<Progress>) {
        let mut text = std::mem::take(&mut self.pending);
        text.push_str(delta);
        let mut rest = text.as_str();

        loop {
            let waiting = rest.find(WAITING_MARKER).map(|at| (at, WAITING_MARKER));
            let tool = rest.find(TOOL_CALL_MARKER).map(|at| (at, TOOL_CALL_MARKER));
            let next = match (waiting, tool) {
                (Some(w), Some(t)) => Some(if w.0 <= t.0 { w } else { t }),
                (w, t) => w.or(t),
            };

            let Some((at, marker)) = next else {
                let hold = partial_marker_len(rest);
                let (emit, held) = rest.split_at(rest.len() - hold);
                self.emit(run_name, emit, out);
                self.pending = held.to_string();
                return;
            };

            self.emit(run_name, &rest[..at], out);
            rest = &rest[at + marker.len()..];

            if marker == WAITING_MARKER {
                self.waiting = !self.waiting;
                self.end_tool();
                out.push(Progress::waiting(run_name, self.waiting));
            } else {
                self.end_tool();
                self.in_tool = true;
            }
        }
    }

    fn end_tool(&mut self) {
        self.in_tool = false;
        self.tool_name = None;
        self.name_buffer.clear();
    }

    fn emit(&mut self, run_name: &str, text: &str, out: &mut Vec<Progress>) {
        if text.is_empty() {
            return;
        }
        if !self.in_tool {
            out.push(Progress::content(run_name, text));
            return;
        }

        match &self.tool_name {
            Some(name) => out.push(partial_tool(run_name, name, text)),
            None => {
                self.name_buffer.push_str(text);
                if let Some(at) = self.name_buffer.find(TOOL_NAME_SEPARATOR) {
                    let name = self.name_buffer[..at].trim().to_string();
                    let partial = self.name_buffer[at + TOOL_NAME_SEPARATOR.len()..].to_string();
                    self.name_buffer.clear();
                    out.push(partial_tool(run_name, &name, &partial));
                    self.tool_name = Some(name);
                }
            }
        }
    }
}

fn partial_tool(run_name: &str, name: &str, partial: &str) -> Progress {
    Progress::tool(
        run_name,
        ToolProgress {
            generating_input_for_name: name.to_string(),
            partial_input: partial.to_string(),
            ..Default::default()
        },
    )
}

/// Length of the longest suffix of `text` that is a proper prefix of a marker.
fn partial_marker_len(text: &str) -> usize {
    [WAITING_MARKER, TOOL_CALL_MARKER]
        .iter()
        .map(|marker| {
            (1..marker.len())
                .rev()
                .find(|&n| text.ends_with(&marker[..n]))
                .unwrap_or(0)
        })
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CallOutput, ToolDef};

    fn frame(content: &str) -> CallFrame {
        CallFrame {
            id: "c1".into(),
            parent_id: None,
            tool_name: "chat".into(),
            input: String::new(),
            output: vec![CallOutput {
                content: content.into(),
                ..Default::default()
            }],
        }
    }

    fn contents(frames: &[Progress]) -> Vec<String> {
        frames.iter().map(|p| p.content.clone()).collect()
    }

    #[test]
    fn test_growth_emits_only_suffix() {
        let mut tracker = CallTracker::new();
        let program = Program::default();
        assert_eq!(contents(&tracker.frame("r", &program, &frame("Hello"))), vec!["Hello"]);
        assert_eq!(
            contents(&tracker.frame("r", &program, &frame("Hello world"))),
            vec![" world"]
        );
        assert!(tracker.frame("r", &program, &frame("Hello world")).is_empty());
        // An older snapshot arriving late is ignored.
        assert!(tracker.frame("r", &program, &frame("Hello")).is_empty());
    }

    #[test]
    fn test_rewritten_content_resets() {
        let mut tracker = CallTracker::new();
        let program = Program::default();
        tracker.frame("r", &program, &frame("abc"));
        assert_eq!(contents(&tracker.frame("r", &program, &frame("xyz"))), vec!["xyz"]);
    }

    #[test]
    fn test_nested_calls_ignored() {
        let mut tracker = CallTracker::new();
        let mut nested = frame("inner");
        nested.parent_id = Some("c0".into());
        assert!(tracker.frame("r", &Program::default(), &nested).is_empty());
    }

    #[test]
    fn test_waiting_marker_toggles_and_is_stripped() {
        let mut tracker = CallTracker::new();
        let program = Program::default();
        let text = format!("Hi{}", WAITING_MARKER);
        let out = tracker.frame("r", &program, &frame(&text));
        assert_eq!(out[0].content, "Hi");
        assert!(out[1].waiting_on_model);

        let text = format!("{}{}there", text, WAITING_MARKER);
        let out = tracker.frame("r", &program, &frame(&text));
        assert!(!out[0].waiting_on_model);
        assert_eq!(out[1].content, "there");
    }

    #[test]
    fn test_tool_fragment_split_across_deltas() {
        let mut tracker = CallTracker::new();
        let program = Program::default();

        // Marker itself arrives in two pieces.
        let out = tracker.frame("r", &program, &frame("ok <tool"));
        assert_eq!(contents(&out), vec!["ok "]);

        let out = tracker.frame("r", &program, &frame("ok <tool call> sear"));
        assert!(out.is_empty());

        let out = tracker.frame("r", &program, &frame("ok <tool call> search -> {\"q\""));
        let tool = out[0].tool.as_ref().unwrap();
        assert_eq!(tool.generating_input_for_name, "search");
        assert_eq!(tool.partial_input, "{\"q\"");

        let out = tracker.frame("r", &program, &frame("ok <tool call> search -> {\"q\": 1}"));
        let tool = out[0].tool.as_ref().unwrap();
        assert_eq!(tool.generating_input_for_name, "search");
        assert_eq!(tool.partial_input, ": 1}");
    }

    #[test]
    fn test_sub_calls_diffed_by_equality() {
        let mut tracker = CallTracker::new();
        let mut program = Program::default();
        program.tool_set.insert(
            "search".into(),
            ToolDef {
                name: "search".into(),
                description: "Search the web".into(),
                ..Default::default()
            },
        );

        let mut f = frame("");
        f.output[0].sub_calls.insert(
            "s1".into(),
            SubCall {
                tool_name: "search".into(),
                input: "{}".into(),
            },
        );
        let out = tracker.frame("r", &program, &f);
        assert_eq!(out.len(), 1);
        let tool = out[0].tool.as_ref().unwrap();
        assert_eq!(tool.name, "search");
        assert_eq!(tool.description, "Search the web");

        assert!(tracker.frame("r", &program, &f).is_empty());

        f.output[0].sub_calls.get_mut("s1").unwrap().input = "{\"q\":1}".into();
        assert_eq!(tracker.frame("r", &program, &f).len(), 1);
    }

    #[test]
    fn test_flush_releases_held_text() {
        let mut tracker = CallTracker::new();
        let out = tracker.frame("r", &Program::default(), &frame("Wait"));
        assert!(out.is_empty());
        assert_eq!(contents(&tracker.flush("r")), vec!["Wait"]);
    }
}
