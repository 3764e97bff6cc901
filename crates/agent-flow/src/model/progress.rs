//! Progress frames streamed to watchers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observable unit of run activity. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub waiting_on_model: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolProgress {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generating_input_for_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partial_input: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptProgress {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
}

impl Progress {
    pub fn content(run_name: &str, content: impl Into<String>) -> Self {
        Self {
            run_name: run_name.to_string(),
            time: Some(Utc::now()),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn error(run_name: &str, error: impl Into<String>) -> Self {
        Self {
            run_name: run_name.to_string(),
            time: Some(Utc::now()),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn tool(run_name: &str, tool: ToolProgress) -> Self {
        Self {
            run_name: run_name.to_string(),
            time: Some(Utc::now()),
            tool: Some(tool),
            ..Default::default()
        }
    }

    pub fn waiting(run_name: &str, waiting: bool) -> Self {
        Self {
            run_name: run_name.to_string(),
            time: Some(Utc::now()),
            waiting_on_model: waiting,
            ..Default::default()
        }
    }

    /// Same frame ignoring the timestamp.
    pub fn same_as(&self, other: &Progress) -> bool {
        self.run_name == other.run_name
            && self.content == other.content
            && self.waiting_on_model == other.waiting_on_model
            && self.tool == other.tool
            && self.prompt == other.prompt
            && self.error == other.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let frame = Progress::tool(
            "r1",
            ToolProgress {
                generating_input_for_name: "search".into(),
                partial_input: "{\"q\":".into(),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["runName"], "r1");
        assert_eq!(json["tool"]["generatingInputForName"], "search");
        assert!(json.get("content").is_none());
        assert!(json.get("waitingOnModel").is_none());
    }
}
