//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `NOETL_FLOW_`:
/// - `NOETL_FLOW_SNAPSHOT_INTERVAL_MS`: RunState watchdog interval (default: 2000)
/// - `NOETL_FLOW_DEFAULT_MAX_LOOPS`: While bound when a manifest omits one (default: 3)
/// - `NOETL_FLOW_LIVE_RETENTION_SECS`: Live log retention after a run ends (default: 30)
/// - `NOETL_FLOW_WATCH_RETRY_DELAY_MS`: Delay before re-opening a durable watch (default: 250)
/// - `NOETL_FLOW_STATUS_UPDATE_RETRIES`: Conflict retries for status writes (default: 5)
/// - `NOETL_FLOW_PROMPT_POLL_INTERVAL_MS`: Prompt response poll interval (default: 1000)
/// - `NOETL_FLOW_PROMPT_TIMEOUT_SECS`: Give up waiting on a prompt after this (default: 300)
/// - `NOETL_FLOW_WORKSPACE_PROVIDER`: Provider type for new thread workspaces (default: "directory")
/// - `NOETL_FLOW_TOKEN_KEY`: Base64 AES-256 key for capability tokens (optional)
/// - `NOETL_FLOW_TOKEN_TTL_SECS`: Capability token lifetime (default: 3600)
/// - `NOETL_FLOW_RESYNC_INTERVAL_SECS`: Full resync period of the controller (default: 30)
/// - `NOETL_FLOW_LOG_JSON`: Emit JSON logs (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,

    #[serde(default = "default_max_loops")]
    pub default_max_loops: u32,

    #[serde(default = "default_live_retention")]
    pub live_retention_secs: u64,

    #[serde(default = "default_watch_retry_delay")]
    pub watch_retry_delay_ms: u64,

    #[serde(default = "default_status_retries")]
    pub status_update_retries: u32,

    #[serde(default = "default_prompt_poll_interval")]
    pub prompt_poll_interval_ms: u64,

    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,

    #[serde(default = "default_workspace_provider")]
    pub workspace_provider: String,

    /// Base64-encoded 32-byte key; a random key is generated when unset.
    #[serde(default)]
    pub token_key: Option<String>,

    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    #[serde(default)]
    pub log_json: bool,
}

fn default_snapshot_interval() -> u64 {
    2000
}

fn default_max_loops() -> u32 {
    3
}

fn default_live_retention() -> u64 {
    30
}

fn default_watch_retry_delay() -> u64 {
    250
}

fn default_status_retries() -> u32 {
    5
}

fn default_prompt_poll_interval() -> u64 {
    1000
}

fn default_prompt_timeout() -> u64 {
    300
}

fn default_workspace_provider() -> String {
    "directory".to_string()
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_resync_interval() -> u64 {
    30
}

impl FlowConfig {
    /// Load configuration from the environment (and `.env`, when present).
    pub fn from_env() -> Result<Self, envy::Error> {
        let _ = dotenvy::dotenv();
        envy::prefixed("NOETL_FLOW_").from_env::<FlowConfig>()
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn live_retention(&self) -> Duration {
        Duration::from_secs(self.live_retention_secs)
    }

    pub fn watch_retry_delay(&self) -> Duration {
        Duration::from_millis(self.watch_retry_delay_ms)
    }

    pub fn prompt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.prompt_poll_interval_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: default_snapshot_interval(),
            default_max_loops: default_max_loops(),
            live_retention_secs: default_live_retention(),
            watch_retry_delay_ms: default_watch_retry_delay(),
            status_update_retries: default_status_retries(),
            prompt_poll_interval_ms: default_prompt_poll_interval(),
            prompt_timeout_secs: default_prompt_timeout(),
            workspace_provider: default_workspace_provider(),
            token_key: None,
            token_ttl_secs: default_token_ttl(),
            resync_interval_secs: default_resync_interval(),
            log_json: false,
        }
    }
}
