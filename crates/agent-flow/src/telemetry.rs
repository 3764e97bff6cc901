//! Tracing initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::FlowConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling this twice is a no-op.
pub fn init_tracing(config: &FlowConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,noetl_agent_flow=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
