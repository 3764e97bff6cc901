//! Configuration module for the agent flow engine.
//!
//! Configuration is loaded from environment variables using the `envy`
//! crate, after an optional `.env` file has been read by `dotenvy`.

mod app;

pub use app::FlowConfig;
