//! NoETL Agent Flow Library
//!
//! This crate runs LLM-driven workflows on top of a versioned object store:
//!
//! - **Step State Machine**: Expand workflow manifests into a graph of step
//!   instances and advance each one level-triggered on every change
//! - **Invoker**: Start agent turns in threads, stream their output and
//!   persist recoverable run state
//! - **Event Emitter**: Fan run progress out to watchers, live in-process or
//!   replayed from the persisted run state
//! - **Expressions**: Evaluate Jinja-style expressions and templates against
//!   workflow input and the outputs of earlier steps
//!
//! ## Architecture
//!
//! Every piece of state lives in the object store. Handlers are pure
//! functions of the stored objects, so a restarted process resumes by
//! reconciling again. The external agent runtime, dataset reader and
//! workspace provider are traits; in-memory implementations ship in
//! [`runtime::mock`] and [`store::memory`].
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`model`]: Stored records and the progress frame
//! - [`store`]: Object store contract, typed client and memory backend
//! - [`engine`]: Step handlers and the reconciliation controller
//! - [`invoker`]: Agent turns and run-state persistence
//! - [`events`]: Progress fan-out to watchers
//! - [`expr`]: Expression evaluation
//! - [`crypto`]: Capability tokens
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use noetl_agent_flow::{
//!     config::FlowConfig, crypto::SealedTokenIssuer, engine::{Controller, Engine},
//!     events::Emitter, invoker::Invoker, store::{MemoryStore, StoreClient},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FlowConfig::from_env()?;
//!     noetl_agent_flow::telemetry::init_tracing(&config);
//!     let store = StoreClient::new(Arc::new(MemoryStore::new()));
//!     let tokens = SealedTokenIssuer::from_config(config.token_key.as_deref(), config.token_ttl())?;
//!     let invoker = Invoker::new(store.clone(), runtime, workspaces, Arc::new(tokens),
//!         Emitter::new(store.clone(), config.clone()), config.clone());
//!     let engine = Engine::new(store, invoker, datasets, config);
//!     Controller::new(engine, "default").run(cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod invoker;
pub mod model;
pub mod result_ext;
pub mod runtime;
pub mod store;
pub mod telemetry;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
