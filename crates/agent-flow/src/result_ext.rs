//! Result extensions used across the engine.
//!
//! `log` records a failure with the caller's location before it is
//! propagated; `not_found_as_none` turns a missing object into `None` so
//! handlers can treat "not created yet" as an ordinary state.

use std::fmt::Display;

use crate::error::{AppError, AppResult};

/// Extension trait for logging errors with context.
pub trait ResultExt<T, E> {
    /// Log the error with context and the caller location if this is an `Err`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use noetl_agent_flow::result_ext::ResultExt;
    ///
    /// store.update(&run).await.log("persisting run status")?;
    /// ```
    fn log<S: Display>(self, context: S) -> Result<T, E>;

    /// Log the error at warn level and discard it.
    fn warn_and_discard<S: Display>(self, context: S) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: Display>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            tracing::error!(
                target: "noetl_agent_flow",
                error = %e,
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context,
                "Operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn warn_and_discard<S: Display>(self, context: S) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                let location = std::panic::Location::caller();
                tracing::warn!(
                    target: "noetl_agent_flow",
                    error = %e,
                    file = %format!("{}:{}", location.file(), location.line()),
                    context = %context,
                    "Ignoring failed operation"
                );
                None
            }
        }
    }
}

/// Maps `AppError::NotFound` to `Ok(None)`.
pub trait NotFoundExt<T> {
    fn not_found_as_none(self) -> AppResult<Option<T>>;
}

impl<T> NotFoundExt<T> for AppResult<T> {
    fn not_found_as_none(self) -> AppResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
