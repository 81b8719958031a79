//! Scoped action logging with optional error swallowing.
//!
//! Wraps a fallible future in "doing X... / done / failed" log lines. The
//! swallowing variant is the single place where reconciliation errors are
//! turned into warnings, so one failing handler can never halt the loop.

use std::fmt::Display;
use std::future::Future;
use tracing::{error, info, warn};

/// A logged scope around one fallible action.
///
/// ```
/// # use ci_scaler_core::scope::ActionScope;
/// # async fn example() {
/// let terminated = ActionScope::doing("terminating instance i-0a1b")
///     .swallow(async { Ok::<_, std::io::Error>(()) })
///     .await;
/// assert!(terminated.is_some());
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ActionScope {
    doing: Option<String>,
    failure: Option<String>,
}

impl ActionScope {
    /// A scope that only reports failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope announcing the action on entry and on both exit paths.
    pub fn doing(doing: impl Into<String>) -> Self {
        Self {
            doing: Some(doing.into()),
            failure: None,
        }
    }

    /// Override the failure wording (e.g. `"failed (will retry)"`).
    pub fn failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }

    /// Run the action, log the outcome, and propagate the error.
    pub async fn run<T, E, F>(self, fut: F) -> Result<T, E>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        self.enter();
        match fut.await {
            Ok(value) => {
                self.done();
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "{}", self.failure_line());
                Err(e)
            }
        }
    }

    /// Run the action, log the outcome, and swallow the error.
    ///
    /// Returns `None` when the action failed.
    pub async fn swallow<T, E, F>(self, fut: F) -> Option<T>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        self.enter();
        match fut.await {
            Ok(value) => {
                self.done();
                Some(value)
            }
            Err(e) => {
                warn!(error = %e, "{}", self.failure_line());
                None
            }
        }
    }

    fn enter(&self) {
        if let Some(doing) = &self.doing {
            info!("{doing}...");
        }
    }

    fn done(&self) {
        if let Some(doing) = &self.doing {
            info!("{doing}: done");
        }
    }

    fn failure_line(&self) -> String {
        let failure = self.failure.as_deref().unwrap_or("failed");
        match &self.doing {
            Some(doing) => format!("{doing}: {failure}"),
            None => failure.to_string(),
        }
    }
}

#[cfg(test)]
#[path = "scope_tests.rs"]
mod tests;
