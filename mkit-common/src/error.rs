//! Error taxonomy shared by every harness operation.

use std::time::Duration;

use crate::process::RunResult;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The program could not be located or started.
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A deadline expired. Runner timeouts carry whatever output was captured
    /// before the child was killed.
    #[error("{operation} timed out after {}", human(.after))]
    Timeout {
        operation: String,
        after: Duration,
        partial: Option<Box<RunResult>>,
        diagnostics: Option<String>,
    },

    /// The child ran to completion but reported failure.
    #[error("{}: exit status {}", .result.command(), .result.exit_code)]
    NonZeroExit { result: Box<RunResult> },

    /// Stdout of a JSON-producing command did not decode.
    #[error("failed to decode JSON from {command}: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    /// A test expectation did not hold.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),

    /// The test decided it cannot run on this host or configuration.
    #[error("skipped: {0}")]
    Skipped(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

fn human(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

impl HarnessError {
    /// Build a timeout error that carries no process output.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        HarnessError::Timeout {
            operation: operation.into(),
            after,
            partial: None,
            diagnostics: None,
        }
    }

    /// Attach diagnostics to a timeout; other variants are returned unchanged.
    pub fn with_diagnostics(self, text: impl Into<String>) -> Self {
        match self {
            HarnessError::Timeout {
                operation,
                after,
                partial,
                ..
            } => HarnessError::Timeout {
                operation,
                after,
                partial,
                diagnostics: Some(text.into()),
            },
            other => other,
        }
    }

    /// The captured process result, when the failure came from the runner.
    pub fn run_result(&self) -> Option<&RunResult> {
        match self {
            HarnessError::NonZeroExit { result } => Some(result),
            HarnessError::Timeout {
                partial: Some(result),
                ..
            } => Some(result),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }

    /// Assertion failures are test outcomes; everything else is infrastructure.
    pub fn is_assertion(&self) -> bool {
        matches!(self, HarnessError::AssertionFailed(_))
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, HarnessError::Skipped(_))
    }
}
