//! Error types for runcmd

use std::time::Duration;

use thiserror::Error;

/// Errors raised while constructing runners or driving a command lifecycle
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Command text was empty or all whitespace
    #[error("command cannot be empty")]
    EmptyCommand,

    /// Failed to connect to the remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected the offered credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error (missing, unreadable or unparseable key file)
    #[error("SSH key error: {0}")]
    KeyError(String),

    /// Opening a session channel on the connection failed
    #[error("session setup failed: {0}")]
    SessionFailed(String),

    /// Acquiring an OS pipe for the command failed
    #[error("pipe setup failed: {0}")]
    PipeFailed(String),

    /// The backend could not begin executing the command
    #[error("failed to start command: {0}")]
    StartFailed(String),

    /// The command terminated abnormally
    ///
    /// `diagnostic` carries the stderr text drained before the failure was
    /// observed; Display renders it below the cause so the full context
    /// survives in logs.
    #[error("{}", render_execution(.cause, .diagnostic))]
    ExecutionFailed {
        /// Description of the termination failure
        cause: String,
        /// Captured stderr text, when any was produced
        diagnostic: Option<String>,
    },

    /// Reading an output stream failed before end-of-stream
    #[error("stream error: {0}")]
    StreamFailed(String),

    /// Command exceeded the caller-supplied time limit
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Time limit that was exceeded
        timeout: Duration,
    },

    /// The connection has been closed; no further sessions can be opened
    #[error("not connected")]
    NotConnected,
}

fn render_execution(cause: &str, diagnostic: &Option<String>) -> String {
    match diagnostic {
        Some(text) => format!("{cause}\n{text}"),
        None => cause.to_string(),
    }
}

impl ExecError {
    /// Execution failure with no diagnostic attached yet
    pub(crate) fn execution(cause: impl Into<String>) -> Self {
        ExecError::ExecutionFailed {
            cause: cause.into(),
            diagnostic: None,
        }
    }

    /// Attach drained stderr text to an execution failure.
    ///
    /// Leaves the error untouched when the text is empty, when a diagnostic
    /// is already present, or for non-execution errors.
    pub(crate) fn with_diagnostic(self, stderr: &[u8]) -> Self {
        match self {
            ExecError::ExecutionFailed {
                cause,
                diagnostic: None,
            } if !stderr.is_empty() => ExecError::ExecutionFailed {
                cause,
                diagnostic: Some(String::from_utf8_lossy(stderr).into_owned()),
            },
            other => other,
        }
    }

    /// Captured stderr text for an execution failure, if any
    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ExecError::ExecutionFailed { diagnostic, .. } => diagnostic.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_display_without_diagnostic() {
        let err = ExecError::execution("exit status: 3");
        assert_eq!(err.to_string(), "exit status: 3");
        assert!(err.diagnostic().is_none());
    }

    #[test]
    fn execution_display_appends_diagnostic() {
        let err = ExecError::execution("exit status: 3").with_diagnostic(b"boom\n");
        assert_eq!(err.to_string(), "exit status: 3\nboom\n");
        assert_eq!(err.diagnostic(), Some("boom\n"));
    }

    #[test]
    fn empty_stderr_attaches_nothing() {
        let err = ExecError::execution("exit status: 1").with_diagnostic(b"");
        assert!(err.diagnostic().is_none());
    }

    #[test]
    fn existing_diagnostic_is_not_overwritten() {
        let err = ExecError::execution("exit status: 1")
            .with_diagnostic(b"first")
            .with_diagnostic(b"second");
        assert_eq!(err.diagnostic(), Some("first"));
    }
}
