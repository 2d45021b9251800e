//! Error taxonomy shared by the lock, subprocess and session components.

use std::fmt;
use std::io;

/// Result alias used across the agent crates
pub type SwuResult<T> = Result<T, SwuError>;

/// Terminal outcome of a spawned command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Process exited normally with this code
    Exited(i32),
    /// Process was terminated by a signal
    Killed(i32),
    /// wait() reported neither an exit code nor a signal
    WaitError,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code as reported to callers. Signals and wait errors collapse to 1.
    pub fn code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Killed(_) | Self::WaitError => 1,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Killed(signal) => write!(f, "killed by signal {}", signal),
            Self::WaitError => write!(f, "no exit code nor signal"),
        }
    }
}

/// Errors surfaced by agent components
#[derive(Debug, thiserror::Error)]
pub enum SwuError {
    /// Another update session or lock holder is active
    #[error("busy: {0}")]
    Busy(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("command failed: {command} ({outcome})")]
    ChildFailed {
        command: String,
        outcome: ExitOutcome,
    },

    /// Malformed or unexpected message from the controller
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invariant violation inside the agent
    #[error("internal error: {0}")]
    Internal(String),
}

impl SwuError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Attach a context string to an `io::Result`, in the manner of `anyhow::Context`
pub trait IoContext<T> {
    fn io_context(self, context: impl Into<String>) -> SwuResult<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, context: impl Into<String>) -> SwuResult<T> {
        self.map_err(|e| SwuError::io(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_outcome_codes() {
        assert!(ExitOutcome::Exited(0).success());
        assert!(!ExitOutcome::Exited(3).success());
        assert_eq!(ExitOutcome::Exited(3).code(), 3);
        assert_eq!(ExitOutcome::Killed(9).code(), 1);
        assert!(!ExitOutcome::Killed(9).success());
        assert_ne!(ExitOutcome::Killed(9), ExitOutcome::Exited(1));
    }

    #[test]
    fn test_io_context_message() {
        let err: SwuResult<()> = Err(io::Error::from(io::ErrorKind::BrokenPipe))
            .io_context("write to pipe");
        let msg = err.unwrap_err().to_string();
        assert!(msg.starts_with("write to pipe: "));
    }

    #[test]
    fn test_child_failed_display() {
        let err = SwuError::ChildFailed {
            command: "false".to_string(),
            outcome: ExitOutcome::Exited(1),
        };
        assert_eq!(err.to_string(), "command failed: false (exit code 1)");
    }
}
