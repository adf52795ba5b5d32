//! Error taxonomy for verification runs.
//!
//! Every failure aborts the current scenario. The variants separate
//! "the environment could not be set up" from "the server said something
//! unexpected" from "the server said nothing at all".
//!
//! # Error Code Ranges
//!
//! | Range        | Category   | Description                                |
//! |--------------|------------|--------------------------------------------|
//! | PVT-E100     | Lifecycle  | Bind, launch and teardown of the server    |
//! | PVT-E200     | Command    | External client invocations                |
//! | PVT-E300     | Assertion  | Peeked or polled values that disagree      |
//! | PVT-E400     | Channel    | Rendezvous timeouts and protocol breaches  |
//! | PVT-E500     | Internal   | Configuration and I/O                      |

use std::time::Duration;

use thiserror::Error;

/// Error type for harness operations
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Rendezvous address {address} could not be bound: {reason}")]
    Bind { address: String, reason: String },

    #[error("Server failed to launch: {0}")]
    Launch(String),

    #[error("Server teardown failed: {0}")]
    Teardown(String),

    #[error("Command `{command}` exited with status {exit_code}{}", stderr_suffix(.stderr))]
    Command {
        exit_code: i32,
        command: String,
        stderr: String,
    },

    #[error("Assertion mismatch at {step}: expected {expected:?}, got {actual:?}")]
    AssertionMismatch {
        step: String,
        expected: String,
        actual: String,
    },

    #[error(
        "Timed out after {waited:?} waiting for {step} ({completed_cycles} rendezvous cycles completed)"
    )]
    Timeout {
        step: String,
        completed_cycles: u64,
        waited: Duration,
    },

    #[error("Rendezvous protocol violation: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

impl HarnessError {
    /// Stable diagnostic code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "PVT-E101",
            Self::Launch(_) => "PVT-E102",
            Self::Teardown(_) => "PVT-E103",
            Self::Command { .. } => "PVT-E201",
            Self::AssertionMismatch { .. } => "PVT-E301",
            Self::Timeout { .. } => "PVT-E401",
            Self::Protocol(_) => "PVT-E402",
            Self::Config(_) => "PVT-E501",
            Self::Io(_) => "PVT-E502",
        }
    }

    /// Process exit code used by the CLI when a run ends with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AssertionMismatch { .. } => 1,
            Self::Command { .. } => 2,
            Self::Timeout { .. } | Self::Protocol(_) => 3,
            Self::Bind { .. } | Self::Launch(_) | Self::Teardown(_) => 4,
            Self::Config(_) => 78,
            Self::Io(_) => 74,
        }
    }

    /// True for errors that mean the environment itself cannot be trusted.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. } | Self::Launch(_) | Self::Teardown(_) | Self::Io(_)
        )
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;
