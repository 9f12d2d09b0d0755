//! Error handling and types

use thiserror::Error;

/// Stress harness errors
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A checked property did not hold
    #[error("{scenario} scenario violated a property: {detail}")]
    PropertyViolated {
        /// Scenario that detected the violation
        scenario: &'static str,
        /// What went wrong
        detail: String,
    },

    /// Closing a connection failed
    #[error("connection {id} to {addr} failed to close")]
    CloseFailed {
        /// Connection id
        id: u64,
        /// Address the connection was dialed to
        addr: String,
    },

    /// A connection was closed twice
    #[error("connection {id} to {addr} is already closed")]
    AlreadyClosed {
        /// Connection id
        id: u64,
        /// Address the connection was dialed to
        addr: String,
    },

    /// A spawned caller task panicked or was cancelled
    #[error("caller task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Invalid configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HarnessError {
    pub(crate) fn violated(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::PropertyViolated {
            scenario,
            detail: detail.into(),
        }
    }
}

/// Dialing a simulated connection failed
///
/// `Clone` so that one failure can be shared with every caller waiting on the
/// same dial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("dial {addr} failed: {reason}")]
pub struct DialError {
    /// Address being dialed
    pub addr: String,
    /// Why the dial failed
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, HarnessError>;
