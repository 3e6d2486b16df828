//! Error types shared by the balancer crates.

use thiserror::Error;

/// Result type alias for balancer operations.
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Errors that abort a balancing pass.
///
/// Every variant is fatal: these indicate caller misuse or malformed input,
/// not conditions a policy is expected to recover from.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("no candidate op models left for {0}")]
    EmptyCandidates(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl BalancerError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        BalancerError::Precondition(msg.into())
    }
}

/// Return a [`BalancerError::Precondition`] unless `cond` holds.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::BalancerError::Precondition(format!($($arg)+)).into());
        }
    };
}
