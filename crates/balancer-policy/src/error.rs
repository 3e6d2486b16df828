//! Policy error types.

use thiserror::Error;

use balancer_core::BalancerError;

/// Errors that abort a balancing pass.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to place all ops, missing: {}", .missing.join(", "))]
    IncompletePlacement { missing: Vec<String> },

    #[error("unexpected insertion instruction: {0}")]
    UnexpectedInstruction(String),

    #[error("expected buffering to occur but nothing was buffered")]
    NothingBuffered,

    #[error("placement error: {0}")]
    Placement(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Balancer(#[from] BalancerError),
}

pub type PolicyResult<T> = Result<T, PolicyError>;
