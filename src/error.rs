use thiserror::Error;

/// Failure taxonomy for the simulation substrate.
#[derive(Debug, Error)]
pub enum SimError {
    /// Malformed packet, unknown destination, unauthorized market mutation.
    /// Surfaced to the sender as an ERROR packet; never fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Counterpart refused, timed out, or acked `false`. Any provisional
    /// debit has already been reversed when this is returned.
    #[error("transaction {0} failed")]
    TransactionFailure(String),

    /// Insufficient balance, inventory, land or ticks. No side effects.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The peer end of a link hung up.
    #[error("link closed")]
    LinkClosed,

    /// The agent is shutting down; outstanding waits are cancelled.
    #[error("shutting down")]
    ShuttingDown,

    /// Unrecoverable: bad checkpoint version, invalid configuration,
    /// manager deadlock beyond the stall budget.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;
