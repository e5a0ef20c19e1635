//! Error types for the contract engine
//!
//! Decision outcomes (script or proof validity) are plain result values and
//! never show up here. This enum covers precondition violations on
//! state-changing operations and failures of external collaborators.

use thiserror::Error;

/// Errors raised by a chain data source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Transaction or block is unknown to the source
    #[error("not found: {0}")]
    NotFound(String),

    /// Request could not be delivered
    #[error("transport error: {0}")]
    Transport(String),

    /// Source answered with a non-success status
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Response could not be decoded
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ChainError {
    /// Whether the failure means the object does not (yet) exist on chain
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input to a state-changing operation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation is not legal in the entity's current status
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Contract, dispute or arbitrator lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transaction is absent from the confirmation monitor
    #[error("transaction {0} is not being monitored")]
    NotMonitored(String),

    /// An operation needed a Merkle proof and got none
    #[error("Missing proof: {0}")]
    MissingProof(String),

    /// Dispute resolution errors
    #[error("Dispute error: {0}")]
    Dispute(String),

    /// Chain data source errors
    #[error("Chain data error: {0}")]
    Chain(#[from] ChainError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background loop was stopped through its cancel token
    #[error("Operation cancelled")]
    Cancelled,

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a not monitored error for a transaction id
    pub fn not_monitored<S: Into<String>>(tx_id: S) -> Self {
        Self::NotMonitored(tx_id.into())
    }

    /// Create a missing proof error
    pub fn missing_proof<S: Into<String>>(msg: S) -> Self {
        Self::MissingProof(msg.into())
    }

    /// Create a dispute error
    pub fn dispute<S: Into<String>>(msg: S) -> Self {
        Self::Dispute(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error came from a collaborator and is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Chain(_))
    }
}
