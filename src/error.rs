//! Error types for the Aqueduct orchestrator

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for the orchestrator core
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Slippage {slippage_bps} bps exceeds maximum {max_bps} bps")]
    SlippageExceeded { slippage_bps: u32, max_bps: u32 },

    #[error("No price data available for {pair}")]
    PriceUnavailable { pair: String },

    #[error("Chain error on {chain_id}: {message}")]
    Chain { chain_id: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Order {order_id} expired")]
    OrderExpired { order_id: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Check if the failure is transient; the scheduler's next tick is the
    /// only retry mechanism, so this only informs logging and metrics.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Chain { .. }
                | OrchestratorError::Timeout { .. }
                | OrchestratorError::SlippageExceeded { .. }
        )
    }

    /// Check if the error should page an operator
    pub fn should_alert(&self) -> bool {
        matches!(self, OrchestratorError::Store(_))
    }

    /// Stable kind label used in metrics and upstream status mapping
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::Unauthorized(_) => "unauthorized",
            OrchestratorError::Conflict(_) => "conflict",
            OrchestratorError::SlippageExceeded { .. } => "slippage_exceeded",
            OrchestratorError::PriceUnavailable { .. } => "price_unavailable",
            OrchestratorError::Chain { .. } => "chain_error",
            OrchestratorError::Store(_) => "store_error",
            OrchestratorError::OrderExpired { .. } => "order_expired",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::Internal(_) => "internal",
        }
    }
}

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;
