//! Error taxonomy for the trading core.
//!
//! Venue-reported errors live in [`crate::exchange::AdapterError`]; this
//! enum covers everything the core itself can raise. Only configuration
//! errors are fatal; everything else degrades to a skipped cycle.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::AdapterError;

/// Core trading errors with detailed classification
#[derive(Error, Debug, Clone)]
pub enum TradingError {
    /// Invalid grid or risk parameters, fatal at startup
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Intent dropped locally, next planning cycle may retry
    #[error("Invalid order intent: {reason}")]
    InvalidOrderIntent { reason: String },

    /// Intent would breach the position limit and has no headroom left
    #[error("Position limit exceeded: position={position}, requested={requested}, max={max}")]
    PositionLimitExceeded {
        position: Decimal,
        requested: Decimal,
        max: Decimal,
    },

    /// Local view disagreed with the venue snapshot beyond tolerance
    #[error("Reconciliation divergence: local={local}, venue={venue}")]
    ReconciliationDivergence { local: Decimal, venue: Decimal },

    /// Write to the relational store failed after retries
    #[error("Persistence failure: {message}")]
    PersistenceFailure { message: String },

    /// Venue-reported failure surfaced through the adapter
    #[error(transparent)]
    Venue(#[from] AdapterError),
}

impl TradingError {
    /// Fatal errors abort startup; everything else is recovered locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TradingError::Configuration { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::Configuration { .. } => "CONFIG",
            TradingError::InvalidOrderIntent { .. } => "INVALID_INTENT",
            TradingError::PositionLimitExceeded { .. } => "POSITION_LIMIT",
            TradingError::ReconciliationDivergence { .. } => "DIVERGENCE",
            TradingError::PersistenceFailure { .. } => "PERSISTENCE",
            TradingError::Venue(_) => "VENUE",
        }
    }
}

/// Shorthand for configuration failures raised during validation.
pub fn config_error(message: impl Into<String>) -> TradingError {
    TradingError::Configuration {
        message: message.into(),
    }
}
