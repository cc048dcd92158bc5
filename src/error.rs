use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures fetching candles from a venue
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
}

/// Failures placing or replacing a stop order
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Network-class failure; safe to retry
    #[error("transient gateway failure: {0}")]
    Transient(String),

    /// No acknowledgement within the deadline. Never assumed applied.
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    /// Venue refused the order (bad parameters, margin, ...)
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Venue no longer has this position (closed or liquidated)
    #[error("position not found on venue")]
    PositionNotFound,
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Timeout(_))
    }
}

/// Failures of the position store or operation log
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(#[from] ParamError),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(e.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Strategy parameter validation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: String,
    },

    #[error("mult_min ({min}) is greater than mult_max ({max})")]
    InvertedBounds { min: f64, max: f64 },
}
