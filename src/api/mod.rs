// Venue adapters
//
// The evaluation core only sees these two traits; each venue implements
// them over its own wire format.

pub mod binance;
pub mod binance_gateway;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, SourceError};
use crate::models::{Candle, Side, Timeframe, VenueAccount};

pub use binance::BinanceClient;
pub use binance_gateway::BinanceGateway;
pub use paper::PaperGateway;

/// Supplies ordered OHLCV history
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles for `symbol` ascending by open time
    ///
    /// With `since`, returns bars opened at or after it; without, the most
    /// recent `limit` bars. May include the bar that is still forming.
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>, SourceError>;
}

/// Venue acknowledgement of a stop order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StopAck {
    pub order_id: String,
    pub price: f64,
    pub placed_at: DateTime<Utc>,
}

/// Places or replaces the protective stop for a position
///
/// Calling twice with the same price must leave the venue in the same
/// state as calling once.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError>;

    /// Whether the venue still holds the position
    ///
    /// Gateways that cannot tell report `true`; a gone position then
    /// surfaces as `PositionNotFound` on the next `set_stop`.
    async fn has_position(
        &self,
        _account: &VenueAccount,
        _symbol: &str,
        _side: Side,
    ) -> Result<bool, GatewayError> {
        Ok(true)
    }
}
