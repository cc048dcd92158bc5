use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{OrderGateway, StopAck};
use crate::error::GatewayError;
use crate::models::{Side, VenueAccount};

type PositionKey = (VenueAccount, String, Side);

#[derive(Default)]
struct PaperBook {
    open: HashSet<PositionKey>,
    stops: HashMap<PositionKey, StopAck>,
    calls: usize,
}

/// In-memory venue that only records stop orders
///
/// Strict mode knows which positions are open and reports
/// `PositionNotFound` for anything else. Permissive mode accepts any
/// position and is what dry runs use.
#[derive(Clone)]
pub struct PaperGateway {
    strict: bool,
    book: Arc<Mutex<PaperBook>>,
}

impl PaperGateway {
    pub fn strict() -> Self {
        Self {
            strict: true,
            book: Arc::new(Mutex::new(PaperBook::default())),
        }
    }

    pub fn permissive() -> Self {
        Self {
            strict: false,
            book: Arc::new(Mutex::new(PaperBook::default())),
        }
    }

    pub fn open_position(&self, account: &VenueAccount, symbol: &str, side: Side) {
        if let Ok(mut book) = self.book.lock() {
            book.open.insert((account.clone(), symbol.to_string(), side));
        }
    }

    /// Simulate a liquidation or an external close
    pub fn close_position(&self, account: &VenueAccount, symbol: &str, side: Side) {
        if let Ok(mut book) = self.book.lock() {
            let key = (account.clone(), symbol.to_string(), side);
            book.open.remove(&key);
            book.stops.remove(&key);
        }
    }

    pub fn stop_for(&self, account: &VenueAccount, symbol: &str, side: Side) -> Option<f64> {
        let book = self.book.lock().ok()?;
        book.stops
            .get(&(account.clone(), symbol.to_string(), side))
            .map(|ack| ack.price)
    }

    /// Number of `set_stop` calls received, accepted or not
    pub fn calls(&self) -> usize {
        self.book.lock().map(|b| b.calls).unwrap_or(0)
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError> {
        let mut book = self
            .book
            .lock()
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        book.calls += 1;

        if !price.is_finite() || price <= 0.0 {
            return Err(GatewayError::Rejected(format!("invalid stop price {}", price)));
        }

        let key = (account.clone(), symbol.to_string(), side);
        if self.strict && !book.open.contains(&key) {
            return Err(GatewayError::PositionNotFound);
        }

        // Same price again keeps the existing order
        if let Some(existing) = book.stops.get(&key) {
            if existing.price == price {
                return Ok(existing.clone());
            }
        }

        let ack = StopAck {
            order_id: Uuid::new_v4().to_string(),
            price,
            placed_at: Utc::now(),
        };
        tracing::info!(
            account = %account,
            symbol = %symbol,
            side = %side,
            price,
            "Paper stop placed"
        );
        book.stops.insert(key, ack.clone());
        Ok(ack)
    }

    async fn has_position(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
    ) -> Result<bool, GatewayError> {
        if !self.strict {
            return Ok(true);
        }
        let book = self
            .book
            .lock()
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        Ok(book.open.contains(&(account.clone(), symbol.to_string(), side)))
    }
}
