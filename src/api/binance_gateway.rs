use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::binance::{normalize_symbol, ApiError, BinanceClient};
use super::{OrderGateway, StopAck};
use crate::error::GatewayError;
use crate::models::{Side, VenueAccount};

const POSITION_RISK_PATH: &str = "/fapi/v2/positionRisk";
const OPEN_ORDERS_PATH: &str = "/fapi/v1/openOrders";
const ORDER_PATH: &str = "/fapi/v1/order";
const EXCHANGE_INFO_PATH: &str = "/fapi/v1/exchangeInfo";
const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const DEFAULT_RECV_WINDOW_MS: u64 = 5000;
const STOP_MARKET: &str = "STOP_MARKET";

// Venue codes worth a retry: disconnected, too many requests, clock skew
const RETRYABLE_CODES: [i64; 3] = [-1001, -1003, -1021];
const UNKNOWN_ORDER_CODE: i64 = -2011;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    position_amt: String,
    #[serde(default)]
    position_side: String,
}

impl PositionRisk {
    fn holds(&self, side: Side) -> bool {
        let amount: f64 = self.position_amt.parse().unwrap_or(0.0);
        match (side, self.position_side.as_str()) {
            (Side::Long, "LONG") | (Side::Short, "SHORT") => amount != 0.0,
            (Side::Long, "SHORT") | (Side::Short, "LONG") => false,
            // One-way mode: the sign is the side
            (Side::Long, _) => amount > 0.0,
            (Side::Short, _) => amount < 0.0,
        }
    }

    fn is_hedged(&self) -> bool {
        matches!(self.position_side.as_str(), "LONG" | "SHORT")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrder {
    order_id: i64,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    stop_price: String,
    #[serde(default)]
    position_side: String,
    #[serde(default)]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlacedOrder {
    order_id: i64,
    #[serde(default)]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<Value>,
}

/// Failure of one signed call, before it is folded into a `GatewayError`
enum CallError {
    Api(ApiError),
    Gateway(GatewayError),
}

impl From<CallError> for GatewayError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Api(err) if RETRYABLE_CODES.contains(&err.code) => {
                GatewayError::Transient(format!("venue error {}: {}", err.code, err.msg))
            }
            CallError::Api(err) => GatewayError::Rejected(format!("{} ({})", err.msg, err.code)),
            CallError::Gateway(err) => err,
        }
    }
}

/// Signed Binance USDⓈ-M futures order gateway
///
/// Keeps exactly one `STOP_MARKET` close-position order per position. A
/// replacement is placed before the old order is cancelled, so the
/// position always has a stop working. Shares the HTTP pool and rate limit
/// of the `BinanceClient` it was built from.
#[derive(Clone)]
pub struct BinanceGateway {
    client: BinanceClient,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    tick_sizes: Arc<RwLock<HashMap<String, String>>>,
}

/// Hex HMAC-SHA256 of the query string
fn sign(secret: &str, query: &str) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Rejected(format!("invalid API secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn tick_decimals(tick: &str) -> usize {
    tick.split_once('.')
        .map(|(_, frac)| frac.trim_end_matches('0').len())
        .unwrap_or(0)
}

/// Price rounded to the symbol's tick, as the venue expects it written
fn format_price(price: f64, tick: Option<&str>) -> String {
    let step = tick
        .and_then(|t| t.parse::<f64>().ok().filter(|s| *s > 0.0).map(|s| (s, t)));
    match step {
        Some((step, tick)) => {
            format!("{:.*}", tick_decimals(tick), (price / step).round() * step)
        }
        None => {
            let raw = format!("{:.8}", price);
            raw.trim_end_matches('0').trim_end_matches('.').to_string()
        }
    }
}

fn venue_time(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .filter(|_| ms > 0)
        .unwrap_or_else(Utc::now)
}

fn closing_side(side: Side) -> &'static str {
    match side {
        Side::Long => "SELL",
        Side::Short => "BUY",
    }
}

impl BinanceGateway {
    pub fn new(
        client: BinanceClient,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            tick_sizes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, CallError> {
        let mut params = params.to_vec();
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let endpoint = format!("{}{}", self.client.base_url(), path);
        let mut url = Url::parse_with_params(&endpoint, &params).map_err(|e| {
            CallError::Gateway(GatewayError::Rejected(format!("bad request url: {}", e)))
        })?;
        let signature = sign(&self.api_secret, url.query().unwrap_or_default())
            .map_err(CallError::Gateway)?;
        url.query_pairs_mut().append_pair("signature", &signature);

        self.client.throttle().await;
        let request = self
            .client
            .http()
            .request(method, url)
            .header(API_KEY_HEADER, &self.api_key);
        parse_response(request.send().await).await
    }

    async fn position(
        &self,
        symbol: &str,
        side: Side,
    ) -> Result<Option<PositionRisk>, GatewayError> {
        let positions: Vec<PositionRisk> = self
            .signed(Method::GET, POSITION_RISK_PATH, &[("symbol", symbol.to_string())])
            .await?;
        Ok(positions.into_iter().find(|p| p.holds(side)))
    }

    async fn stop_orders(
        &self,
        symbol: &str,
        side: Side,
        hedged: bool,
    ) -> Result<Vec<OpenOrder>, GatewayError> {
        let orders: Vec<OpenOrder> = self
            .signed(Method::GET, OPEN_ORDERS_PATH, &[("symbol", symbol.to_string())])
            .await?;
        Ok(orders
            .into_iter()
            .filter(|o| o.order_type == STOP_MARKET && o.side == closing_side(side))
            .filter(|o| !hedged || o.position_side == side.as_str().to_ascii_uppercase())
            .collect())
    }

    async fn cancel(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        match self.signed::<Value>(Method::DELETE, ORDER_PATH, &params).await {
            Ok(_) => Ok(()),
            // Already filled or cancelled
            Err(CallError::Api(err)) if err.code == UNKNOWN_ORDER_CODE => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn tick_size(&self, symbol: &str) -> Result<Option<String>, GatewayError> {
        {
            let ticks = self
                .tick_sizes
                .read()
                .map_err(|e| GatewayError::Transient(e.to_string()))?;
            if let Some(tick) = ticks.get(symbol) {
                return Ok(Some(tick.clone()));
            }
        }

        let url = format!("{}{}", self.client.base_url(), EXCHANGE_INFO_PATH);
        self.client.throttle().await;
        let info: ExchangeInfo = parse_response(self.client.http().get(&url).send().await)
            .await
            .map_err(GatewayError::from)?;

        let mut ticks = self
            .tick_sizes
            .write()
            .map_err(|e| GatewayError::Transient(e.to_string()))?;
        for entry in info.symbols {
            let tick = entry
                .filters
                .iter()
                .find(|f| f.get("filterType").and_then(Value::as_str) == Some("PRICE_FILTER"))
                .and_then(|f| f.get("tickSize")?.as_str().map(str::to_string));
            if let Some(tick) = tick {
                ticks.insert(entry.symbol, tick);
            }
        }
        Ok(ticks.get(symbol).cloned())
    }
}

async fn parse_response<T: DeserializeOwned>(
    sent: reqwest::Result<reqwest::Response>,
) -> Result<T, CallError> {
    let response = sent.map_err(|e| {
        CallError::Gateway(GatewayError::Transient(format!("request failed: {}", e)))
    })?;
    let status = response.status();
    let body = response.text().await.map_err(|e| {
        CallError::Gateway(GatewayError::Transient(format!("response body lost: {}", e)))
    })?;

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
        || status.is_server_error()
    {
        return Err(CallError::Gateway(GatewayError::Transient(format!(
            "venue returned {}: {}",
            status, body
        ))));
    }
    if !status.is_success() {
        return Err(match serde_json::from_str::<ApiError>(&body) {
            Ok(err) => CallError::Api(err),
            Err(_) => CallError::Gateway(GatewayError::Rejected(format!(
                "venue returned {}: {}",
                status, body
            ))),
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        CallError::Gateway(GatewayError::Transient(format!("malformed venue response: {}", e)))
    })
}

#[async_trait]
impl OrderGateway for BinanceGateway {
    async fn set_stop(
        &self,
        account: &VenueAccount,
        symbol: &str,
        side: Side,
        price: f64,
    ) -> Result<StopAck, GatewayError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(GatewayError::Rejected(format!("invalid stop price {}", price)));
        }

        let venue_symbol = normalize_symbol(symbol);
        let position = self
            .position(&venue_symbol, side)
            .await?
            .ok_or(GatewayError::PositionNotFound)?;

        let tick = self.tick_size(&venue_symbol).await?;
        let stop_price = format_price(price, tick.as_deref());
        let placed_price: f64 = stop_price.parse().unwrap_or(price);

        let existing = self
            .stop_orders(&venue_symbol, side, position.is_hedged())
            .await?;
        let (kept, stale): (Vec<_>, Vec<_>) = existing
            .into_iter()
            .partition(|o| o.stop_price.parse::<f64>().ok() == Some(placed_price));

        let ack = match kept.first() {
            Some(order) => StopAck {
                order_id: order.order_id.to_string(),
                price: placed_price,
                placed_at: venue_time(order.update_time),
            },
            None => {
                let mut params = vec![
                    ("symbol", venue_symbol.clone()),
                    ("side", closing_side(side).to_string()),
                    ("type", STOP_MARKET.to_string()),
                    ("stopPrice", stop_price.clone()),
                    ("closePosition", "true".to_string()),
                    ("workingType", "MARK_PRICE".to_string()),
                ];
                if position.is_hedged() {
                    params.push(("positionSide", side.as_str().to_ascii_uppercase()));
                }
                let placed: PlacedOrder = self.signed(Method::POST, ORDER_PATH, &params).await?;
                tracing::info!(
                    account = %account,
                    symbol = %venue_symbol,
                    side = %side,
                    stop = %stop_price,
                    order_id = placed.order_id,
                    "Stop order placed"
                );
                StopAck {
                    order_id: placed.order_id.to_string(),
                    price: placed_price,
                    placed_at: venue_time(placed.update_time),
                }
            }
        };

        for order in stale.iter().chain(kept.iter().skip(1)) {
            self.cancel(&venue_symbol, order.order_id).await?;
            tracing::debug!(
                symbol = %venue_symbol,
                order_id = order.order_id,
                "Replaced stop order cancelled"
            );
        }

        Ok(ack)
    }

    async fn has_position(
        &self,
        _account: &VenueAccount,
        symbol: &str,
        side: Side,
    ) -> Result<bool, GatewayError> {
        Ok(self
            .position(&normalize_symbol(symbol), side)
            .await?
            .is_some())
    }
}
