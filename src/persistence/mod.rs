use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

use crate::api::CandleSource;
use crate::error::SourceError;
use crate::models::{Candle, Timeframe};
use crate::Result;

/// Closed bars kept per (symbol, timeframe)
const KEEP_BARS: i64 = 1000;

/// Redis cache of closed candles
///
/// Uses sorted sets with bar open time as score for efficient range queries
#[derive(Clone)]
pub struct RedisCandleCache {
    conn: ConnectionManager,
}

fn key(symbol: &str, timeframe: Timeframe) -> String {
    format!("candles:{}:{}", symbol, timeframe)
}

impl RedisCandleCache {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Save candles, replacing any stored bar with the same open time
    pub async fn save_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> Result<()> {
        let key = key(symbol, timeframe);
        let mut conn = self.conn.clone();

        for candle in candles {
            let value = serde_json::to_string(candle)?;
            let score = candle.timestamp.timestamp() as f64;

            conn.zrembyscore::<_, _, _, ()>(&key, score, score).await?;
            conn.zadd::<_, _, _, ()>(&key, value, score).await?;
        }

        tracing::debug!(
            "Saved {} candles for {} {} to Redis",
            candles.len(),
            symbol,
            timeframe
        );

        Ok(())
    }

    /// Load candles opened at or after `from`, oldest first
    pub async fn load_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let key = key(symbol, timeframe);
        let mut conn = self.conn.clone();

        let results: Vec<String> = conn
            .zrangebyscore(&key, from.timestamp() as f64, "+inf")
            .await?;

        let mut candles = Vec::with_capacity(results.len());
        for json_str in results {
            candles.push(serde_json::from_str::<Candle>(&json_str)?);
        }

        Ok(candles)
    }

    /// Remove bars older than `before`
    pub async fn cleanup_old(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        let key = key(symbol, timeframe);
        let mut conn = self.conn.clone();

        let removed: usize = conn
            .zrembyscore(&key, "-inf", format!("({}", before.timestamp()))
            .await?;

        if removed > 0 {
            tracing::debug!("Cleaned up {} old candles for {} {}", removed, symbol, timeframe);
        }

        Ok(removed)
    }
}

/// Cached bars followed by fresh ones; fresh wins on the same timestamp
pub fn merge(cached: Vec<Candle>, fresh: Vec<Candle>) -> Vec<Candle> {
    let cutoff = fresh.first().map(|c| c.timestamp);
    let mut merged: Vec<Candle> = cached
        .into_iter()
        .filter(|c| cutoff.map_or(true, |t| c.timestamp < t))
        .collect();
    merged.extend(fresh);
    merged
}

/// `CandleSource` that serves closed bars from Redis and only asks the
/// venue for bars newer than the cache
pub struct CachedCandleSource {
    inner: Arc<dyn CandleSource>,
    cache: RedisCandleCache,
}

impl CachedCandleSource {
    pub fn new(inner: Arc<dyn CandleSource>, cache: RedisCandleCache) -> Self {
        Self { inner, cache }
    }

    async fn store_closed(&self, symbol: &str, timeframe: Timeframe, candles: &[Candle]) {
        let now = Utc::now();
        let closed: Vec<Candle> = candles
            .iter()
            .filter(|c| timeframe.is_closed(c.timestamp, now))
            .cloned()
            .collect();
        if closed.is_empty() {
            return;
        }

        if let Err(e) = self.cache.save_candles(symbol, timeframe, &closed).await {
            tracing::warn!("Failed to cache candles for {}: {}", symbol, e);
            return;
        }
        let horizon = now - timeframe.duration() * KEEP_BARS as i32;
        if let Err(e) = self.cache.cleanup_old(symbol, timeframe, horizon).await {
            tracing::warn!("Failed to trim candle cache for {}: {}", symbol, e);
        }
    }
}

#[async_trait]
impl CandleSource for CachedCandleSource {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> std::result::Result<Vec<Candle>, SourceError> {
        let from = since.unwrap_or_else(|| Utc::now() - timeframe.duration() * limit as i32);

        let cached = match self.cache.load_candles(symbol, timeframe, from).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!("Candle cache read failed for {}, using venue: {}", symbol, e);
                Vec::new()
            }
        };

        // The cache must reach back as far as the caller asked
        let covered = match since {
            Some(since) => cached
                .first()
                .is_some_and(|c| c.timestamp <= since + timeframe.duration()),
            None => cached.len() + 1 >= limit,
        };

        let Some(last_cached) = cached.last().map(|c| c.timestamp).filter(|_| covered) else {
            let fresh = self.inner.fetch(symbol, timeframe, since, limit).await?;
            self.store_closed(symbol, timeframe, &fresh).await;
            return Ok(fresh);
        };

        let missing = (Utc::now() - last_cached).num_seconds() / timeframe.seconds();
        let fresh = self
            .inner
            .fetch(symbol, timeframe, Some(last_cached), missing.max(0) as usize + 2)
            .await?;
        self.store_closed(symbol, timeframe, &fresh).await;

        tracing::debug!(
            "{} {}: {} cached + {} fresh candles",
            symbol,
            timeframe,
            cached.len(),
            fresh.len()
        );

        let mut merged = merge(cached, fresh);
        if since.is_none() && merged.len() > limit {
            merged.drain(..merged.len() - limit);
        }
        Ok(merged)
    }
}
