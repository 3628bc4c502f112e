//! DexScreener / GeckoTerminal market data adapter
//!
//! Implements [`MarketDataProvider`] over two public APIs:
//! - Current snapshot (price, market cap, 24h volume, liquidity, dex) from DexScreener
//! - Historical prices from GeckoTerminal hourly OHLCV candles of the most liquid pool
//!
//! ## API Reference
//!
//! Endpoint: https://api.dexscreener.com/token-pairs/v1/{chain}/{address}
//! Returns: Array of trading pairs for the token
//!
//! Endpoint: https://api.geckoterminal.com/api/v2/networks/{network}/pools/{pool}/ohlcv/hour
//! Returns: `data.attributes.ohlcv_list` as `[timestamp, open, high, low, close, volume]`

use super::market_data::{MarketDataError, MarketDataProvider, PricePoint};
use super::types::{MarketSnapshot, TokenIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration as StdDuration, Instant};

const DEXSCREENER_BASE: &str = "https://api.dexscreener.com/token-pairs/v1";
const GECKOTERMINAL_BASE: &str = "https://api.geckoterminal.com/api/v2/networks";

/// Requests for instants closer than this to "now" are answered from the live pair
const LIVE_TOLERANCE_SECS: i64 = 300;

/// Pool lookups are redone after this long; liquidity moves between pools
const POOL_CACHE_TTL: StdDuration = StdDuration::from_secs(24 * 3_600);
const DEFAULT_POOL_CACHE_LIMIT: usize = 10_000;

/// DexScreener pair response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexScreenerPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "baseToken")]
    pub base_token: BaseToken,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    #[serde(rename = "marketCap")]
    pub market_cap: Option<f64>,
    pub fdv: Option<f64>,
    pub volume: Option<PairVolume>,
    pub liquidity: Option<PairLiquidity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub name: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairVolume {
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairLiquidity {
    pub usd: Option<f64>,
}

impl DexScreenerPair {
    pub fn liquidity_usd(&self) -> Option<f64> {
        self.liquidity.as_ref().and_then(|l| l.usd)
    }

    pub fn price(&self) -> Option<f64> {
        self.price_usd
            .as_deref()
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p >= 0.0)
    }

    /// Snapshot view of this pair; holders are not reported by DexScreener
    pub fn to_snapshot(&self) -> Option<MarketSnapshot> {
        Some(MarketSnapshot {
            price: self.price()?,
            mcap: self.market_cap.or(self.fdv),
            holders: None,
            volume_24h: self.volume.as_ref().and_then(|v| v.h24),
            liquidity_usd: self.liquidity_usd(),
            platform: Some(self.dex_id.clone()),
        })
    }
}

/// Pick the deepest pool; pairs without a parseable price are ignored
pub fn select_pair(pairs: &[DexScreenerPair]) -> Option<&DexScreenerPair> {
    pairs
        .iter()
        .filter(|p| p.price().is_some())
        .max_by(|a, b| {
            let la = a.liquidity_usd().unwrap_or(0.0);
            let lb = b.liquidity_usd().unwrap_or(0.0);
            la.total_cmp(&lb)
        })
}

/// One GeckoTerminal hourly candle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub high: f64,
    pub close: f64,
}

/// Parse a GeckoTerminal OHLCV body into candles sorted by time
pub fn parse_ohlcv(body: &serde_json::Value) -> Vec<Candle> {
    let mut candles: Vec<Candle> = body
        .pointer("/data/attributes/ohlcv_list")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    let ts = row.first()?.as_i64()?;
                    let high = row.get(2)?.as_f64()?;
                    let close = row.get(4)?.as_f64()?;
                    let timestamp = Utc.timestamp_opt(ts, 0).single()?;
                    Some(Candle { timestamp, high, close })
                })
                .collect()
        })
        .unwrap_or_default();

    candles.sort_by_key(|c| c.timestamp);
    candles
}

/// Close of the latest candle opening at or before `at`
pub fn close_at(candles: &[Candle], at: DateTime<Utc>) -> Option<f64> {
    candles
        .iter()
        .filter(|c| c.timestamp <= at)
        .last()
        .map(|c| c.close)
}

fn gecko_network(chain: &str) -> &str {
    match chain {
        "ethereum" => "eth",
        "bsc" => "bsc",
        "polygon" => "polygon_pos",
        other => other,
    }
}

/// HTTP-backed market data provider
pub struct DexScreenerProvider {
    client: reqwest::Client,
    /// token → (most liquid pool address, when it was looked up)
    pools: DashMap<TokenIdentity, (String, Instant)>,
    pool_cache_limit: usize,
}

impl DexScreenerProvider {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            pools: DashMap::new(),
            pool_cache_limit: DEFAULT_POOL_CACHE_LIMIT,
        })
    }

    pub fn with_pool_cache_limit(mut self, limit: usize) -> Self {
        self.pool_cache_limit = limit.max(1);
        self
    }

    pub fn cached_pools(&self) -> usize {
        self.pools.len()
    }

    /// Remember the pool for `token`, evicting expired then oldest entries at the limit
    fn cache_pool(&self, token: &TokenIdentity, pool: String) {
        if !self.pools.contains_key(token) && self.pools.len() >= self.pool_cache_limit {
            self.pools
                .retain(|_, (_, cached_at)| cached_at.elapsed() < POOL_CACHE_TTL);
            while self.pools.len() >= self.pool_cache_limit {
                let oldest = self
                    .pools
                    .iter()
                    .min_by_key(|entry| entry.value().1)
                    .map(|entry| entry.key().clone());
                match oldest {
                    Some(key) => {
                        self.pools.remove(&key);
                    }
                    None => break,
                }
            }
        }
        self.pools.insert(token.clone(), (pool, Instant::now()));
    }

    /// Fetch all pairs for the token
    ///
    /// # Returns
    /// * `Ok(pairs)` - at least one pair
    /// * `Err(UnknownToken)` - DexScreener lists no pair at all
    /// * `Err(Transient)` - network failure, rate limit or server error
    pub async fn fetch_pairs(
        &self,
        token: &TokenIdentity,
    ) -> Result<Vec<DexScreenerPair>, MarketDataError> {
        let url = format!("{}/{}/{}", DEXSCREENER_BASE, token.chain, token.address);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MarketDataError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MarketDataError::UnknownToken(token.clone()));
        }
        if !status.is_success() {
            return Err(MarketDataError::Transient(format!(
                "DexScreener API error: {}",
                status
            )));
        }

        let pairs: Vec<DexScreenerPair> = response
            .json()
            .await
            .map_err(|e| MarketDataError::Transient(e.to_string()))?;

        if pairs.is_empty() {
            return Err(MarketDataError::UnknownToken(token.clone()));
        }

        if let Some(pair) = select_pair(&pairs) {
            self.cache_pool(token, pair.pair_address.clone());
        }

        Ok(pairs)
    }

    async fn pool_address(&self, token: &TokenIdentity) -> Result<String, MarketDataError> {
        let cached = self
            .pools
            .get(token)
            .filter(|entry| entry.1.elapsed() < POOL_CACHE_TTL)
            .map(|entry| entry.0.clone());
        if let Some(pool) = cached {
            return Ok(pool);
        }

        let pairs = self.fetch_pairs(token).await?;
        select_pair(&pairs)
            .map(|p| p.pair_address.clone())
            .ok_or_else(|| MarketDataError::UnknownToken(token.clone()))
    }

    /// Hourly candles ending at `before`, newest `limit` entries
    async fn fetch_candles(
        &self,
        token: &TokenIdentity,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Candle>, MarketDataError> {
        let pool = self.pool_address(token).await?;
        let url = format!(
            "{}/{}/pools/{}/ohlcv/hour?before_timestamp={}&limit={}",
            GECKOTERMINAL_BASE,
            gecko_network(&token.chain),
            pool,
            before.timestamp(),
            limit.clamp(1, 1000)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MarketDataError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // Pool unknown to GeckoTerminal: no history, token still valid
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(MarketDataError::Transient(format!(
                "GeckoTerminal API error: {}",
                status
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MarketDataError::Transient(e.to_string()))?;

        Ok(parse_ohlcv(&body))
    }

    fn is_live(at: DateTime<Utc>) -> bool {
        (Utc::now() - at).num_seconds().abs() <= LIVE_TOLERANCE_SECS
    }
}

#[async_trait]
impl MarketDataProvider for DexScreenerProvider {
    async fn get_price(
        &self,
        token: &TokenIdentity,
        at: DateTime<Utc>,
    ) -> Result<Option<f64>, MarketDataError> {
        if Self::is_live(at) {
            let pairs = self.fetch_pairs(token).await?;
            return Ok(select_pair(&pairs).and_then(|p| p.price()));
        }

        // Two candles so a sample right after a candle boundary still resolves
        let candles = self.fetch_candles(token, at + Duration::hours(1), 2).await?;
        Ok(close_at(&candles, at))
    }

    async fn get_snapshot(
        &self,
        token: &TokenIdentity,
        at: DateTime<Utc>,
    ) -> Result<Option<MarketSnapshot>, MarketDataError> {
        if Self::is_live(at) {
            let pairs = self.fetch_pairs(token).await?;
            return Ok(select_pair(&pairs).and_then(|p| p.to_snapshot()));
        }

        // Historical snapshots only carry price; the rest is not reconstructible
        let price = self.get_price(token, at).await?;
        Ok(price.map(|price| MarketSnapshot {
            price,
            mcap: None,
            holders: None,
            volume_24h: None,
            liquidity_usd: None,
            platform: None,
        }))
    }

    async fn price_history(
        &self,
        token: &TokenIdentity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, MarketDataError> {
        if to <= from {
            return Ok(Vec::new());
        }

        let hours = (to - from).num_hours() + 1;
        let candles = self.fetch_candles(token, to, hours).await?;

        Ok(candles
            .into_iter()
            .filter(|c| c.timestamp >= from && c.timestamp <= to)
            .map(|c| PricePoint {
                timestamp: c.timestamp,
                price: c.high,
            })
            .collect())
    }

    fn provider_name(&self) -> &'static str {
        "dexscreener"
    }
}
