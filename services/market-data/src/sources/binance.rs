//! Binance USDⓈ-M futures continuous klines over REST

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::types::*;

pub const BINANCE_FUTURES_URL: &str = "https://fapi.binance.com";
const CONTINUOUS_KLINES_PATH: &str = "/fapi/v1/continuousKlines";
const SOURCE_NAME: &str = "binance-futures";
/// Exchange maximum for continuousKlines
const MAX_PAGE_LIMIT: u32 = 1500;
const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";
/// Back off before the 1m request weight budget runs out
const USED_WEIGHT_LIMIT: u32 = 4000;

/// Capped exponential backoff for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus up to 10% random jitter, still capped at `max_delay`
    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let jitter_ms = (delay.as_millis() as u64 / 10).max(1);
        let extra = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
        (delay + extra).min(self.max_delay)
    }
}

/// Request outcome counters, readable without calling the API
struct HealthTracker {
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    last_latency_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HealthTracker {
    fn new() -> Self {
        Self {
            last_success_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn record_success(&self, latency_ms: u64) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_success_ms.store(now_ms, Ordering::Relaxed);
        self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &MarketDataError) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_failure_ms.store(now_ms, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.to_string());
        }
    }

    fn snapshot(&self, source: &str) -> SourceHealth {
        let last_success = self.last_success_ms.load(Ordering::Relaxed);
        let last_failure = self.last_failure_ms.load(Ordering::Relaxed);
        let successes = self.success_count.load(Ordering::Relaxed);
        let failures = self.failure_count.load(Ordering::Relaxed);
        let total = successes + failures;

        SourceHealth {
            source: source.to_string(),
            // Healthy once something succeeded and nothing failed since
            is_healthy: last_success > 0 && last_success >= last_failure,
            last_success: (last_success > 0)
                .then(|| DateTime::<Utc>::from_timestamp_millis(last_success as i64))
                .flatten(),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
            success_rate: if total == 0 {
                1.0
            } else {
                successes as f64 / total as f64
            },
            avg_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// Binance futures REST client for continuous contract klines
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    /// Fixed-size permit pool shared by every stream using this client
    permits: Semaphore,
    retry: RetryPolicy,
    page_limit: u32,
    health: HealthTracker,
}

impl BinanceFuturesClient {
    /// Per-request timeout
    const REQUEST_TIMEOUT_SECS: u64 = 10;

    pub fn new(fetch_permits: usize, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| MarketDataError::ClientSetup(e.to_string()))?;

        Ok(Self {
            client,
            base_url: BINANCE_FUTURES_URL.to_string(),
            permits: Semaphore::new(fetch_permits.max(1)),
            retry,
            page_limit: MAX_PAGE_LIMIT,
            health: HealthTracker::new(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    /// One page of raw klines, retried on transient failures
    async fn request_page(
        &self,
        timeframe: &Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Value>> {
        let params = [
            ("pair", timeframe.symbol.clone()),
            ("contractType", timeframe.contract_type.to_string()),
            ("interval", timeframe.interval.to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", self.page_limit.to_string()),
        ];

        let mut attempt = 0;
        loop {
            // Permit is released before any backoff sleep
            let outcome = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|e| MarketDataError::Transient(e.to_string()))?;
                self.send_once(&params).await
            };

            match outcome {
                Ok(rows) => return Ok(rows),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = match &e {
                        MarketDataError::RateLimited {
                            retry_after: Some(secs),
                            ..
                        } => Duration::from_secs(*secs).min(self.retry.max_delay),
                        _ => self.retry.jittered(attempt),
                    };
                    warn!(
                        "{} klines for {}: {} (retry {} of {} in {:?})",
                        SOURCE_NAME,
                        timeframe.label(),
                        e,
                        attempt + 1,
                        self.retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(MarketDataError::RetriesExhausted {
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, params: &[(&str, String)]) -> Result<Vec<Value>> {
        let started = Instant::now();
        let url = format!("{}{}", self.base_url, CONTINUOUS_KLINES_PATH);
        let request = self.client.get(&url).query(params).send();

        let response =
            match tokio::time::timeout(Duration::from_secs(Self::REQUEST_TIMEOUT_SECS), request)
                .await
            {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => return Err(self.fail(MarketDataError::Transient(e.to_string()))),
                Err(_) => {
                    return Err(self.fail(MarketDataError::Transient(format!(
                        "request timed out after {}s",
                        Self::REQUEST_TIMEOUT_SECS
                    ))))
                }
            };

        let status = response.status();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        };
        let retry_after = header("retry-after");
        let used_weight = header(USED_WEIGHT_HEADER);

        // 418 is Binance's escalation after ignored 429s
        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(self.fail(MarketDataError::RateLimited {
                source_name: SOURCE_NAME.to_string(),
                retry_after,
            }));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.fail(MarketDataError::Api {
                status: status.as_u16(),
                body,
            }));
        }

        if let Some(weight) = used_weight {
            if weight >= USED_WEIGHT_LIMIT as u64 {
                warn!("{} used weight at {}, backing off", SOURCE_NAME, weight);
                return Err(self.fail(MarketDataError::RateLimited {
                    source_name: SOURCE_NAME.to_string(),
                    retry_after,
                }));
            }
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| self.fail(MarketDataError::Malformed(e.to_string())))?;

        match body {
            Value::Array(rows) => {
                self.health
                    .record_success(started.elapsed().as_millis() as u64);
                Ok(rows)
            }
            other => Err(self.fail(MarketDataError::Malformed(format!(
                "expected kline array, got {}",
                other
            )))),
        }
    }

    fn fail(&self, error: MarketDataError) -> MarketDataError {
        self.health.record_failure(&error);
        error
    }
}

/// Parse one continuous kline row into a bar for `timeframe`
///
/// Row layout: `[open_time, open, high, low, close, volume, close_time,
/// quote_volume, trades, taker_buy_volume, ...]`
pub fn parse_kline(timeframe: &Timeframe, value: &Value) -> Result<Bar> {
    let fields = value
        .as_array()
        .ok_or_else(|| MarketDataError::Malformed("kline is not an array".to_string()))?;
    if fields.len() < 9 {
        return Err(MarketDataError::Malformed(format!(
            "kline has {} fields, expected at least 9",
            fields.len()
        )));
    }

    let timestamp = |idx: usize, name: &str| -> Result<DateTime<Utc>> {
        fields[idx]
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| MarketDataError::Malformed(format!("invalid {}", name)))
    };
    let decimal = |idx: usize, name: &str| -> Result<Decimal> {
        fields[idx]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| MarketDataError::Malformed(format!("invalid {} decimal", name)))
    };

    let open_time = timestamp(0, "open_time")?;
    let close_time = timestamp(6, "close_time")?;
    let trades = fields[8]
        .as_i64()
        .ok_or_else(|| MarketDataError::Malformed("invalid trades".to_string()))?;

    let mut bar = Bar::new(
        timeframe,
        open_time,
        decimal(1, "open")?,
        decimal(2, "high")?,
        decimal(3, "low")?,
        decimal(4, "close")?,
        decimal(5, "volume")?,
        trades,
    )
    .with_close_time(close_time);

    if fields.len() > 9 {
        bar = bar.with_taker_buy_volume(decimal(9, "taker_buy_volume")?);
    }

    Ok(bar)
}

#[async_trait::async_trait]
impl MarketDataSource for BinanceFuturesClient {
    async fn fetch_bars(
        &self,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let mut bars = Vec::new();
        let mut cursor = start.timestamp_millis();
        let end_ms = end.timestamp_millis();
        let now = Utc::now();

        while cursor < end_ms {
            let rows = self.request_page(timeframe, cursor, end_ms - 1).await?;
            if rows.is_empty() {
                break;
            }

            let mut last_open_ms = cursor;
            for row in &rows {
                let bar = match parse_kline(timeframe, row) {
                    Ok(bar) => bar,
                    Err(e) => {
                        warn!("Rejected kline for {}: {}", timeframe.label(), e);
                        continue;
                    }
                };
                last_open_ms = last_open_ms.max(bar.open_time.timestamp_millis());

                if bar.close_time > now {
                    debug!("Skipping forming bar {} at {}", bar.label(), bar.open_time);
                    continue;
                }
                if bar.open_time < start || bar.open_time >= end {
                    continue;
                }
                bars.push(bar);
            }

            if (rows.len() as u32) < self.page_limit || last_open_ms < cursor {
                break;
            }
            cursor = last_open_ms + 1;
        }

        debug!(
            "Fetched {} closed bars for {} from {}",
            bars.len(),
            timeframe.label(),
            SOURCE_NAME
        );
        Ok(bars)
    }

    async fn health(&self) -> SourceHealth {
        self.health.snapshot(SOURCE_NAME)
    }

    fn name(&self) -> &str {
        SOURCE_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn timeframe() -> Timeframe {
        Timeframe::new(
            &InstrumentKey::new("BTCUSDT", ContractType::Perpetual),
            Interval::MINUTES_15,
            0.4,
        )
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
        assert!(policy.jittered(2) <= Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_kline() {
        let row = json!([
            1704067200000i64, "42000.10", "42100.00", "41950.50", "42050.00", "123.456",
            1704068099999i64, "5190000.0", 1500, "60.5", "2540000.0", "0"
        ]);
        let bar = parse_kline(&timeframe(), &row).unwrap();
        assert_eq!(bar.open_time.timestamp_millis(), 1704067200000);
        assert_eq!(bar.close_time.timestamp_millis(), 1704068099999);
        assert_eq!(bar.close, Decimal::from_str("42050.00").unwrap());
        assert_eq!(bar.trades, 1500);
        assert_eq!(bar.taker_buy_volume, Some(Decimal::from_str("60.5").unwrap()));
        assert!(bar.validate().is_ok());
    }

    #[test]
    fn test_parse_kline_rejects_non_finite_price() {
        let row = json!([
            1704067200000i64, "NaN", "42100.00", "41950.50", "42050.00", "1",
            1704068099999i64, "0", 1
        ]);
        let err = parse_kline(&timeframe(), &row).unwrap_err();
        assert!(matches!(err, MarketDataError::Malformed(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_kline_rejects_short_rows() {
        let row = json!([1704067200000i64, "1", "1"]);
        assert!(parse_kline(&timeframe(), &row).is_err());
        assert!(parse_kline(&timeframe(), &json!({"open": "1"})).is_err());
    }
}
