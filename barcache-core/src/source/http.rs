//! Price-history REST source.
//!
//! Fetches 15-minute candles from a Coinglass-style `price/history`
//! endpoint. Long ranges are split into pages of `page_limit` records;
//! each page is retried with exponential backoff. HTTP 403 trips the
//! circuit breaker at once, other failures count towards it.

use super::circuit_breaker::CircuitBreaker;
use super::{RawRecordSource, SourceError};
use crate::domain::{quarter_duration, validate_symbol, Candle15m};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://open-api-v4.coinglass.com/api/futures/price/history";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub exchange: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    /// Records per request.
    pub page_limit: u32,
    pub max_retries: u32,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            exchange: "Binance".to_string(),
            api_key_env: Some("CG_API_KEY".to_string()),
            timeout_secs: 30,
            page_limit: 4500,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Vec<HistoryPoint>>,
}

/// Prices arrive as strings or JSON numbers depending on the endpoint.
#[derive(Debug, Deserialize)]
struct HistoryPoint {
    time: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume_usd: Decimal,
}

pub struct HttpSource {
    client: reqwest::blocking::Client,
    config: HttpSourceConfig,
    api_key: Option<String>,
    circuit_breaker: Arc<CircuitBreaker>,
    base_delay: Duration,
}

impl HttpSource {
    pub fn new(
        config: HttpSourceConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SourceError::Other(format!("failed to build HTTP client: {e}")))?;

        let api_key = config.api_key_env.as_deref().and_then(|var| match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                warn!(var, "API key variable is not set; sending unauthenticated requests");
                None
            }
        });

        Ok(Self {
            client,
            config,
            api_key,
            circuit_breaker,
            base_delay: Duration::from_millis(500),
        })
    }

    /// Base delay between retries of one page, doubled per attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    fn page_span(&self) -> chrono::Duration {
        quarter_duration() * self.config.page_limit.max(1) as i32
    }

    fn history_url(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            "{}?exchange={}&symbol={symbol}&interval=15m&limit={}&start_time={}&end_time={}",
            self.config.base_url,
            self.config.exchange,
            self.config.page_limit,
            start.timestamp_millis(),
            end.timestamp_millis(),
        )
    }

    /// Decode one page, keeping records inside `[start, end)`.
    fn parse_page(
        body: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError> {
        let resp: HistoryResponse = serde_json::from_str(body)
            .map_err(|e| SourceError::ResponseFormatChanged(format!("invalid JSON: {e}")))?;

        if resp.code != "0" {
            return Err(SourceError::Api {
                code: resp.code,
                message: resp.msg.unwrap_or_default(),
            });
        }

        let mut records = Vec::new();
        for point in resp.data.unwrap_or_default() {
            let timestamp = DateTime::from_timestamp_millis(point.time).ok_or_else(|| {
                SourceError::ResponseFormatChanged(format!("invalid timestamp: {}", point.time))
            })?;
            if timestamp < start || timestamp >= end {
                continue;
            }
            records.push(Candle15m {
                timestamp,
                open: point.open,
                high: point.high,
                low: point.low,
                close: point.close,
                volume: point.volume_usd,
            });
        }
        Ok(records)
    }

    /// One page request with retry and circuit breaker handling.
    fn fetch_page(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError> {
        let url = self.history_url(symbol, start, end);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.base_delay * 2u32.pow(attempt - 1));
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(SourceError::CircuitBreakerTripped);
            }

            let mut request = self.client.get(&url).header("accept", "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("CG-API-KEY", key);
            }

            let resp = match request.send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(SourceError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(SourceError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                warn!(symbol, "source returned 403; circuit breaker tripped");
                return Err(SourceError::CircuitBreakerTripped);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(SourceError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }
            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(SourceError::HttpStatus {
                    status: status.as_u16(),
                    symbol: symbol.to_string(),
                });
                continue;
            }

            let body = resp
                .text()
                .map_err(|e| SourceError::NetworkUnreachable(e.to_string()))?;
            let records = Self::parse_page(&body, start, end)?;
            self.circuit_breaker.record_success();
            return Ok(records);
        }

        Err(last_error.unwrap_or_else(|| SourceError::Other("max retries exceeded".into())))
    }
}

impl RawRecordSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle15m>, SourceError> {
        validate_symbol(symbol)?;
        if !self.circuit_breaker.is_allowed() {
            return Err(SourceError::CircuitBreakerTripped);
        }

        let span = self.page_span();
        let mut records = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let page_end = cursor.checked_add_signed(span).map_or(end, |t| t.min(end));
            let page = self.fetch_page(symbol, cursor, page_end)?;
            debug!(symbol, %cursor, %page_end, records = page.len(), "fetched page");
            records.extend(page);
            cursor = page_end;
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
