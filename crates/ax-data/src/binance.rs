// Binance klines provider
// Paginates the REST klines endpoint with fixed pacing and bounded retries

use async_trait::async_trait;
use ax_types::{AxResult, DataError, Interval, RawBar, RawTimestamp};
use chrono::NaiveDateTime;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::providers::{DataProvider, FetchRequest};

pub const BINANCE_KLINES_URL: &str = "https://api.binance.us/api/v3/klines";

/// Largest batch the klines endpoint returns per request.
pub const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Pacing and retry policy for paginated downloads
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationConfig {
    pub batch_limit: usize,
    pub page_delay: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            batch_limit: MAX_KLINES_PER_REQUEST,
            page_delay: Duration::from_millis(500),
            retry_delay: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

/// One klines request window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlinesQuery {
    pub symbol: String,
    pub interval: Interval,
    pub start_ms: i64,
    pub end_ms: i64,
    pub limit: usize,
}

/// Parsed kline row
#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Kline {
    /// Parse `[openTime, open, high, low, close, volume, closeTime, ...]`.
    pub fn from_row(row: &[serde_json::Value]) -> AxResult<Self> {
        if row.len() < 7 {
            return Err(DataError::ParseError {
                message: format!("kline row has {} fields, expected at least 7", row.len()),
            }
            .into());
        }

        Ok(Self {
            open_time: parse_int(&row[0], "openTime")?,
            open: parse_number(&row[1], "open")?,
            high: parse_number(&row[2], "high")?,
            low: parse_number(&row[3], "low")?,
            close: parse_number(&row[4], "close")?,
            volume: parse_number(&row[5], "volume")?,
            close_time: parse_int(&row[6], "closeTime")?,
        })
    }

    pub fn to_raw_bar(&self) -> RawBar {
        RawBar::new(
            RawTimestamp::EpochMillis(self.open_time),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

fn parse_int(value: &serde_json::Value, field: &str) -> AxResult<i64> {
    value.as_i64().ok_or_else(|| {
        DataError::ParseError {
            message: format!("kline field '{}' is not an integer: {}", field, value),
        }
        .into()
    })
}

fn parse_number(value: &serde_json::Value, field: &str) -> AxResult<f64> {
    let parsed = match value {
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DataError::ParseError {
            message: format!("kline field '{}' is not numeric: {}", field, value),
        }
        .into()
    })
}

/// Failure of a single klines request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KlinesFetchError {
    /// Network trouble or upstream overload; the same window may be retried.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

/// Transport for one klines page
#[async_trait]
pub trait KlinesClient: Send + Sync + std::fmt::Debug {
    async fn get_klines(&self, query: &KlinesQuery) -> Result<Vec<Kline>, KlinesFetchError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpKlinesClient {
    client: reqwest::Client,
    url: String,
}

impl HttpKlinesClient {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl KlinesClient for HttpKlinesClient {
    async fn get_klines(&self, query: &KlinesQuery) -> Result<Vec<Kline>, KlinesFetchError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("symbol", query.symbol.clone()),
                ("interval", query.interval.as_str().to_string()),
                ("startTime", query.start_ms.to_string()),
                ("endTime", query.end_ms.to_string()),
                ("limit", query.limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| KlinesFetchError::Transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(KlinesFetchError::Transient(format!("HTTP error: {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KlinesFetchError::Fatal(format!("HTTP error: {} {}", status, body)));
        }

        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .map_err(|e| KlinesFetchError::Transient(format!("Failed to read response body: {}", e)))?;

        rows.iter()
            .map(|row| Kline::from_row(row).map_err(|e| KlinesFetchError::Fatal(e.to_string())))
            .collect()
    }
}

/// Exchange-backed price provider quoting assets against a stable coin
#[derive(Debug)]
pub struct BinanceProvider<C: KlinesClient = HttpKlinesClient> {
    pub name: String,
    client: C,
    quote_asset: String,
    pagination: PaginationConfig,
}

impl BinanceProvider<HttpKlinesClient> {
    pub fn new() -> Self {
        Self::with_client(HttpKlinesClient::new(BINANCE_KLINES_URL))
    }

    pub fn with_url(url: &str) -> Self {
        Self::with_client(HttpKlinesClient::new(url))
    }
}

impl Default for BinanceProvider<HttpKlinesClient> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: KlinesClient> BinanceProvider<C> {
    pub fn with_client(client: C) -> Self {
        Self {
            name: "Binance".to_string(),
            client,
            quote_asset: "USDT".to_string(),
            pagination: PaginationConfig::default(),
        }
    }

    pub fn with_quote_asset(mut self, quote_asset: &str) -> Self {
        self.quote_asset = quote_asset.to_uppercase();
        self
    }

    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn market_symbol(&self, asset: &str) -> String {
        format!("{}{}", asset.to_uppercase(), self.quote_asset)
    }

    /// Download every kline between the two epoch-millisecond bounds.
    pub async fn fetch_klines(
        &self,
        asset: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> AxResult<Vec<Kline>> {
        let symbol = self.market_symbol(asset);
        let limit = self.pagination.batch_limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let mut klines = Vec::new();
        let mut cursor = start_ms;
        let mut failures = 0u32;

        while cursor <= end_ms {
            let query = KlinesQuery {
                symbol: symbol.clone(),
                interval,
                start_ms: cursor,
                end_ms,
                limit,
            };

            match self.client.get_klines(&query).await {
                Ok(batch) => {
                    failures = 0;
                    let Some(last) = batch.last() else {
                        break;
                    };
                    let next_cursor = last.open_time + 1;
                    debug!(
                        symbol = %symbol,
                        rows = batch.len(),
                        "Fetched klines batch starting at {}",
                        cursor
                    );
                    klines.extend(batch);

                    if next_cursor <= cursor || next_cursor > end_ms {
                        break;
                    }
                    cursor = next_cursor;
                    tokio::time::sleep(self.pagination.page_delay).await;
                }
                Err(KlinesFetchError::Transient(message)) => {
                    failures += 1;
                    if failures > self.pagination.max_retries {
                        return Err(DataError::Network {
                            attempts: failures,
                            message,
                        }
                        .into());
                    }
                    warn!(
                        symbol = %symbol,
                        attempt = failures,
                        "Klines request failed, retrying same window: {}",
                        message
                    );
                    tokio::time::sleep(self.pagination.retry_delay).await;
                }
                Err(KlinesFetchError::Fatal(message)) => {
                    return Err(DataError::LoadingFailed { message }.into());
                }
            }
        }

        info!(symbol = %symbol, interval = %interval, "Downloaded {} klines", klines.len());
        Ok(klines)
    }
}

fn to_epoch_millis(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

#[async_trait]
impl<C: KlinesClient> DataProvider for BinanceProvider<C> {
    fn supports_asset(&self, asset: &str) -> bool {
        !asset.is_empty() && asset.chars().all(|c| c.is_ascii_alphanumeric())
    }

    async fn fetch_bars(&self, request: &FetchRequest) -> AxResult<Vec<RawBar>> {
        if !self.supports_asset(&request.asset) {
            return Err(DataError::AssetNotFound {
                provider: self.name.clone(),
                asset: request.asset.clone(),
            }
            .into());
        }

        let klines = self
            .fetch_klines(
                &request.asset,
                request.interval,
                to_epoch_millis(request.start),
                to_epoch_millis(request.end),
            )
            .await?;

        Ok(klines.iter().map(Kline::to_raw_bar).collect())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "binance",
            "quote_asset": self.quote_asset,
            "batch_limit": self.pagination.batch_limit,
            "page_delay_ms": self.pagination.page_delay.as_millis() as u64,
            "retry_delay_ms": self.pagination.retry_delay.as_millis() as u64,
            "max_retries": self.pagination.max_retries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Serves scripted pages and records every query it receives.
    #[derive(Debug, Default)]
    struct ScriptedClient {
        pages: Mutex<VecDeque<Result<Vec<Kline>, KlinesFetchError>>>,
        queries: Mutex<Vec<KlinesQuery>>,
    }

    impl ScriptedClient {
        fn new(pages: Vec<Result<Vec<Kline>, KlinesFetchError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl KlinesClient for ScriptedClient {
        async fn get_klines(&self, query: &KlinesQuery) -> Result<Vec<Kline>, KlinesFetchError> {
            self.queries.lock().push(query.clone());
            self.pages.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn kline(open_time: i64) -> Kline {
        Kline {
            open_time,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            close_time: open_time + 59_999,
        }
    }

    fn fast() -> PaginationConfig {
        PaginationConfig {
            batch_limit: 2,
            page_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn test_pagination_advances_past_last_open_time() {
        let client = ScriptedClient::new(vec![
            Ok(vec![kline(0), kline(60_000)]),
            Ok(vec![kline(120_000)]),
            Ok(Vec::new()),
        ]);
        let provider = BinanceProvider::with_client(client).with_pagination(fast());

        let klines = provider.fetch_klines("btc", Interval::FiveMinute, 0, 1_000_000).await.unwrap();
        assert_eq!(klines.len(), 3);

        let queries = provider.client.queries.lock();
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[0].symbol, "BTCUSDT");
        assert_eq!(queries[0].limit, 2);
        assert_eq!(queries[1].start_ms, 60_001);
        assert_eq!(queries[2].start_ms, 120_001);
    }

    #[tokio::test]
    async fn test_stops_when_window_exhausted() {
        let client = ScriptedClient::new(vec![Ok(vec![kline(0), kline(60_000)])]);
        let provider = BinanceProvider::with_client(client).with_pagination(fast());

        let klines = provider.fetch_klines("ETH", Interval::FiveMinute, 0, 60_000).await.unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(provider.client.queries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_same_window() {
        let client = ScriptedClient::new(vec![
            Err(KlinesFetchError::Transient("connection reset".to_string())),
            Ok(vec![kline(0)]),
            Ok(Vec::new()),
        ]);
        let provider = BinanceProvider::with_client(client).with_pagination(fast());

        let klines = provider.fetch_klines("BTC", Interval::Hour, 0, 10_000_000).await.unwrap();
        assert_eq!(klines.len(), 1);

        let queries = provider.client.queries.lock();
        assert_eq!(queries[0].start_ms, queries[1].start_ms);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let client = ScriptedClient::new(vec![
            Err(KlinesFetchError::Transient("timeout".to_string())),
            Err(KlinesFetchError::Transient("timeout".to_string())),
            Err(KlinesFetchError::Transient("timeout".to_string())),
        ]);
        let provider = BinanceProvider::with_client(client).with_pagination(fast());

        let err = provider.fetch_klines("BTC", Interval::Hour, 0, 10).await.unwrap_err();
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let client = ScriptedClient::new(vec![Err(KlinesFetchError::Fatal("HTTP error: 400".to_string()))]);
        let provider = BinanceProvider::with_client(client).with_pagination(fast());

        assert!(provider.fetch_klines("BTC", Interval::Hour, 0, 10).await.is_err());
        assert_eq!(provider.client.queries.lock().len(), 1);
    }

    #[test]
    fn test_kline_row_parsing() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1704067200000,"42283.58","42554.57","42261.02","42475.23","1271.68108",1704070799999,"53957248.97",47134,"682.57581","28957416.82","0"]"#,
        )
        .unwrap();
        let kline = Kline::from_row(&row).unwrap();
        assert_eq!(kline.open_time, 1_704_067_200_000);
        assert_eq!(kline.close, 42475.23);

        assert!(Kline::from_row(&row[..3]).is_err());
    }
}
