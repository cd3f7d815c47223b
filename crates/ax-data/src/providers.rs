use async_trait::async_trait;
use ax_types::{AxResult, DataError, Interval, RawBar, RawTimestamp};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Inclusive time window requested from a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchRequest {
    pub asset: String,
    pub interval: Interval,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl FetchRequest {
    pub fn new(asset: &str, interval: Interval, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            asset: asset.to_uppercase(),
            interval,
            start,
            end,
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Trait for price sources (exchange APIs, CSV files, synthetic data)
#[async_trait]
pub trait DataProvider: Send + Sync + std::fmt::Debug {
    /// Check if this provider can serve the given asset
    fn supports_asset(&self, asset: &str) -> bool;

    /// Fetch raw bars for the request window; rows need not be normalized
    async fn fetch_bars(&self, request: &FetchRequest) -> AxResult<Vec<RawBar>>;

    /// Get provider name
    fn name(&self) -> &str;

    /// Get provider configuration
    fn config(&self) -> serde_json::Value;
}

/// CSV data provider reading files in the canonical column layout
#[derive(Debug)]
pub struct CsvDataProvider {
    pub name: String,
    pub data_directory: PathBuf,
    pub file_pattern: String,
}

#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(alias = "Date", alias = "date")]
    timestamp: String,
    #[serde(alias = "Open", alias = "open")]
    open: f64,
    #[serde(alias = "High", alias = "high")]
    high: f64,
    #[serde(alias = "Low", alias = "low")]
    low: f64,
    #[serde(alias = "Close", alias = "close")]
    close: f64,
    #[serde(alias = "Volume", alias = "volume")]
    volume: f64,
}

impl CsvDataProvider {
    pub fn new<P: AsRef<Path>>(data_directory: P) -> Self {
        Self {
            name: "CSV Provider".to_string(),
            data_directory: data_directory.as_ref().to_path_buf(),
            file_pattern: "{asset}_{interval}.csv".to_string(),
        }
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.file_pattern = pattern.to_string();
        self
    }

    fn get_file_path(&self, asset: &str, interval: Interval) -> PathBuf {
        let filename = self
            .file_pattern
            .replace("{asset}", asset)
            .replace("{interval}", interval.as_str());

        self.data_directory.join(filename)
    }

    fn parse_timestamp(raw: &str) -> AxResult<RawTimestamp> {
        if let Ok(aware) = DateTime::parse_from_rfc3339(raw) {
            return Ok(RawTimestamp::Aware(aware));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
            return Ok(RawTimestamp::Naive(naive));
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(RawTimestamp::Naive)
            .ok_or_else(|| {
                DataError::ParseError {
                    message: format!("Date parsing error: unrecognized timestamp '{}'", raw),
                }
                .into()
            })
    }
}

#[async_trait]
impl DataProvider for CsvDataProvider {
    fn supports_asset(&self, asset: &str) -> bool {
        Interval::ALL
            .iter()
            .any(|interval| self.get_file_path(&asset.to_uppercase(), *interval).exists())
    }

    async fn fetch_bars(&self, request: &FetchRequest) -> AxResult<Vec<RawBar>> {
        let file_path = self.get_file_path(&request.asset, request.interval);

        if !file_path.exists() {
            return Err(DataError::SourceNotFound(file_path.to_string_lossy().to_string()).into());
        }

        let file = std::fs::File::open(&file_path)?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

        let mut bars = Vec::new();
        for result in reader.deserialize() {
            let record: CsvRecord = result.map_err(|e| DataError::ParseError {
                message: format!("CSV parsing error: {}", e),
            })?;

            let timestamp = Self::parse_timestamp(&record.timestamp)?;
            let in_window = timestamp
                .to_naive()
                .map(|ts| request.contains(ts))
                .unwrap_or(false);

            if in_window {
                bars.push(RawBar::new(
                    timestamp,
                    record.open,
                    record.high,
                    record.low,
                    record.close,
                    record.volume,
                ));
            }
        }

        tracing::debug!("Read {} rows for {} from {}", bars.len(), request.asset, file_path.display());
        Ok(bars)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "csv",
            "directory": self.data_directory,
            "pattern": self.file_pattern
        })
    }
}

/// Deterministic synthetic prices for demos and tests
#[derive(Debug)]
pub struct SampleDataProvider {
    pub name: String,
}

impl SampleDataProvider {
    pub fn new() -> Self {
        Self {
            name: "Sample Data Provider".to_string(),
        }
    }

    fn starting_price(asset: &str) -> f64 {
        match asset {
            "BTC" => 45_000.0,
            "ETH" => 3_000.0,
            "SOL" => 100.0,
            "BNB" => 300.0,
            _ => 100.0,
        }
    }
}

impl Default for SampleDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataProvider for SampleDataProvider {
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

        let step = Duration::seconds(request.interval.to_seconds());
        let mut bars = Vec::new();
        let mut current = request.start;
        let mut price = Self::starting_price(&request.asset);
        let mut rng_state = 12345u64; // Simple PRNG

        while current <= request.end {
            rng_state = rng_state.wrapping_mul(1103515245).wrapping_add(12345);
            let random = ((rng_state >> 16) % 65536) as f64 / 65536.0 - 0.5;

            let new_price = price * (1.0 + random * 0.02);
            let high = price.max(new_price) * 1.01;
            let low = price.min(new_price) * 0.99;

            bars.push(RawBar::new(
                RawTimestamp::Naive(current),
                price,
                high,
                low,
                new_price,
                1_000.0,
            ));
            price = new_price;
            current += step;
        }

        Ok(bars)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({ "type": "sample" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_csv_provider_filters_window_and_keeps_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("BTC_1d.csv")).unwrap();
        writeln!(file, "Date,Open,High,Low,Close,Volume,Adj_Close").unwrap();
        writeln!(file, "2024-01-01,1,2,0.5,1.5,10,1.5").unwrap();
        writeln!(file, "2024-01-02T00:00:00+02:00,2,3,1.5,2.5,10,2.5").unwrap();
        writeln!(file, "2024-01-05 00:00:00,3,4,2.5,3.5,10,3.5").unwrap();
        drop(file);

        let provider = CsvDataProvider::new(dir.path());
        assert!(provider.supports_asset("btc"));
        assert!(!provider.supports_asset("ETH"));

        let request = FetchRequest::new("btc", Interval::Day, day(1), day(3));
        let bars = provider.fetch_bars(&request).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert!(matches!(bars[1].timestamp, RawTimestamp::Aware(_)));
        assert_eq!(bars[1].timestamp.to_naive().unwrap(), day(2));
    }

    #[tokio::test]
    async fn test_csv_provider_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CsvDataProvider::new(dir.path());
        let request = FetchRequest::new("BTC", Interval::Hour, day(1), day(2));
        assert!(provider.fetch_bars(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_sample_provider_is_deterministic() {
        let provider = SampleDataProvider::new();
        let request = FetchRequest::new("BTC", Interval::FourHour, day(1), day(2));
        let first = provider.fetch_bars(&request).await.unwrap();
        let second = provider.fetch_bars(&request).await.unwrap();
        assert_eq!(first, second);
        // 1 Jan 00:00 through 2 Jan 00:00 at 4h spacing
        assert_eq!(first.len(), 7);
        assert!(first.iter().all(|bar| bar.high >= bar.low));
    }
}
