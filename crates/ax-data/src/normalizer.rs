use ax_types::{AxError, AxResult, DataError, Interval, PriceRow, PriceSeries, RawBar};
use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::SeriesCache;
use crate::providers::{DataProvider, FetchRequest};

/// Resolve optional request dates into an inclusive timestamp window.
///
/// A missing end defaults to `today`; a missing start reaches back by the
/// interval's default lookback from the end.
pub fn resolve_window(
    interval: Interval,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> AxResult<(NaiveDateTime, NaiveDateTime)> {
    let end = end.unwrap_or(today);
    let start = start.unwrap_or_else(|| end - Duration::days(interval.default_lookback_days()));

    if start > end {
        return Err(AxError::InvalidParameter {
            parameter: "start".to_string(),
            message: format!("start date {} is after end date {}", start, end),
        });
    }

    let start_ts = start
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ax_types::internal_error!("invalid start of day for {}", start))?;
    let end_ts = end
        .and_hms_milli_opt(23, 59, 59, 999)
        .ok_or_else(|| ax_types::internal_error!("invalid end of day for {}", end))?;
    Ok((start_ts, end_ts))
}

/// Turn provider rows into a canonical series: offsets stripped, rows sorted,
/// duplicate timestamps collapsed to their first occurrence.
pub fn normalize_rows(asset: &str, interval: Interval, raw: Vec<RawBar>) -> AxResult<PriceSeries> {
    let mut rows = Vec::with_capacity(raw.len());
    for bar in raw {
        let date = bar.timestamp.to_naive().ok_or_else(|| DataError::ParseError {
            message: format!("timestamp out of range: {:?}", bar.timestamp),
        })?;
        rows.push(PriceRow::new(date, bar.open, bar.high, bar.low, bar.close, bar.volume));
    }

    // Stable sort keeps the first of any duplicate ahead of the rest
    rows.sort_by_key(|row| row.date);
    rows.dedup_by_key(|row| row.date);

    PriceSeries::new(asset.to_uppercase(), interval, rows)
}

/// Fetches price history from one provider and normalizes it
#[derive(Debug, Clone)]
pub struct PriceNormalizer {
    provider: Arc<dyn DataProvider>,
    cache: Option<Arc<SeriesCache>>,
}

impl PriceNormalizer {
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        Self { provider, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<SeriesCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<SeriesCache>> {
        self.cache.as_ref()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Fetch `asset` bars at `interval` between two calendar dates (inclusive).
    pub async fn fetch(
        &self,
        asset: &str,
        interval: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> AxResult<PriceSeries> {
        let interval = Interval::parse(interval)?;
        let (start_ts, end_ts) = resolve_window(interval, start, end, Utc::now().date_naive())?;
        let request = FetchRequest::new(asset, interval, start_ts, end_ts);

        if let Some(cache) = &self.cache {
            if let Some(series) = cache.get(&request) {
                debug!(asset = %request.asset, interval = %interval, "Serving series from cache");
                return Ok(series);
            }
        }

        info!(
            asset = %request.asset,
            interval = %interval,
            provider = self.provider.name(),
            "Fetching prices from {} to {}",
            start_ts,
            end_ts
        );

        let raw = self.provider.fetch_bars(&request).await?;
        let series = normalize_rows(&request.asset, interval, raw)?;

        if series.is_empty() {
            return Err(DataError::Unavailable {
                asset: request.asset.clone(),
                start: start_ts.to_string(),
                end: end_ts.to_string(),
            }
            .into());
        }

        if let Some(cache) = &self.cache {
            cache.store(&request, &series);
        }

        info!(asset = %request.asset, interval = %interval, "Normalized {} rows", series.len());
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::SampleDataProvider;
    use async_trait::async_trait;
    use ax_types::{RawTimestamp, PRICE_COLUMNS};
    use chrono::{DateTime, NaiveTime};
    use parking_lot::Mutex;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Returns canned rows and counts calls.
    #[derive(Debug, Default)]
    struct CannedProvider {
        rows: Vec<RawBar>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl DataProvider for CannedProvider {
        fn supports_asset(&self, _asset: &str) -> bool {
            true
        }

        async fn fetch_bars(&self, _request: &FetchRequest) -> AxResult<Vec<RawBar>> {
            *self.calls.lock() += 1;
            Ok(self.rows.clone())
        }

        fn name(&self) -> &str {
            "canned"
        }

        fn config(&self) -> serde_json::Value {
            serde_json::json!({ "type": "canned" })
        }
    }

    fn raw(ts: RawTimestamp, close: f64) -> RawBar {
        RawBar::new(ts, close, close, close, close, 1.0)
    }

    #[test]
    fn test_resolve_window_defaults() {
        let today = date(2024, 6, 30);
        let (start, end) = resolve_window(Interval::Day, None, None, today).unwrap();
        assert_eq!(end.date(), today);
        assert_eq!((today - start.date()).num_days(), 700);
        assert_eq!(end.time(), NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap());

        let (start, _) = resolve_window(Interval::FifteenMinute, None, None, today).unwrap();
        assert_eq!((today - start.date()).num_days(), 100);

        let (start, _) = resolve_window(Interval::FourHour, None, Some(date(2024, 3, 31)), today).unwrap();
        assert_eq!(start.date(), date(2024, 3, 1));
    }

    #[test]
    fn test_resolve_window_rejects_inverted_range() {
        let err = resolve_window(Interval::Day, Some(date(2024, 2, 1)), Some(date(2024, 1, 1)), date(2024, 6, 1))
            .unwrap_err();
        assert!(matches!(err, AxError::InvalidParameter { .. }));
    }

    #[test]
    fn test_normalize_sorts_dedups_and_strips_offsets() {
        let aware = DateTime::parse_from_rfc3339("2024-01-02T00:00:00+03:00").unwrap();
        let rows = vec![
            raw(RawTimestamp::Aware(aware), 2.0),
            raw(RawTimestamp::EpochMillis(1_704_067_200_000), 1.0),
            raw(RawTimestamp::Aware(aware), 99.0),
        ];

        let series = normalize_rows("btc", Interval::Day, rows).unwrap();
        assert_eq!(series.asset, "BTC");
        assert_eq!(series.len(), 2);
        assert_eq!(series.rows()[0].close, 1.0);
        // First occurrence of the duplicated timestamp wins
        assert_eq!(series.rows()[1].close, 2.0);
        assert_eq!(series.rows()[1].date, date(2024, 1, 2).and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(series.columns(), &PRICE_COLUMNS);
        assert!(series.rows().windows(2).all(|w| w[0].date < w[1].date));
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_parameters_before_fetching() {
        let provider = Arc::new(CannedProvider::default());
        let normalizer = PriceNormalizer::new(provider.clone());

        assert!(matches!(
            normalizer.fetch("BTC", "2h", None, None).await,
            Err(AxError::InvalidParameter { .. })
        ));
        assert!(matches!(
            normalizer
                .fetch("BTC", "1d", Some(date(2024, 2, 1)), Some(date(2024, 1, 1)))
                .await,
            Err(AxError::InvalidParameter { .. })
        ));
        assert_eq!(*provider.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_fetch_empty_is_unavailable() {
        let normalizer = PriceNormalizer::new(Arc::new(CannedProvider::default()));
        let err = normalizer
            .fetch("BTC", "1d", Some(date(2024, 1, 1)), Some(date(2024, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AxError::Data(DataError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_fetch_single_day_window() {
        let normalizer = PriceNormalizer::new(Arc::new(SampleDataProvider::new()));
        let day = date(2024, 1, 1);
        let series = normalizer.fetch("BTC", "1h", Some(day), Some(day)).await.unwrap();
        assert_eq!(series.len(), 24);
        assert!(series.rows().iter().all(|row| row.date.date() == day));
    }

    #[tokio::test]
    async fn test_fetch_uses_cache() {
        let provider = Arc::new(CannedProvider {
            rows: vec![raw(RawTimestamp::EpochMillis(1_704_067_200_000), 1.0)],
            calls: Mutex::new(0),
        });
        let cache = Arc::new(SeriesCache::new());
        let normalizer = PriceNormalizer::new(provider.clone()).with_cache(cache.clone());

        let day = Some(date(2024, 1, 1));
        normalizer.fetch("BTC", "1d", day, day).await.unwrap();
        normalizer.fetch("BTC", "1d", day, day).await.unwrap();
        assert_eq!(*provider.calls.lock(), 1);
        assert_eq!(cache.get_stats().hits, 1);
    }
}
