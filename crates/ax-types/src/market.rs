use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{AxError, AxResult, DataError};

/// Column names of a normalized price series, in order.
pub const PRICE_COLUMNS: [&str; 7] = ["Date", "Open", "High", "Low", "Close", "Volume", "Adj_Close"];

/// Timestamp format used for every serialized bar time.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Bar intervals accepted by the price pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "5m")]
    FiveMinute,
    #[serde(rename = "15m")]
    FifteenMinute,
    #[serde(rename = "30m")]
    ThirtyMinute,
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "4h")]
    FourHour,
    #[serde(rename = "1d")]
    Day,
}

impl Interval {
    pub const ALL: [Interval; 6] = [
        Interval::FiveMinute,
        Interval::FifteenMinute,
        Interval::ThirtyMinute,
        Interval::Hour,
        Interval::FourHour,
        Interval::Day,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::FiveMinute => "5m",
            Interval::FifteenMinute => "15m",
            Interval::ThirtyMinute => "30m",
            Interval::Hour => "1h",
            Interval::FourHour => "4h",
            Interval::Day => "1d",
        }
    }

    /// Parse an interval code, rejecting anything outside the supported set.
    pub fn parse(code: &str) -> AxResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|interval| interval.as_str() == code)
            .ok_or_else(|| AxError::InvalidParameter {
                parameter: "interval".to_string(),
                message: format!(
                    "unsupported interval '{}', expected one of 5m, 15m, 30m, 1h, 4h, 1d",
                    code
                ),
            })
    }

    pub fn to_seconds(&self) -> i64 {
        match self {
            Interval::FiveMinute => 300,
            Interval::FifteenMinute => 900,
            Interval::ThirtyMinute => 1800,
            Interval::Hour => 3600,
            Interval::FourHour => 14400,
            Interval::Day => 86400,
        }
    }

    /// How far back a fetch reaches when the caller gives no start date.
    pub fn default_lookback_days(&self) -> i64 {
        match self {
            Interval::Day => 700,
            Interval::FiveMinute | Interval::FifteenMinute | Interval::ThirtyMinute => 100,
            Interval::Hour | Interval::FourHour => 30,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Interval {
    type Err = AxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::parse(s)
    }
}

/// One normalized OHLCV row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    #[serde(rename = "Date", with = "naive_time_format")]
    pub date: NaiveDateTime,
    #[serde(rename = "Open")]
    pub open: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "Close")]
    pub close: f64,
    #[serde(rename = "Volume")]
    pub volume: f64,
    #[serde(rename = "Adj_Close")]
    pub adj_close: f64,
}

impl PriceRow {
    pub fn new(date: NaiveDateTime, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
            adj_close: close,
        }
    }
}

/// Ordered, de-duplicated, timezone-naive price history of one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub asset: String,
    pub interval: Interval,
    rows: Vec<PriceRow>,
}

impl PriceSeries {
    /// Build a series, rejecting rows that are not strictly increasing in time.
    pub fn new(asset: impl Into<String>, interval: Interval, rows: Vec<PriceRow>) -> AxResult<Self> {
        if let Some(pair) = rows.windows(2).find(|pair| pair[0].date >= pair[1].date) {
            return Err(DataError::InvalidFormat {
                message: format!(
                    "timestamps must be strictly increasing: {} followed by {}",
                    pair[0].date, pair[1].date
                ),
            }
            .into());
        }

        Ok(Self {
            asset: asset.into(),
            interval,
            rows,
        })
    }

    pub fn columns(&self) -> &'static [&'static str] {
        &PRICE_COLUMNS
    }

    pub fn rows(&self) -> &[PriceRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&PriceRow> {
        self.rows.first()
    }

    pub fn last(&self) -> Option<&PriceRow> {
        self.rows.last()
    }

    pub fn into_rows(self) -> Vec<PriceRow> {
        self.rows
    }
}

/// Timestamp as delivered by a provider, before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawTimestamp {
    Naive(NaiveDateTime),
    Aware(DateTime<FixedOffset>),
    EpochMillis(i64),
}

impl RawTimestamp {
    /// Drop any offset information, keeping the wall-clock value.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        match self {
            RawTimestamp::Naive(ts) => Some(*ts),
            RawTimestamp::Aware(ts) => Some(ts.naive_local()),
            RawTimestamp::EpochMillis(ms) => {
                DateTime::from_timestamp_millis(*ms).map(|ts| ts.naive_utc())
            }
        }
    }
}

/// Provider row prior to normalization
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub timestamp: RawTimestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl RawBar {
    pub fn new(timestamp: RawTimestamp, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

/// Serde adapter for `TIME_FORMAT` timestamps.
pub mod naive_time_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIME_FORMAT;

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_interval_round_trip_codes() {
        for interval in Interval::ALL {
            assert_eq!(Interval::parse(interval.as_str()).unwrap(), interval);
            assert_eq!(interval.to_string(), interval.as_str());
        }
    }

    #[test]
    fn test_interval_rejects_unknown_code() {
        let err = Interval::parse("2h").unwrap_err();
        assert!(matches!(err, AxError::InvalidParameter { ref parameter, .. } if parameter == "interval"));
    }

    #[test]
    fn test_default_lookback() {
        assert_eq!(Interval::Day.default_lookback_days(), 700);
        assert_eq!(Interval::FiveMinute.default_lookback_days(), 100);
        assert_eq!(Interval::ThirtyMinute.default_lookback_days(), 100);
        assert_eq!(Interval::Hour.default_lookback_days(), 30);
        assert_eq!(Interval::FourHour.default_lookback_days(), 30);
    }

    #[test]
    fn test_series_rejects_unsorted_rows() {
        let rows = vec![
            PriceRow::new(at(2, 0), 1.0, 1.0, 1.0, 1.0, 1.0),
            PriceRow::new(at(1, 0), 1.0, 1.0, 1.0, 1.0, 1.0),
        ];
        assert!(PriceSeries::new("BTC", Interval::Day, rows).is_err());

        let duplicate = vec![
            PriceRow::new(at(1, 0), 1.0, 1.0, 1.0, 1.0, 1.0),
            PriceRow::new(at(1, 0), 2.0, 2.0, 2.0, 2.0, 2.0),
        ];
        assert!(PriceSeries::new("BTC", Interval::Day, duplicate).is_err());
    }

    #[test]
    fn test_adj_close_mirrors_close() {
        let row = PriceRow::new(at(1, 0), 1.0, 3.0, 0.5, 2.5, 10.0);
        assert_eq!(row.adj_close, 2.5);
    }

    #[test]
    fn test_aware_timestamp_is_stripped_not_converted() {
        let aware = DateTime::parse_from_rfc3339("2024-01-01T09:30:00+05:00").unwrap();
        let naive = RawTimestamp::Aware(aware).to_naive().unwrap();
        assert_eq!(naive, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn test_epoch_millis_timestamp() {
        let naive = RawTimestamp::EpochMillis(1_704_067_200_000).to_naive().unwrap();
        assert_eq!(naive, at(1, 0));
    }

    #[test]
    fn test_row_serializes_with_canonical_column_names() {
        let row = PriceRow::new(at(1, 0), 1.0, 2.0, 0.5, 1.5, 100.0);
        let json = serde_json::to_value(row).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        for column in PRICE_COLUMNS {
            assert!(keys.contains(&column), "missing {column}");
        }
        assert_eq!(json["Date"], "2024-01-01 00:00:00");
    }
}
