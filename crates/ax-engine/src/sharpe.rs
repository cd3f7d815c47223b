use chrono::{NaiveDate, NaiveDateTime};

/// Annual risk-free rate used for the excess returns.
pub const RISK_FREE_ANNUAL: f64 = 0.01;
pub const TRADING_DAYS: f64 = 252.0;

/// Daily Sharpe ratio of a portfolio value series.
///
/// Values are resampled to the last sample of each calendar day, turned into
/// simple day-over-day returns and reduced against the daily equivalent of
/// the annual risk-free rate. The ratio is not annualized. `None` when fewer
/// than two daily returns exist or their variance is zero.
pub fn sharpe_ratio(samples: &[(NaiveDateTime, f64)]) -> Option<f64> {
    let daily = daily_closes(samples);
    let returns: Vec<f64> = daily
        .windows(2)
        .filter(|pair| pair[0] != 0.0)
        .map(|pair| pair[1] / pair[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let risk_free = (1.0 + RISK_FREE_ANNUAL).powf(1.0 / TRADING_DAYS) - 1.0;
    let excess: Vec<f64> = returns.iter().map(|r| r - risk_free).collect();
    let n = excess.len() as f64;
    let mean = excess.iter().sum::<f64>() / n;
    let variance = excess.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stdev = variance.sqrt();

    if !stdev.is_finite() || stdev <= f64::EPSILON {
        return None;
    }
    Some(mean / stdev)
}

fn daily_closes(samples: &[(NaiveDateTime, f64)]) -> Vec<f64> {
    let mut days: Vec<(NaiveDate, f64)> = Vec::new();
    for (time, value) in samples {
        let day = time.date();
        match days.last_mut() {
            Some((last, close)) if *last == day => *close = *value,
            _ => days.push((day, *value)),
        }
    }
    days.into_iter().map(|(_, value)| value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn series(values: &[f64], step: Duration) -> Vec<(NaiveDateTime, f64)> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + step * i as i32, *v))
            .collect()
    }

    #[test]
    fn test_too_few_returns() {
        assert_eq!(sharpe_ratio(&[]), None);
        assert_eq!(sharpe_ratio(&series(&[100.0, 101.0], Duration::days(1))), None);
    }

    #[test]
    fn test_flat_equity_has_no_variance() {
        let values = [100.0, 100.0, 100.0, 100.0];
        assert_eq!(sharpe_ratio(&series(&values, Duration::days(1))), None);
    }

    #[test]
    fn test_daily_values() {
        let values = [100.0, 102.0, 101.0, 104.0];
        let sharpe = sharpe_ratio(&series(&values, Duration::days(1))).unwrap();

        let rf = 1.01f64.powf(1.0 / 252.0) - 1.0;
        let returns = [0.02 - rf, 101.0 / 102.0 - 1.0 - rf, 104.0 / 101.0 - 1.0 - rf];
        let mean = returns.iter().sum::<f64>() / 3.0;
        let sd = (returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / 3.0).sqrt();
        assert!((sharpe - mean / sd).abs() < 1e-12);
    }

    #[test]
    fn test_intraday_samples_resample_to_daily_close() {
        // 12h bars: only the second sample of each day counts
        let values = [1.0, 100.0, 1.0, 102.0, 1.0, 101.0, 1.0, 104.0];
        let intraday = sharpe_ratio(&series(&values, Duration::hours(12))).unwrap();
        let daily = sharpe_ratio(&series(&[100.0, 102.0, 101.0, 104.0], Duration::days(1))).unwrap();
        assert!((intraday - daily).abs() < 1e-12);
    }
}
