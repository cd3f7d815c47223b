use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::run::{RunId, RunMetrics, StrategyId};

/// Leaderboard categories, each holding a single current leader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardCategory {
    Sharpe,
    Return,
    WinRate,
}

impl LeaderboardCategory {
    pub const ALL: [LeaderboardCategory; 3] = [
        LeaderboardCategory::Sharpe,
        LeaderboardCategory::Return,
        LeaderboardCategory::WinRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderboardCategory::Sharpe => "sharpe",
            LeaderboardCategory::Return => "return",
            LeaderboardCategory::WinRate => "win_rate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == value)
    }

    /// The metric this category ranks by.
    pub fn metric(&self, metrics: &RunMetrics) -> f64 {
        match self {
            LeaderboardCategory::Sharpe => metrics.sharpe_ratio,
            LeaderboardCategory::Return => metrics.return_pct,
            LeaderboardCategory::WinRate => metrics.win_rate_pct,
        }
    }
}

impl fmt::Display for LeaderboardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current leader of one category, with the metric snapshot it won with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub category: LeaderboardCategory,
    pub strategy_id: StrategyId,
    pub run_id: RunId,
    pub return_pct: f64,
    pub win_rate_pct: f64,
    pub sharpe_ratio: f64,
    pub updated_at: DateTime<Utc>,
}

impl LeaderboardEntry {
    pub fn from_run(
        category: LeaderboardCategory,
        run_id: RunId,
        strategy_id: StrategyId,
        metrics: &RunMetrics,
    ) -> Self {
        Self {
            category,
            strategy_id,
            run_id,
            return_pct: metrics.return_pct,
            win_rate_pct: metrics.win_rate_pct,
            sharpe_ratio: metrics.sharpe_ratio,
            updated_at: Utc::now(),
        }
    }

    pub fn metric(&self) -> f64 {
        match self.category {
            LeaderboardCategory::Sharpe => self.sharpe_ratio,
            LeaderboardCategory::Return => self.return_pct,
            LeaderboardCategory::WinRate => self.win_rate_pct,
        }
    }
}

/// A run replaces the incumbent only when its metric is strictly greater.
/// An empty category accepts any finite metric.
pub fn is_improvement(
    category: LeaderboardCategory,
    candidate: &RunMetrics,
    incumbent: Option<&LeaderboardEntry>,
) -> bool {
    let value = category.metric(candidate);
    if value.is_nan() {
        return false;
    }
    match incumbent {
        None => true,
        Some(entry) => value > entry.metric(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn metrics(sharpe: f64, ret: f64, win: f64) -> RunMetrics {
        RunMetrics {
            return_pct: ret,
            win_rate_pct: win,
            sharpe_ratio: sharpe,
            total_trades: 1,
            won_trades: 1,
            initial_value: 10_000.0,
            final_value: 10_000.0,
        }
    }

    #[test]
    fn test_empty_category_accepts_anything() {
        let m = metrics(-3.0, -50.0, 0.0);
        for category in LeaderboardCategory::ALL {
            assert!(is_improvement(category, &m, None));
        }
    }

    #[test]
    fn test_ties_keep_incumbent() {
        let incumbent = LeaderboardEntry::from_run(
            LeaderboardCategory::Sharpe,
            Uuid::new_v4(),
            Uuid::new_v4(),
            &metrics(1.2, 5.0, 50.0),
        );
        assert!(!is_improvement(LeaderboardCategory::Sharpe, &metrics(1.2, 0.0, 0.0), Some(&incumbent)));
        assert!(!is_improvement(LeaderboardCategory::Sharpe, &metrics(0.8, 0.0, 0.0), Some(&incumbent)));
        assert!(is_improvement(LeaderboardCategory::Sharpe, &metrics(1.3, 0.0, 0.0), Some(&incumbent)));
    }

    #[test]
    fn test_category_codes() {
        for category in LeaderboardCategory::ALL {
            assert_eq!(LeaderboardCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(LeaderboardCategory::WinRate.metric(&metrics(1.0, 2.0, 3.0)), 3.0);
    }
}
