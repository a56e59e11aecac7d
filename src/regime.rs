//! Market regime classification
//!
//! Labels every timestamp with the trend of a reference instrument (BTC for
//! crypto universes, an index for equities). The classification at `t` is a
//! function of reference bars at or before `t` only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{check_non_negative, check_window, ConfigError};
use crate::data::BarSeries;
use crate::indicators::{ema, pct_change, sma};
use crate::{Market, Regime};

/// Trend measure computed on the reference closes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrendMethod {
    /// Percent spread of the fast SMA over the slow SMA
    MaSpread { fast: usize, slow: usize },
    /// Same spread on exponential averages; reacts faster to turns
    EmaSpread { fast: usize, slow: usize },
    /// Percent change over the trailing window
    Momentum { lookback: usize },
}

impl Default for TrendMethod {
    fn default() -> Self {
        TrendMethod::MaSpread { fast: 20, slow: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub method: TrendMethod,
    /// Symmetric band around zero, in percent (default: 2.0)
    pub threshold_pct: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            method: TrendMethod::default(),
            threshold_pct: 2.0,
        }
    }
}

impl RegimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("regime.threshold_pct", self.threshold_pct)?;
        match self.method {
            TrendMethod::MaSpread { fast, slow } | TrendMethod::EmaSpread { fast, slow } => {
                check_window("regime.method.fast", fast, 1)?;
                if slow <= fast {
                    return Err(ConfigError::Inconsistent(format!(
                        "regime.method.slow ({}) must be greater than fast ({})",
                        slow, fast
                    )));
                }
            }
            TrendMethod::Momentum { lookback } => {
                check_window("regime.method.lookback", lookback, 1)?;
            }
        }
        Ok(())
    }

    /// Trend value per close; `None` while history is insufficient
    fn trend_values(&self, closes: &[f64]) -> Vec<Option<f64>> {
        match self.method {
            TrendMethod::MaSpread { fast, slow } => spread(&sma(closes, fast), &sma(closes, slow)),
            TrendMethod::EmaSpread { fast, slow } => spread(&ema(closes, fast), &ema(closes, slow)),
            TrendMethod::Momentum { lookback } => (0..closes.len())
                .map(|i| pct_change(closes, i, lookback))
                .collect(),
        }
    }

    fn bucket(&self, value: Option<f64>) -> Regime {
        match value {
            Some(v) if v > self.threshold_pct => Regime::Up,
            Some(v) if v < -self.threshold_pct => Regime::Down,
            _ => Regime::Sideways,
        }
    }
}

/// Percent spread of `fast` over `slow`, bar by bar
fn spread(fast: &[Option<f64>], slow: &[Option<f64>]) -> Vec<Option<f64>> {
    fast.iter()
        .zip(slow)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) if *s > 0.0 => Some((f - s) / s * 100.0),
            _ => None,
        })
        .collect()
}

/// Classify the reference trend at `at` from history up to `at`
///
/// Before the first reference bar, or while the trend measure is still
/// warming up, the regime is `Sideways`.
pub fn classify(config: &RegimeConfig, reference: &BarSeries, at: DateTime<Utc>) -> Regime {
    let Some(end) = reference.index_at_or_before(at) else {
        return Regime::Sideways;
    };
    let closes: Vec<f64> = reference.candles()[..=end].iter().map(|c| c.close).collect();
    let value = config.trend_values(&closes).last().copied().flatten();
    config.bucket(value)
}

/// Precomputed regimes for every reference bar
///
/// Shared read-only across workers; built once before fan-out.
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    market: Market,
    timestamps: Vec<DateTime<Utc>>,
    regimes: Vec<Regime>,
}

impl RegimeClassifier {
    pub fn new(config: &RegimeConfig, reference: &BarSeries, market: Market) -> Self {
        let closes = reference.closes();
        let regimes: Vec<Regime> = config
            .trend_values(&closes)
            .into_iter()
            .map(|v| config.bucket(v))
            .collect();

        debug!(
            "Regime classifier: {} reference bars, {} up / {} down",
            regimes.len(),
            regimes.iter().filter(|r| **r == Regime::Up).count(),
            regimes.iter().filter(|r| **r == Regime::Down).count()
        );

        Self {
            market,
            timestamps: reference.candles().iter().map(|c| c.datetime).collect(),
            regimes,
        }
    }

    /// Classifier for a run without a reference series
    pub fn unavailable(market: Market) -> Self {
        warn!("No reference series; every trade is labelled SIDEWAYS");
        Self {
            market,
            timestamps: Vec::new(),
            regimes: Vec::new(),
        }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    /// Regime of the last reference bar at or before `at`
    pub fn classify_at(&self, at: DateTime<Utc>) -> Regime {
        let after = self.timestamps.partition_point(|ts| *ts <= at);
        after
            .checked_sub(1)
            .and_then(|i| self.regimes.get(i).copied())
            .unwrap_or(Regime::Sideways)
    }

    pub fn label_at(&self, at: DateTime<Utc>) -> &'static str {
        self.classify_at(at).label(self.market)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Candle, Symbol};
    use chrono::{Duration, TimeZone};

    fn reference(closes: &[f64]) -> BarSeries {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                datetime: start + Duration::days(i as i64),
                open: c,
                high: c * 1.01,
                low: c * 0.99,
                close: c,
                volume: 1.0,
            })
            .collect();
        BarSeries::new(Symbol::new("BTCUSDT"), candles).unwrap()
    }

    fn momentum(lookback: usize) -> RegimeConfig {
        RegimeConfig {
            method: TrendMethod::Momentum { lookback },
            threshold_pct: 2.0,
        }
    }

    #[test]
    fn test_buckets() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let series = reference(&closes);
        let classifier = RegimeClassifier::new(&momentum(10), &series, Market::Crypto);
        let last = series.last_timestamp().unwrap();
        assert_eq!(classifier.classify_at(last), Regime::Up);
        assert_eq!(classifier.label_at(last), "BTC_UP");

        let falling: Vec<f64> = closes.iter().rev().copied().collect();
        let series = reference(&falling);
        let classifier = RegimeClassifier::new(&momentum(10), &series, Market::Equity);
        assert_eq!(classifier.label_at(series.last_timestamp().unwrap()), "TREND_DOWN");
    }

    #[test]
    fn test_warmup_is_sideways() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + 5.0 * i as f64).collect();
        let series = reference(&closes);
        let config = RegimeConfig::default();
        let classifier = RegimeClassifier::new(&config, &series, Market::Crypto);
        assert_eq!(
            classifier.classify_at(series.last_timestamp().unwrap()),
            Regime::Sideways
        );
        let before = series.first_timestamp().unwrap() - Duration::days(1);
        assert_eq!(classifier.classify_at(before), Regime::Sideways);
    }

    #[test]
    fn test_unavailable_is_sideways() {
        let classifier = RegimeClassifier::unavailable(Market::Crypto);
        assert_eq!(classifier.classify_at(Utc::now()), Regime::Sideways);
    }

    #[test]
    fn test_precomputed_matches_truncated_history() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + 15.0 * ((i as f64) / 9.0).sin() + i as f64 * 0.2)
            .collect();
        let series = reference(&closes);
        let config = RegimeConfig {
            method: TrendMethod::MaSpread { fast: 5, slow: 20 },
            threshold_pct: 1.0,
        };
        let classifier = RegimeClassifier::new(&config, &series, Market::Crypto);

        for candle in series.candles() {
            let truncated = series.truncated_at(candle.datetime).unwrap();
            assert_eq!(
                classifier.classify_at(candle.datetime),
                classify(&config, &truncated, candle.datetime)
            );
        }
    }

    #[test]
    fn test_ema_spread() {
        let config = RegimeConfig {
            method: TrendMethod::EmaSpread { fast: 5, slow: 20 },
            threshold_pct: 1.0,
        };
        let mut closes: Vec<f64> = (0..60).map(|i| 100.0 + 2.0 * i as f64).collect();
        closes.extend((0..40).map(|i| 218.0 - 4.0 * i as f64));
        let series = reference(&closes);
        let classifier = RegimeClassifier::new(&config, &series, Market::Crypto);

        assert_eq!(classifier.classify_at(series.candles()[59].datetime), Regime::Up);
        assert_eq!(classifier.classify_at(series.last_timestamp().unwrap()), Regime::Down);
        for candle in series.candles() {
            let truncated = series.truncated_at(candle.datetime).unwrap();
            assert_eq!(
                classifier.classify_at(candle.datetime),
                classify(&config, &truncated, candle.datetime)
            );
        }
    }

    #[test]
    fn test_between_bars_uses_previous() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let series = reference(&closes);
        let classifier = RegimeClassifier::new(&momentum(10), &series, Market::Crypto);
        let t = series.candles()[15].datetime + Duration::hours(12);
        assert_eq!(classifier.classify_at(t), classify(&momentum(10), &series, t));
    }

    #[test]
    fn test_validate() {
        assert!(RegimeConfig::default().validate().is_ok());
        let bad = RegimeConfig {
            method: TrendMethod::MaSpread { fast: 50, slow: 20 },
            threshold_pct: 2.0,
        };
        assert!(bad.validate().is_err());
        assert!(momentum(0).validate().is_err());
    }
}
