//! VCP detector
//!
//! Walks a bar series once, and at every bar looks back for a left-side high
//! followed by successively shallower pullbacks. Only swings confirmed at the
//! evaluation bar are used, so a signal at bar `t` depends on bars `..=t`.

use itertools::Itertools;
use ordered_float::OrderedFloat;
use tracing::debug;

use super::config::DetectorConfig;
use super::swing::{find_swings, zigzag, SwingKind, SwingPoint};
use crate::config::ConfigError;
use crate::data::BarSeries;
use crate::indicators::average_nonzero_volume;
use crate::{Candle, Signal, SignalType, Timeframe};

/// One pullback from a swing high to the following swing low
#[derive(Debug, Clone, Copy)]
struct Contraction {
    high: f64,
    low: f64,
}

impl Contraction {
    fn depth(&self) -> f64 {
        (self.high - self.low) / self.high
    }
}

/// Pattern structure found behind an evaluation bar
#[derive(Debug, Clone)]
struct Setup {
    anchor: usize,
    pivot: f64,
    contractions: Vec<Contraction>,
}

impl Setup {
    fn contraction_ratio(&self) -> f64 {
        match (self.contractions.first(), self.contractions.last()) {
            (Some(first), Some(last)) => last.depth() / first.depth(),
            _ => 1.0,
        }
    }

    fn contraction_low(&self) -> f64 {
        self.contractions.last().map(|c| c.low).unwrap_or(self.pivot)
    }
}

pub struct VcpDetector {
    config: DetectorConfig,
}

impl VcpDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn min_history(&self) -> usize {
        self.config.min_history()
    }

    /// Detect every BREAKOUT and APPROACHING event in the series
    ///
    /// Consecutive detections of the same pattern and type are merged into
    /// the highest-scoring one.
    pub fn detect(&self, series: &BarSeries, exchange: &str, timeframe: Timeframe) -> Vec<Signal> {
        let candles = series.candles();
        if candles.len() < self.min_history() {
            return Vec::new();
        }

        let swings = find_swings(candles, self.config.swing_window);
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let raw: Vec<Signal> = (self.min_history() - 1..candles.len())
            .filter_map(|t| {
                let setup = self.find_setup(candles, &swings, t)?;
                self.classify_bar(series, &setup, &volumes, t, exchange, timeframe)
            })
            .collect();

        let merged = merge_duplicates(raw);
        debug!("{}: {} signals", series.symbol(), merged.len());
        merged
    }

    fn find_setup(&self, candles: &[Candle], swings: &[SwingPoint], t: usize) -> Option<Setup> {
        let window = self.config.swing_window;
        let earliest = t.saturating_sub(self.config.max_span_bars);

        let usable: Vec<&SwingPoint> = swings
            .iter()
            .filter(|s| s.index >= earliest && s.index < t && s.confirmed_at(window) <= t)
            .collect();

        // Highest confirmed swing high; earliest wins ties
        let anchor = usable
            .iter()
            .filter(|s| s.kind == SwingKind::High)
            .rev()
            .max_by_key(|s| OrderedFloat(s.price))?;

        let span = t - anchor.index;
        if span < self.config.min_span_bars || span > self.config.max_span_bars {
            return None;
        }

        let pivot = anchor.price;
        let breached = candles[anchor.index + 1..t].iter().any(|c| c.high > pivot);
        if breached {
            return None;
        }

        let legs = zigzag(usable.iter().copied().filter(|s| s.index >= anchor.index));
        let contractions: Vec<Contraction> = legs
            .iter()
            .tuple_windows()
            .filter(|(h, l)| h.kind == SwingKind::High && l.kind == SwingKind::Low)
            .map(|(h, l)| Contraction {
                high: h.price,
                low: l.price,
            })
            .collect();

        if contractions.len() < self.config.min_contractions {
            return None;
        }
        if contractions.iter().any(|c| c.depth() <= 0.0) {
            return None;
        }
        let tightening = contractions.iter().tuple_windows().all(|(prev, next)| {
            next.depth() <= prev.depth() * self.config.tightening_factor
        });
        if !tightening {
            return None;
        }

        Some(Setup {
            anchor: anchor.index,
            pivot,
            contractions,
        })
    }

    fn classify_bar(
        &self,
        series: &BarSeries,
        setup: &Setup,
        volumes: &[f64],
        t: usize,
        exchange: &str,
        timeframe: Timeframe,
    ) -> Option<Signal> {
        let candles = series.candles();
        let bar = &candles[t];

        // Closing back under the last contraction low breaks the pattern
        if bar.close < setup.contraction_low() {
            return None;
        }

        let rule = &self.config.breakout;
        let average = average_nonzero_volume(volumes, t, rule.volume_lookback)?;
        let volume_ratio = bar.volume / average;

        let clears_pivot = bar.close > setup.pivot * (1.0 + rule.margin_pct / 100.0);
        let approach_floor = setup.pivot * (1.0 - self.config.approach_band_pct / 100.0);

        let signal_type = if clears_pivot && volume_ratio >= rule.volume_threshold {
            SignalType::Breakout
        } else if bar.close >= approach_floor && bar.close <= setup.pivot {
            SignalType::Approaching
        } else {
            return None;
        };

        let score = self.score(setup, bar.close, volume_ratio);
        if score < self.config.min_score {
            debug!(
                "{} {}: {:?} score {} below minimum",
                series.symbol(),
                bar.datetime,
                signal_type,
                score
            );
            return None;
        }

        Some(Signal {
            symbol: series.symbol().clone(),
            exchange: exchange.to_string(),
            detected_at: bar.datetime,
            signal_type,
            score,
            pivot_high: setup.pivot,
            contraction_ratio: setup.contraction_ratio(),
            volume_ratio,
            ml_win_prob: None,
            timeframe,
            pattern_start: candles[setup.anchor].datetime,
            contraction_low: setup.contraction_low(),
            contractions: setup.contractions.len(),
            close: bar.close,
        })
    }

    fn score(&self, setup: &Setup, close: f64, volume_ratio: f64) -> u8 {
        let tightness = 1.0 - setup.contraction_ratio();
        let volume = (volume_ratio - 1.0) / (self.config.volume_saturation - 1.0);
        let distance = (close - setup.pivot).abs() / setup.pivot;
        let proximity = 1.0 - distance / (self.config.proximity_band_pct / 100.0);
        self.config.weights.score(tightness, volume, proximity)
    }
}

/// Merge runs of detections of the same pattern and type
///
/// Each run collapses to its most recent detection carrying the run's
/// highest score, so a base still in the approach band on the last bar is
/// reported as of that bar.
pub fn merge_duplicates(signals: Vec<Signal>) -> Vec<Signal> {
    let runs = signals
        .into_iter()
        .chunk_by(|s| (s.pattern_start, s.signal_type));
    let merged: Vec<Signal> = runs
        .into_iter()
        .filter_map(|(_, run)| {
            run.reduce(|best, next| Signal {
                score: best.score.max(next.score),
                ..next
            })
        })
        .collect();
    merged
}

/// Drop APPROACHING signals whose pattern later produced a BREAKOUT
///
/// Used when both signal types are traded, so one pattern opens one position.
pub fn supersede_approaching(signals: Vec<Signal>) -> Vec<Signal> {
    let broken_out: Vec<_> = signals
        .iter()
        .filter(|s| s.signal_type == SignalType::Breakout)
        .map(|s| (s.symbol.clone(), s.pattern_start))
        .collect();

    signals
        .into_iter()
        .filter(|s| {
            s.signal_type == SignalType::Breakout
                || !broken_out
                    .iter()
                    .any(|(sym, start)| *sym == s.symbol && *start == s.pattern_start)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Symbol;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    /// Piecewise-linear closes: each leg moves to `target` over `bars` bars
    fn path(start: f64, legs: &[(usize, f64)]) -> Vec<f64> {
        let mut closes = vec![start];
        let mut last = start;
        for &(bars, target) in legs {
            for step in 1..=bars {
                closes.push(last + (target - last) * step as f64 / bars as f64);
            }
            last = target;
        }
        closes
    }

    fn series(closes: &[f64], volumes: &[f64]) -> BarSeries {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let candles = closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (&c, &v))| Candle {
                datetime: start + Duration::days(i as i64),
                open: c,
                high: c * 1.005,
                low: c * 0.995,
                close: c,
                volume: v,
            })
            .collect();
        BarSeries::new(Symbol::new("TEST"), candles).unwrap()
    }

    fn vcp_closes() -> Vec<f64> {
        path(
            60.0,
            &[
                (30, 100.0),
                (10, 85.0),
                (10, 98.0),
                (8, 91.0),
                (6, 97.0),
                (5, 94.0),
                (5, 99.0),
                (1, 103.0),
            ],
        )
    }

    fn vcp_series() -> BarSeries {
        let closes = vcp_closes();
        let mut volumes = vec![1000.0; closes.len()];
        if let Some(last) = volumes.last_mut() {
            *last = 3000.0;
        }
        series(&closes, &volumes)
    }

    fn detector() -> VcpDetector {
        VcpDetector::new(DetectorConfig::default()).unwrap()
    }

    #[test]
    fn test_detects_breakout() {
        let series = vcp_series();
        let signals = detector().detect(&series, "BINANCE", Timeframe::Daily);

        let breakout = signals
            .iter()
            .find(|s| s.signal_type == SignalType::Breakout)
            .expect("breakout signal");
        assert_eq!(breakout.detected_at, series.last_timestamp().unwrap());
        assert_relative_eq!(breakout.pivot_high, 100.5, epsilon = 1e-9);
        assert_eq!(breakout.contractions, 3);
        assert!(breakout.contraction_ratio < 0.5);
        assert_relative_eq!(breakout.volume_ratio, 3.0, epsilon = 1e-9);
        assert_eq!(breakout.pattern_start, series.candles()[30].datetime);
        assert_relative_eq!(breakout.contraction_low, 94.0 * 0.995, epsilon = 1e-9);
        assert!(breakout.score > 50);
    }

    #[test]
    fn test_approaching_merged_to_one_signal() {
        let signals = detector().detect(&vcp_series(), "BINANCE", Timeframe::Daily);
        let approaching: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.signal_type == SignalType::Approaching)
            .collect();
        assert_eq!(approaching.len(), 1);
        // Last bar of the run, which is also the closest to the pivot
        assert_relative_eq!(approaching[0].close, 99.0, epsilon = 1e-9);
        assert!(approaching[0].detected_at < signals.last().unwrap().detected_at);
    }

    #[test]
    fn test_no_breakout_without_volume() {
        let closes = vcp_closes();
        let volumes = vec![1000.0; closes.len()];
        let signals = detector().detect(&series(&closes, &volumes), "BINANCE", Timeframe::Daily);
        assert!(signals.iter().all(|s| s.signal_type != SignalType::Breakout));
    }

    #[test]
    fn test_zero_volume_history_is_skipped() {
        let closes = vcp_closes();
        let mut volumes = vec![0.0; closes.len()];
        if let Some(last) = volumes.last_mut() {
            *last = 3000.0;
        }
        let signals = detector().detect(&series(&closes, &volumes), "BINANCE", Timeframe::Daily);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_widening_pullbacks_rejected() {
        let closes = path(
            60.0,
            &[
                (30, 100.0),
                (6, 95.0),
                (6, 99.0),
                (8, 88.0),
                (8, 98.0),
                (1, 103.0),
            ],
        );
        let mut volumes = vec![1000.0; closes.len()];
        if let Some(last) = volumes.last_mut() {
            *last = 3000.0;
        }
        let signals = detector().detect(&series(&closes, &volumes), "BINANCE", Timeframe::Daily);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_flat_series_emits_nothing() {
        let closes = vec![50.0; 200];
        let volumes = vec![1000.0; 200];
        assert!(detector()
            .detect(&series(&closes, &volumes), "BINANCE", Timeframe::Daily)
            .is_empty());
    }

    #[test]
    fn test_short_series_emits_nothing() {
        let closes: Vec<f64> = vcp_closes().into_iter().take(18).collect();
        let volumes = vec![1000.0; closes.len()];
        assert!(closes.len() < detector().min_history());
        assert!(detector()
            .detect(&series(&closes, &volumes), "BINANCE", Timeframe::Daily)
            .is_empty());
    }

    #[test]
    fn test_detection_is_causal() {
        let full = vcp_series();
        let cutoff = full.candles()[full.len() - 2].datetime;
        let truncated = full.truncated_at(cutoff).unwrap();

        let d = detector();
        let early: Vec<Signal> = d
            .detect(&full, "BINANCE", Timeframe::Daily)
            .into_iter()
            .filter(|s| s.detected_at <= cutoff)
            .collect();
        let from_truncated = d.detect(&truncated, "BINANCE", Timeframe::Daily);
        assert_eq!(early, from_truncated);
    }

    #[test]
    fn test_min_score_filters() {
        let config = DetectorConfig {
            min_score: 100,
            ..Default::default()
        };
        let d = VcpDetector::new(config).unwrap();
        assert!(d.detect(&vcp_series(), "BINANCE", Timeframe::Daily).is_empty());
    }

    #[test]
    fn test_merged_run_reports_latest_bar() {
        // Base completes at close 99, then idles just under the pivot
        let mut closes: Vec<f64> = vcp_closes();
        closes.pop();
        let peak_bar = closes.len() - 1;
        closes.extend(std::iter::repeat(98.7).take(10));
        let volumes = vec![1000.0; closes.len()];
        let series = series(&closes, &volumes);

        let signals = detector().detect(&series, "BINANCE", Timeframe::Daily);
        assert_eq!(signals.len(), 1);
        let merged = &signals[0];
        assert_eq!(merged.signal_type, SignalType::Approaching);
        assert_eq!(merged.detected_at, series.last_timestamp().unwrap());
        assert_relative_eq!(merged.close, 98.7, epsilon = 1e-9);

        // Score is the best of the run, reached at the close nearest the pivot
        let early = series.truncated_at(series.candles()[peak_bar].datetime).unwrap();
        let best = detector().detect(&early, "BINANCE", Timeframe::Daily);
        assert_eq!(merged.score, best[0].score);
    }

    #[test]
    fn test_merge_keeps_highest_score() {
        let base = detector().detect(&vcp_series(), "BINANCE", Timeframe::Daily);
        let approaching = base
            .into_iter()
            .find(|s| s.signal_type == SignalType::Approaching)
            .unwrap();
        let later = Signal {
            detected_at: approaching.detected_at + Duration::days(1),
            score: approaching.score.saturating_sub(10),
            close: 98.0,
            ..approaching.clone()
        };

        let merged = merge_duplicates(vec![approaching.clone(), later.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].detected_at, later.detected_at);
        assert_relative_eq!(merged[0].close, 98.0);
        assert_eq!(merged[0].score, approaching.score);
    }

    #[test]
    fn test_supersede_approaching() {
        let signals = detector().detect(&vcp_series(), "BINANCE", Timeframe::Daily);
        assert_eq!(signals.len(), 2);
        let kept = supersede_approaching(signals);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].signal_type, SignalType::Breakout);
    }
}
