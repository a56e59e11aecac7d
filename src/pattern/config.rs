//! Detector configuration
//!
//! Every threshold and weight of the detector lives here; the algorithm
//! itself hard-codes none of them.

use serde::{Deserialize, Serialize};

use crate::config::{
    check_non_negative, check_positive, check_range, check_window, ConfigError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Bars on each side a swing high/low must dominate (default: 3)
    pub swing_window: usize,

    /// Minimum pullbacks in the pattern (default: 2)
    pub min_contractions: usize,

    /// Each pullback depth must be <= previous depth times this (default: 0.85)
    pub tightening_factor: f64,

    /// Shortest anchor-to-detection span in bars (default: 15)
    pub min_span_bars: usize,

    /// Longest anchor-to-detection span in bars (default: 120)
    pub max_span_bars: usize,

    pub breakout: BreakoutRule,

    /// Close within this percent below the pivot counts as approaching (default: 3.0)
    pub approach_band_pct: f64,

    pub weights: ScoreWeights,

    /// Volume ratio at which the volume component maxes out (default: 2.5)
    pub volume_saturation: f64,

    /// Distance from pivot, in percent, at which proximity scores zero (default: 5.0)
    pub proximity_band_pct: f64,

    /// Signals scoring below this are dropped (default: 0)
    pub min_score: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            swing_window: 3,
            min_contractions: 2,
            tightening_factor: 0.85,
            min_span_bars: 15,
            max_span_bars: 120,
            breakout: BreakoutRule::default(),
            approach_band_pct: 3.0,
            weights: ScoreWeights::default(),
            volume_saturation: 2.5,
            proximity_band_pct: 5.0,
            min_score: 0,
        }
    }
}

/// Conditions a close must meet to count as a breakout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakoutRule {
    /// Close must clear the pivot by this percent (default: 0.5)
    pub margin_pct: f64,

    /// Minimum breakout volume over trailing average (default: 1.2)
    pub volume_threshold: f64,

    /// Bars in the trailing volume average (default: 20)
    pub volume_lookback: usize,
}

impl Default for BreakoutRule {
    fn default() -> Self {
        Self {
            margin_pct: 0.5,
            volume_threshold: 1.2,
            volume_lookback: 20,
        }
    }
}

/// Relative weights of the quality-score components
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub tightness: f64,
    pub volume: f64,
    pub proximity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            tightness: 0.4,
            volume: 0.35,
            proximity: 0.25,
        }
    }
}

impl ScoreWeights {
    fn total(&self) -> f64 {
        self.tightness + self.volume + self.proximity
    }

    /// Weighted mean of components already clipped to [0, 1], scaled to 0-100
    pub fn score(&self, tightness: f64, volume: f64, proximity: f64) -> u8 {
        let total = self.total();
        if total <= 0.0 {
            return 0;
        }
        let composite = (self.tightness * tightness.clamp(0.0, 1.0)
            + self.volume * volume.clamp(0.0, 1.0)
            + self.proximity * proximity.clamp(0.0, 1.0))
            / total;
        (composite * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

impl DetectorConfig {
    /// Bars needed before the first bar that could be evaluated
    pub fn min_history(&self) -> usize {
        self.min_span_bars + self.swing_window + 1
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_window("detector.swing_window", self.swing_window, 1)?;
        check_window("detector.min_contractions", self.min_contractions, 2)?;
        check_finite_fraction("detector.tightening_factor", self.tightening_factor)?;
        check_window(
            "detector.min_span_bars",
            self.min_span_bars,
            2 * self.swing_window + 1,
        )?;
        if self.max_span_bars < self.min_span_bars {
            return Err(ConfigError::Inconsistent(format!(
                "detector.max_span_bars ({}) must be >= min_span_bars ({})",
                self.max_span_bars, self.min_span_bars
            )));
        }

        check_non_negative("detector.breakout.margin_pct", self.breakout.margin_pct)?;
        check_positive(
            "detector.breakout.volume_threshold",
            self.breakout.volume_threshold,
        )?;
        check_window(
            "detector.breakout.volume_lookback",
            self.breakout.volume_lookback,
            1,
        )?;

        check_range("detector.approach_band_pct", self.approach_band_pct, 0.0, 50.0)?;
        check_non_negative("detector.weights.tightness", self.weights.tightness)?;
        check_non_negative("detector.weights.volume", self.weights.volume)?;
        check_non_negative("detector.weights.proximity", self.weights.proximity)?;
        if self.weights.total() <= 0.0 {
            return Err(ConfigError::Inconsistent(
                "detector.weights must not all be zero".to_string(),
            ));
        }
        check_positive("detector.volume_saturation", self.volume_saturation)?;
        if self.volume_saturation <= 1.0 {
            return Err(ConfigError::Inconsistent(format!(
                "detector.volume_saturation must be > 1, got {}",
                self.volume_saturation
            )));
        }
        check_positive("detector.proximity_band_pct", self.proximity_band_pct)?;
        if self.min_score > 100 {
            return Err(ConfigError::OutOfRange {
                field: "detector.min_score",
                value: self.min_score as f64,
                min: 0.0,
                max: 100.0,
            });
        }
        Ok(())
    }
}

/// Strictly inside (0, 1)
fn check_finite_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_positive(field, value)?;
    if value >= 1.0 {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}
