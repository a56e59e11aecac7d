//! Core data types used across the scanner and backtester
//!
//! Bars, signals, trades and the small enums that tag them. Every record here
//! is immutable once built; later stages create new records instead of
//! mutating earlier ones.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive and finite: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV bar for one fixed interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Validate the candle data
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume.is_nan() || self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Trading symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned into every signal and trade a worker produces, so the
/// clone has to stay O(1).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Bar interval of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[default]
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "1w")]
    Weekly,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Daily => "1d",
            Timeframe::Weekly => "1w",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1h" => Ok(Timeframe::Hour1),
            "4h" => Ok(Timeframe::Hour4),
            "1d" | "daily" => Ok(Timeframe::Daily),
            "1w" | "weekly" => Ok(Timeframe::Weekly),
            other => Err(format!("unknown timeframe '{}' (expected 1h, 4h, 1d or 1w)", other)),
        }
    }
}

/// Market the universe belongs to; decides the regime labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    #[default]
    Crypto,
    Equity,
}

/// Coarse market-trend classification of the reference instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Up,
    Down,
    Sideways,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::Up, Regime::Down, Regime::Sideways];

    /// Bucket label used in reports (`BTC_UP` for crypto, `TREND_UP` for equities)
    pub fn label(&self, market: Market) -> &'static str {
        match (market, self) {
            (Market::Crypto, Regime::Up) => "BTC_UP",
            (Market::Crypto, Regime::Down) => "BTC_DOWN",
            (Market::Equity, Regime::Up) => "TREND_UP",
            (Market::Equity, Regime::Down) => "TREND_DOWN",
            (_, Regime::Sideways) => "SIDEWAYS",
        }
    }
}

/// Kind of pattern detection event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// Close broke above the pivot on confirming volume
    Breakout,
    /// Close sits just under the pivot, no breakout yet
    Approaching,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            SignalType::Breakout => "BREAKOUT",
            SignalType::Approaching => "APPROACHING",
        })
    }
}

/// One pattern detection event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Symbol,
    pub exchange: String,
    pub detected_at: DateTime<Utc>,
    pub signal_type: SignalType,
    /// Quality score, 0-100
    pub score: u8,
    /// Resistance level the pattern compresses against
    pub pivot_high: f64,
    /// Latest pullback depth divided by the first one (smaller is tighter)
    pub contraction_ratio: f64,
    /// Detection-bar volume over the trailing average volume
    pub volume_ratio: f64,
    /// Externally supplied win probability, 0-100
    pub ml_win_prob: Option<u8>,
    pub timeframe: Timeframe,
    /// Timestamp of the left-side high that starts the pattern
    pub pattern_start: DateTime<Utc>,
    /// Low of the final contraction
    pub contraction_low: f64,
    pub contractions: usize,
    pub close: f64,
}

impl Signal {
    pub fn with_win_probability(mut self, probability: Option<u8>) -> Self {
        self.ml_win_prob = probability;
        self
    }
}

/// Why a simulated position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Target,
    Stop,
    TrailingStop,
    TimeExit,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Target => "TARGET",
            ExitReason::Stop => "STOP",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TimeExit => "TIME_EXIT",
        };
        f.write_str(s)
    }
}

/// Completed simulated position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub entry_type: SignalType,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub quantity: f64,
    pub initial_stop: f64,
    pub bars_held: usize,
    /// Net return on entry notional, in percent
    pub return_pct: f64,
    pub r_multiple: f64,
    pub gross_pnl: Money,
    pub fees: Money,
    pub net_pnl: Money,
    pub market_regime: Regime,
    pub score: u8,
    pub ml_win_prob: Option<u8>,
    pub is_winner: bool,
}

impl Trade {
    /// Dollar risk taken at entry (distance to the initial stop)
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.initial_stop) * self.quantity
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Monetary Values
// ============================================================================

/// Decimal money amount for PnL and fee accumulation.
///
/// Summing hundreds of f64 PnLs drifts; totals in the result bundle are
/// accumulated in `Decimal` and only converted to f64 for ratios.
///
/// ```
/// use vcp_scanner::Money;
/// let total: Money = [Money::from_f64(0.1), Money::from_f64(0.2)].into_iter().sum();
/// assert_eq!(total, Money::from_f64(0.3));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Non-finite inputs collapse to zero
    pub fn from_f64(value: f64) -> Self {
        Money(
            Decimal::try_from(value)
                .ok()
                .or_else(|| Decimal::from_f64_retain(value))
                .unwrap_or(Decimal::ZERO),
        )
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_candle_rejects_inverted_range() {
        let err = Candle::new(ts(), 100.0, 95.0, 105.0, 100.0, 10.0).unwrap_err();
        assert!(matches!(err, CandleValidationError::HighLessThanLow { .. }));
    }

    #[test]
    fn test_candle_rejects_nan_volume() {
        let err = Candle::new(ts(), 100.0, 105.0, 95.0, 100.0, f64::NAN).unwrap_err();
        assert!(matches!(err, CandleValidationError::NegativeVolume(_)));
    }

    #[test]
    fn test_candle_accepts_zero_volume() {
        assert!(Candle::new(ts(), 100.0, 105.0, 95.0, 100.0, 0.0).is_ok());
    }

    #[test]
    fn test_regime_labels() {
        assert_eq!(Regime::Up.label(Market::Crypto), "BTC_UP");
        assert_eq!(Regime::Down.label(Market::Equity), "TREND_DOWN");
        assert_eq!(Regime::Sideways.label(Market::Crypto), "SIDEWAYS");
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("1D".parse::<Timeframe>().unwrap(), Timeframe::Daily);
        assert_eq!("weekly".parse::<Timeframe>().unwrap(), Timeframe::Weekly);
        assert!("3m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_exit_reason_serializes_screaming_case() {
        let json = serde_json::to_string(&ExitReason::TrailingStop).unwrap();
        assert_eq!(json, "\"TRAILING_STOP\"");
    }

    #[test]
    fn test_money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        assert_eq!(a + b, Money::from_f64(0.3));
    }

    #[test]
    fn test_money_non_finite_is_zero() {
        assert_eq!(Money::from_f64(f64::NAN), Money::ZERO);
        assert_eq!(Money::from_f64(f64::INFINITY), Money::ZERO);
    }

    #[test]
    fn test_money_serde() {
        let money = Money::from_f64(123.456);
        let json = serde_json::to_string(&money).unwrap();
        let parsed: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(money, parsed);
    }
}
