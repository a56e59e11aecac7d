//! Configuration management
//!
//! Handles loading and parsing of the JSON run configuration, environment
//! overrides, and fail-fast validation. A configuration that does not
//! validate never reaches the scanner.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::pattern::DetectorConfig;
use crate::regime::RegimeConfig;
use crate::{Market, Symbol, Timeframe};

/// Invalid run parameters, rejected before any scanning starts
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be >= 0, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be > 0, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be finite, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} must be at least {min}, got {value}")]
    WindowTooSmall {
        field: &'static str,
        value: usize,
        min: usize,
    },

    #[error("{0}")]
    Inconsistent(String),
}

pub(crate) fn check_finite(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotFinite { field, value })
    }
}

pub(crate) fn check_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_finite(field, value)?;
    if value < 0.0 {
        return Err(ConfigError::Negative { field, value });
    }
    Ok(())
}

pub(crate) fn check_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    check_finite(field, value)?;
    if value <= 0.0 {
        return Err(ConfigError::NotPositive { field, value });
    }
    Ok(())
}

pub(crate) fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ConfigError> {
    check_finite(field, value)?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

pub(crate) fn check_window(field: &'static str, value: usize, min: usize) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::WindowTooSmall { field, value, min });
    }
    Ok(())
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from JSON file
    ///
    /// `VCP_DATA_DIR` and `VCP_RESULTS_DIR` override the file values. The
    /// result is validated before it is returned.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(data_dir) = std::env::var("VCP_DATA_DIR") {
            config.scan.data_dir = data_dir;
        }
        if let Ok(results_dir) = std::env::var("VCP_RESULTS_DIR") {
            config.output.results_dir = results_dir;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.validate()?;
        self.detector.validate()?;
        self.regime.validate()?;
        self.backtest.validate()?;
        Ok(())
    }
}

/// Universe and data-source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub data_dir: String,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    /// Venue tag copied into every signal
    pub exchange: String,
    pub market: Market,
    /// Instrument whose trend defines the market regime
    pub reference_symbol: Option<String>,
    /// JSON map of symbol -> externally computed win probability (0-100)
    pub ml_scores_path: Option<String>,
    /// Worker threads; the global pool (one per core) when unset
    pub workers: Option<usize>,
    /// Stop starting new symbols after this many seconds
    pub deadline_secs: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            data_dir: "data".to_string(),
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
                "BNBUSDT".to_string(),
                "XRPUSDT".to_string(),
            ],
            timeframe: Timeframe::Daily,
            exchange: "BINANCE".to_string(),
            market: Market::Crypto,
            reference_symbol: Some("BTCUSDT".to_string()),
            ml_scores_path: None,
            workers: None,
            deadline_secs: None,
        }
    }
}

impl ScanConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }

    pub fn reference(&self) -> Option<Symbol> {
        self.reference_symbol.as_ref().map(Symbol::new)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(workers) = self.workers {
            check_window("scan.workers", workers, 1)?;
        }
        Ok(())
    }
}

/// Which signal types open simulated positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryTrigger {
    /// Enter on BREAKOUT signals at the pivot
    #[default]
    Breakout,
    /// Enter on APPROACHING signals once a later bar breaks out
    Approaching,
    /// Both; a breakout supersedes approaching signals of the same pattern
    Any,
}

/// How the initial stop is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossType {
    /// `stop_loss_value` percent below the entry fill
    #[default]
    FixedPct,
    /// `stop_loss_value` percent below the final contraction low
    StructuralLow,
}

/// Resolution when a single bar touches both the stop and the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Assume the worse outcome happened first
    #[default]
    StopFirst,
    TargetFirst,
}

/// Whether the trade-return Sharpe ratio is annualized
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SharpeMode {
    #[default]
    Raw,
    Annualized { periods_per_year: f64 },
}

/// Backtest run parameters
///
/// All `*_pct` fields and `stop_loss_value` are in percent units: `9.0`
/// means nine percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub entry_trigger: EntryTrigger,
    pub stop_loss_type: StopLossType,
    pub stop_loss_value: f64,
    pub take_profit_pct: f64,
    /// 0 or unset disables the trailing stop
    pub trailing_stop_pct: Option<f64>,
    pub commission_pct: f64,
    pub slippage_pct: f64,
    /// Close at the bar's close after this many bars in the trade
    pub max_holding_bars: Option<usize>,
    /// Bars an APPROACHING signal may wait for its breakout
    pub confirmation_bars: usize,
    pub tie_break: TieBreak,
    /// Notional allocated to every simulated position
    pub trade_notional: f64,
    /// Equity base for the drawdown curve
    pub starting_equity: f64,
    pub sharpe_mode: SharpeMode,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            entry_trigger: EntryTrigger::Breakout,
            stop_loss_type: StopLossType::FixedPct,
            stop_loss_value: 5.0,
            take_profit_pct: 15.0,
            trailing_stop_pct: None,
            commission_pct: 0.1,
            slippage_pct: 0.05,
            max_holding_bars: Some(30),
            confirmation_bars: 5,
            tie_break: TieBreak::StopFirst,
            trade_notional: 1_000.0,
            starting_equity: 10_000.0,
            sharpe_mode: SharpeMode::Raw,
        }
    }
}

impl BacktestConfig {
    pub fn with_entry_trigger(mut self, trigger: EntryTrigger) -> Self {
        self.entry_trigger = trigger;
        self
    }

    pub fn with_stop_loss(mut self, stop_type: StopLossType, value: f64) -> Self {
        self.stop_loss_type = stop_type;
        self.stop_loss_value = value;
        self
    }

    pub fn with_take_profit(mut self, pct: f64) -> Self {
        self.take_profit_pct = pct;
        self
    }

    pub fn with_trailing_stop(mut self, pct: Option<f64>) -> Self {
        self.trailing_stop_pct = pct;
        self
    }

    /// Set commission and slippage together
    pub fn with_costs(mut self, commission_pct: f64, slippage_pct: f64) -> Self {
        self.commission_pct = commission_pct;
        self.slippage_pct = slippage_pct;
        self
    }

    pub fn with_max_holding_bars(mut self, bars: Option<usize>) -> Self {
        self.max_holding_bars = bars;
        self
    }

    pub fn with_confirmation_bars(mut self, bars: usize) -> Self {
        self.confirmation_bars = bars;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_sharpe_mode(mut self, mode: SharpeMode) -> Self {
        self.sharpe_mode = mode;
        self
    }

    /// Trailing distance as a fraction, `None` when disabled
    pub fn trailing_fraction(&self) -> Option<f64> {
        self.trailing_stop_pct
            .filter(|pct| *pct > 0.0)
            .map(|pct| pct / 100.0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("backtest.stop_loss_value", self.stop_loss_value)?;
        if self.stop_loss_value >= 100.0 {
            return Err(ConfigError::OutOfRange {
                field: "backtest.stop_loss_value",
                value: self.stop_loss_value,
                min: 0.0,
                max: 100.0,
            });
        }
        check_positive("backtest.take_profit_pct", self.take_profit_pct)?;
        if let Some(trailing) = self.trailing_stop_pct {
            check_range("backtest.trailing_stop_pct", trailing, 0.0, 99.0)?;
        }
        check_range("backtest.commission_pct", self.commission_pct, 0.0, 10.0)?;
        check_range("backtest.slippage_pct", self.slippage_pct, 0.0, 10.0)?;
        if let Some(bars) = self.max_holding_bars {
            check_window("backtest.max_holding_bars", bars, 1)?;
        }
        check_window("backtest.confirmation_bars", self.confirmation_bars, 1)?;
        check_positive("backtest.trade_notional", self.trade_notional)?;
        check_positive("backtest.starting_equity", self.starting_equity)?;
        if let SharpeMode::Annualized { periods_per_year } = self.sharpe_mode {
            check_positive("backtest.sharpe_mode.periods_per_year", periods_per_year)?;
        }
        Ok(())
    }
}

/// Where the result bundle and live feed are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: String,
    pub live_signals_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            results_dir: "results".to_string(),
            live_signals_file: "live_signals.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_negative_stop_rejected() {
        let config = BacktestConfig::default().with_stop_loss(StopLossType::FixedPct, -5.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "backtest.stop_loss_value",
                ..
            })
        ));
    }

    #[test]
    fn test_full_stop_rejected() {
        let config = BacktestConfig::default().with_stop_loss(StopLossType::FixedPct, 100.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_commission_rejected() {
        let config = BacktestConfig::default().with_costs(-0.1, 0.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_nan_take_profit_rejected() {
        let config = BacktestConfig::default().with_take_profit(f64::NAN);
        assert!(matches!(config.validate(), Err(ConfigError::NotFinite { .. })));
    }

    #[test]
    fn test_zero_trailing_is_disabled() {
        let config = BacktestConfig::default().with_trailing_stop(Some(0.0));
        assert!(config.validate().is_ok());
        assert_eq!(config.trailing_fraction(), None);

        let config = BacktestConfig::default().with_trailing_stop(Some(8.0));
        assert_eq!(config.trailing_fraction(), Some(0.08));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "scan": { "symbols": ["AAPL"], "market": "equity", "reference_symbol": "SPY" },
            "backtest": { "take_profit_pct": 9.0, "sharpe_mode": { "mode": "annualized", "periods_per_year": 252 } }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.scan.symbols, vec!["AAPL".to_string()]);
        assert_eq!(config.scan.market, Market::Equity);
        assert_eq!(config.scan.data_dir, "data");
        assert_eq!(config.backtest.take_profit_pct, 9.0);
        assert_eq!(config.backtest.stop_loss_value, 5.0);
        assert_eq!(
            config.backtest.sharpe_mode,
            SharpeMode::Annualized {
                periods_per_year: 252.0
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.scan.workers = Some(0);
        assert!(config.validate().is_err());
    }
}
