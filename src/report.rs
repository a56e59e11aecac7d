//! Result bundle and live-signals feed
//!
//! The JSON shapes handed to the presentation layer. Field names here are a
//! contract with that layer; internal types convert into them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backtest::{BacktestResult, SkippedSymbol};
use crate::config::{BacktestConfig, EntryTrigger, StopLossType};
use crate::metrics::PerformanceSummary;
use crate::{ExitReason, Market, Signal, SignalType, Symbol, Timeframe, Trade};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBlock {
    pub total_trades: usize,
    pub win_rate: f64,
    pub profit_factor: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown_pct: f64,
    pub total_pnl_net: f64,
    pub total_fees: f64,
    pub avg_r_multiple: f64,
    pub max_consecutive_losses: usize,
}

impl From<&PerformanceSummary> for PerformanceBlock {
    fn from(s: &PerformanceSummary) -> Self {
        Self {
            total_trades: s.total_trades,
            win_rate: s.win_rate,
            profit_factor: s.profit_factor,
            sharpe_ratio: s.sharpe_ratio,
            max_drawdown_pct: s.max_drawdown_pct,
            total_pnl_net: s.total_pnl_net.to_f64(),
            total_fees: s.total_fees.to_f64(),
            avg_r_multiple: s.avg_r_multiple,
            max_consecutive_losses: s.max_consecutive_losses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradesSummary {
    pub winners: usize,
    pub losers: usize,
    pub gross_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBlock {
    pub entry_trigger: EntryTrigger,
    pub stop_loss_type: StopLossType,
    pub stop_loss_value: f64,
    pub take_profit_pct: f64,
    pub trailing_stop_pct: Option<f64>,
    pub commission_pct: f64,
    pub slippage_pct: f64,
}

impl From<&BacktestConfig> for ConfigBlock {
    fn from(c: &BacktestConfig) -> Self {
        Self {
            entry_trigger: c.entry_trigger,
            stop_loss_type: c.stop_loss_type,
            stop_loss_value: c.stop_loss_value,
            take_profit_pct: c.take_profit_pct,
            trailing_stop_pct: c.trailing_stop_pct,
            commission_pct: c.commission_pct,
            slippage_pct: c.slippage_pct,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeStats {
    pub trades: usize,
    pub win_rate: f64,
    pub avg_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub symbol: Symbol,
    pub entry_time: DateTime<Utc>,
    pub entry_type: SignalType,
    pub entry_price: f64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub return_pct: f64,
    pub r_multiple: f64,
    pub score: u8,
    /// Regime label, e.g. `BTC_UP`
    pub market_regime: String,
    pub is_winner: bool,
}

impl TradeRow {
    fn new(trade: &Trade, market: Market) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            entry_time: trade.entry_time,
            entry_type: trade.entry_type,
            entry_price: trade.entry_price,
            exit_price: trade.exit_price,
            exit_reason: trade.exit_reason,
            return_pct: trade.return_pct,
            r_multiple: trade.r_multiple,
            score: trade.score,
            market_regime: trade.market_regime.label(market).to_string(),
            is_winner: trade.is_winner,
        }
    }
}

/// One backtest run, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub performance: PerformanceBlock,
    pub trades_summary: TradesSummary,
    pub config: ConfigBlock,
    pub regime_breakdown: BTreeMap<String, RegimeStats>,
    pub trades: Vec<TradeRow>,
    pub skipped_symbols: Vec<SkippedSymbol>,
    pub generated_at: DateTime<Utc>,
}

impl ResultBundle {
    pub fn new(result: &BacktestResult, config: &BacktestConfig, market: Market) -> Self {
        let summary = &result.summary;
        let regime_breakdown = result
            .regime_breakdown
            .iter()
            .map(|(regime, s)| {
                (
                    regime.label(market).to_string(),
                    RegimeStats {
                        trades: s.total_trades,
                        win_rate: s.win_rate,
                        avg_pnl: s.avg_pnl,
                    },
                )
            })
            .collect();

        Self {
            performance: PerformanceBlock::from(summary),
            trades_summary: TradesSummary {
                winners: summary.winners,
                losers: summary.losers,
                gross_pnl: summary.gross_pnl.to_f64(),
            },
            config: ConfigBlock::from(config),
            regime_breakdown,
            trades: result.trades.iter().map(|t| TradeRow::new(t, market)).collect(),
            skipped_symbols: result.skipped.clone(),
            generated_at: Utc::now(),
        }
    }
}

/// Entry of the live-signals feed: a signal with no simulated outcome yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSignal {
    pub symbol: Symbol,
    pub exchange: String,
    pub signal_type: SignalType,
    pub score: u8,
    pub timeframe: Timeframe,
    pub pivot_high: f64,
    pub vol_ratio: f64,
    pub ml_win_prob: Option<u8>,
    pub created_at: DateTime<Utc>,
}

impl From<&Signal> for LiveSignal {
    fn from(s: &Signal) -> Self {
        Self {
            symbol: s.symbol.clone(),
            exchange: s.exchange.clone(),
            signal_type: s.signal_type,
            score: s.score,
            timeframe: s.timeframe,
            pivot_high: s.pivot_high,
            vol_ratio: s.volume_ratio,
            ml_win_prob: s.ml_win_prob,
            created_at: s.detected_at,
        }
    }
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Write `{results_dir}/backtest_<timestamp>.json`, returning its path
pub fn write_bundle(bundle: &ResultBundle, results_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let filename = format!(
        "backtest_{}.json",
        bundle.generated_at.format("%Y%m%d_%H%M%S")
    );
    let path = results_dir.as_ref().join(filename);
    write_json(bundle, &path)?;
    info!("Result bundle written to {}", path.display());
    Ok(path)
}

/// Overwrite the live-signals feed, highest score first
pub fn write_live_signals(signals: &[Signal], path: impl AsRef<Path>) -> Result<Vec<LiveSignal>> {
    let mut feed: Vec<LiveSignal> = signals.iter().map(LiveSignal::from).collect();
    feed.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    write_json(&feed, path.as_ref())?;
    info!("{} live signals written to {}", feed.len(), path.as_ref().display());
    Ok(feed)
}

pub fn read_bundle(path: impl AsRef<Path>) -> Result<ResultBundle> {
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).context("Failed to parse result bundle")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{aggregate_by_regime, MetricsOptions};
    use crate::Money;
    use chrono::TimeZone;

    fn summary() -> PerformanceSummary {
        PerformanceSummary {
            total_trades: 4,
            winners: 3,
            losers: 1,
            win_rate: 75.0,
            profit_factor: Some(2.345678901234567),
            sharpe_ratio: None,
            max_drawdown_pct: 1.2345678901234567,
            gross_pnl: Money::from_f64(130.25),
            total_pnl_net: Money::from_f64(120.5),
            total_fees: Money::from_f64(9.75),
            avg_pnl: 30.125,
            avg_r_multiple: 0.6180339887498949,
            max_consecutive_losses: 1,
        }
    }

    #[test]
    fn test_bundle_uses_regime_labels() {
        let result = BacktestResult {
            summary: summary(),
            regime_breakdown: aggregate_by_regime(&[], &MetricsOptions::default()),
            ..Default::default()
        };
        let bundle = ResultBundle::new(&result, &BacktestConfig::default(), Market::Equity);
        let keys: Vec<&str> = bundle.regime_breakdown.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["SIDEWAYS", "TREND_DOWN", "TREND_UP"]);
        assert_eq!(bundle.trades_summary.winners, 3);
        assert_eq!(bundle.trades_summary.gross_pnl, 130.25);
    }

    #[test]
    fn test_bundle_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let result = BacktestResult {
            summary: summary(),
            ..Default::default()
        };
        let bundle = ResultBundle::new(&result, &BacktestConfig::default(), Market::Crypto);
        let path = write_bundle(&bundle, dir.path().join("results")).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("backtest_"));

        let parsed = read_bundle(&path).unwrap();
        assert_eq!(parsed, bundle);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(json["performance"]["sharpe_ratio"].is_null());
        assert_eq!(json["config"]["entry_trigger"], "breakout");
        assert_eq!(json["config"]["stop_loss_type"], "fixed_pct");
    }

    #[test]
    fn test_live_feed_shape() {
        let signal = Signal {
            symbol: Symbol::new("SOLUSDT"),
            exchange: "BINANCE".to_string(),
            detected_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            signal_type: SignalType::Approaching,
            score: 64,
            pivot_high: 172.5,
            contraction_ratio: 0.31,
            volume_ratio: 0.9,
            ml_win_prob: None,
            timeframe: Timeframe::Daily,
            pattern_start: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
            contraction_low: 160.0,
            contractions: 3,
            close: 170.0,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_signals.json");
        write_live_signals(&[signal], &path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &json[0];
        assert_eq!(entry["signal_type"], "APPROACHING");
        assert_eq!(entry["timeframe"], "1d");
        assert_eq!(entry["vol_ratio"], 0.9);
        assert!(entry["ml_win_prob"].is_null());
        assert!(entry.get("contraction_low").is_none());
    }
}
