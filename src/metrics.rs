//! Performance aggregation
//!
//! Single-threaded reduction over completed trades. Every sequential
//! statistic (equity curve, drawdown, loss streaks) is computed on trades
//! ordered by exit time.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

use crate::config::{BacktestConfig, SharpeMode};
use crate::{Money, Regime, Trade};

/// Inputs of the aggregation that are not part of the trades
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsOptions {
    pub starting_equity: f64,
    pub sharpe_mode: SharpeMode,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        let config = BacktestConfig::default();
        Self::from(&config)
    }
}

impl From<&BacktestConfig> for MetricsOptions {
    fn from(config: &BacktestConfig) -> Self {
        Self {
            starting_equity: config.starting_equity,
            sharpe_mode: config.sharpe_mode,
        }
    }
}

/// Summary statistics of a trade set
///
/// `profit_factor` is `None` without losing trades and `sharpe_ratio` is
/// `None` with fewer than two trades or zero return variance; both
/// serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winners: usize,
    pub losers: usize,
    /// Percent of trades with positive net PnL
    pub win_rate: f64,
    pub profit_factor: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown_pct: f64,
    pub gross_pnl: Money,
    pub total_pnl_net: Money,
    pub total_fees: Money,
    pub avg_pnl: f64,
    pub avg_r_multiple: f64,
    pub max_consecutive_losses: usize,
}

/// Trades in causal order: exit time, then entry time, then symbol
pub fn sort_by_exit(trades: &mut [Trade]) {
    trades.sort_by(|a, b| {
        a.exit_time
            .cmp(&b.exit_time)
            .then(a.entry_time.cmp(&b.entry_time))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}

pub fn aggregate(trades: &[Trade], options: &MetricsOptions) -> PerformanceSummary {
    if trades.is_empty() {
        return PerformanceSummary::default();
    }

    let mut ordered = trades.to_vec();
    sort_by_exit(&mut ordered);

    let total_trades = ordered.len();
    let winners = ordered.iter().filter(|t| t.is_winner).count();
    let losers = total_trades - winners;

    let gross_pnl: Money = ordered.iter().map(|t| &t.gross_pnl).sum();
    let total_pnl_net: Money = ordered.iter().map(|t| &t.net_pnl).sum();
    let total_fees: Money = ordered.iter().map(|t| &t.fees).sum();

    let profits: Money = ordered
        .iter()
        .filter(|t| t.is_winner)
        .map(|t| t.net_pnl)
        .sum();
    let losses: Money = ordered
        .iter()
        .filter(|t| !t.is_winner)
        .map(|t| t.net_pnl.abs())
        .sum();
    let profit_factor = if losses.is_positive() {
        Some(profits.to_f64() / losses.to_f64())
    } else {
        None
    };

    PerformanceSummary {
        total_trades,
        winners,
        losers,
        win_rate: winners as f64 / total_trades as f64 * 100.0,
        profit_factor,
        sharpe_ratio: sharpe_ratio(&ordered, options.sharpe_mode),
        max_drawdown_pct: max_drawdown_pct(&ordered, options.starting_equity),
        gross_pnl,
        total_pnl_net,
        total_fees,
        avg_pnl: total_pnl_net.to_f64() / total_trades as f64,
        avg_r_multiple: ordered.iter().map(|t| t.r_multiple).sum::<f64>() / total_trades as f64,
        max_consecutive_losses: max_consecutive_losses(&ordered),
    }
}

/// One summary per regime, always containing all three buckets
pub fn aggregate_by_regime(
    trades: &[Trade],
    options: &MetricsOptions,
) -> BTreeMap<Regime, PerformanceSummary> {
    Regime::ALL
        .iter()
        .map(|regime| {
            let bucket: Vec<Trade> = trades
                .iter()
                .filter(|t| t.market_regime == *regime)
                .cloned()
                .collect();
            (*regime, aggregate(&bucket, options))
        })
        .collect()
}

/// Mean over sample standard deviation of per-trade return_pct
fn sharpe_ratio(ordered: &[Trade], mode: SharpeMode) -> Option<f64> {
    if ordered.len() < 2 {
        return None;
    }
    let returns: Vec<f64> = ordered.iter().map(|t| t.return_pct).collect();
    let mean = returns.iter().mean();
    let std_dev = returns.iter().std_dev();
    if !std_dev.is_finite() || std_dev <= f64::EPSILON {
        return None;
    }

    let raw = mean / std_dev;
    let scaled = match mode {
        SharpeMode::Raw => raw,
        SharpeMode::Annualized { periods_per_year } => raw * periods_per_year.sqrt(),
    };
    scaled.is_finite().then_some(scaled)
}

/// Largest peak-to-trough decline of `starting_equity + cumulative net PnL`
fn max_drawdown_pct(ordered: &[Trade], starting_equity: f64) -> f64 {
    let mut equity = Money::from_f64(starting_equity);
    let mut peak = equity;
    let mut max_dd = 0.0;

    for trade in ordered {
        equity += trade.net_pnl;
        if equity > peak {
            peak = equity;
        }
        let peak_f = peak.to_f64();
        if peak_f > 0.0 {
            let dd = (peak - equity).to_f64() / peak_f * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd
}

fn max_consecutive_losses(ordered: &[Trade]) -> usize {
    ordered
        .iter()
        .fold((0usize, 0usize), |(run, best), t| {
            if t.is_winner {
                (0, best)
            } else {
                (run + 1, best.max(run + 1))
            }
        })
        .1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExitReason, SignalType, Symbol};
    use approx::assert_relative_eq;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn day(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(i)
    }

    fn trade(exit_day: i64, net: f64, regime: Regime) -> Trade {
        let entry_price = 100.0;
        let quantity = 10.0;
        Trade {
            symbol: Symbol::new("TEST"),
            entry_type: SignalType::Breakout,
            entry_time: day(exit_day - 1),
            entry_price,
            exit_time: day(exit_day),
            exit_price: entry_price + net / quantity,
            exit_reason: if net > 0.0 {
                ExitReason::Target
            } else {
                ExitReason::Stop
            },
            quantity,
            initial_stop: 95.0,
            bars_held: 1,
            return_pct: net / 1_000.0 * 100.0,
            r_multiple: net / 50.0,
            gross_pnl: Money::from_f64(net),
            fees: Money::ZERO,
            net_pnl: Money::from_f64(net),
            market_regime: regime,
            score: 60,
            ml_win_prob: None,
            is_winner: net > 0.0,
        }
    }

    #[test]
    fn test_empty_trades() {
        let summary = aggregate(&[], &MetricsOptions::default());
        assert_eq!(summary.total_trades, 0);
        assert_eq!(summary.win_rate, 0.0);
        assert_eq!(summary.profit_factor, None);
        assert_eq!(summary.sharpe_ratio, None);
    }

    #[test]
    fn test_basic_statistics() {
        let trades = vec![
            trade(1, 90.0, Regime::Up),
            trade(2, -50.0, Regime::Up),
            trade(3, 40.0, Regime::Down),
            trade(4, -30.0, Regime::Sideways),
        ];
        let summary = aggregate(&trades, &MetricsOptions::default());

        assert_eq!(summary.total_trades, 4);
        assert_eq!(summary.winners, 2);
        assert_eq!(summary.losers, 2);
        assert_relative_eq!(summary.win_rate, 50.0);
        assert_relative_eq!(summary.profit_factor.unwrap(), 130.0 / 80.0);
        assert_eq!(summary.total_pnl_net, Money::from_f64(50.0));
        assert_relative_eq!(summary.avg_pnl, 12.5);
        assert_relative_eq!(summary.avg_r_multiple, 0.25, epsilon = 1e-12);
        assert_eq!(summary.max_consecutive_losses, 1);
    }

    #[test]
    fn test_sharpe_raw_and_annualized() {
        let trades = vec![
            trade(1, 100.0, Regime::Up),
            trade(2, -50.0, Regime::Up),
            trade(3, 100.0, Regime::Up),
        ];
        // returns 10, -5, 10: mean 5, sample std sqrt(75)
        let expected = 5.0 / 75.0_f64.sqrt();
        let raw = aggregate(&trades, &MetricsOptions::default());
        assert_relative_eq!(raw.sharpe_ratio.unwrap(), expected, epsilon = 1e-12);

        let options = MetricsOptions {
            sharpe_mode: SharpeMode::Annualized {
                periods_per_year: 252.0,
            },
            ..MetricsOptions::default()
        };
        let annual = aggregate(&trades, &options);
        assert_relative_eq!(
            annual.sharpe_ratio.unwrap(),
            expected * 252.0_f64.sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_degenerate_ratios_are_none() {
        let trades = vec![trade(1, 20.0, Regime::Up), trade(2, 20.0, Regime::Up)];
        let summary = aggregate(&trades, &MetricsOptions::default());
        assert_eq!(summary.profit_factor, None);
        assert_eq!(summary.sharpe_ratio, None);

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json["profit_factor"].is_null());
        assert!(json["sharpe_ratio"].is_null());
    }

    #[test]
    fn test_drawdown_uses_exit_order() {
        // Supplied out of order; by exit time the curve is 10000 -> 10100 -> 9900 -> 9950
        let trades = vec![
            trade(3, 50.0, Regime::Up),
            trade(1, 100.0, Regime::Up),
            trade(2, -200.0, Regime::Up),
        ];
        let summary = aggregate(&trades, &MetricsOptions::default());
        assert_relative_eq!(summary.max_drawdown_pct, 200.0 / 10_100.0 * 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_consecutive_losses_in_exit_order() {
        let trades = vec![
            trade(4, 80.0, Regime::Up),
            trade(2, -10.0, Regime::Up),
            trade(1, -10.0, Regime::Up),
            trade(3, -10.0, Regime::Up),
        ];
        assert_eq!(
            aggregate(&trades, &MetricsOptions::default()).max_consecutive_losses,
            3
        );
    }

    #[test]
    fn test_regime_breakdown_has_all_buckets() {
        let trades = vec![trade(1, 10.0, Regime::Up), trade(2, -10.0, Regime::Up)];
        let breakdown = aggregate_by_regime(&trades, &MetricsOptions::default());
        assert_eq!(breakdown.len(), 3);
        assert_eq!(breakdown[&Regime::Up].total_trades, 2);
        assert_eq!(breakdown[&Regime::Down].total_trades, 0);
        assert_eq!(breakdown[&Regime::Sideways].total_trades, 0);
    }
}
