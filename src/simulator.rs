//! Trade lifecycle simulation
//!
//! Replays one signal against the bars that follow it:
//! `PendingEntry -> Open -> Exited(reason)`. Bars are processed strictly in
//! order and an exit is never evaluated on the entry bar itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::{BacktestConfig, ConfigError, EntryTrigger, StopLossType, TieBreak};
use crate::data::BarSeries;
use crate::indicators::average_nonzero_volume;
use crate::pattern::BreakoutRule;
use crate::regime::RegimeClassifier;
use crate::{Candle, ExitReason, Money, Signal, SignalType, Trade};

/// Observable lifecycle state of a simulated position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    PendingEntry,
    Open,
    Exited(ExitReason),
}

/// Why a signal never became a position
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("{0:?} signals are not traded under the configured entry trigger")]
    NotTraded(SignalType),

    #[error("signal bar is not part of the series")]
    SignalBarMissing,

    #[error("stop {stop:.4} is not below entry {entry:.4}")]
    StopNotBelowEntry { stop: f64, entry: f64 },
}

#[derive(Debug, Clone)]
pub enum SimOutcome {
    /// Position opened and exited inside the available history
    Closed(Trade),
    /// Still open on the last bar; excluded from aggregation
    OpenAtEnd,
    /// History ended while an APPROACHING signal waited for its breakout
    Pending,
    /// APPROACHING signal whose breakout never came within the window
    Unconfirmed,
    Rejected(RejectReason),
}

/// Result of replaying one signal
#[derive(Debug, Clone)]
pub struct Simulation {
    pub outcome: SimOutcome,
    pub state: TradeState,
    /// Stop level at entry and after every bar the position stayed open
    pub stop_path: Vec<f64>,
}

impl Simulation {
    fn ended(outcome: SimOutcome, state: TradeState) -> Self {
        Self {
            outcome,
            state,
            stop_path: Vec::new(),
        }
    }

    /// No outcome yet: the signal is still actionable on the latest bar
    pub fn is_live(&self) -> bool {
        matches!(self.outcome, SimOutcome::OpenAtEnd | SimOutcome::Pending)
    }

    pub fn trade(&self) -> Option<&Trade> {
        match &self.outcome {
            SimOutcome::Closed(trade) => Some(trade),
            _ => None,
        }
    }

    pub fn into_trade(self) -> Option<Trade> {
        match self.outcome {
            SimOutcome::Closed(trade) => Some(trade),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Position {
    entry_index: usize,
    entry_price: f64,
    quantity: f64,
    initial_stop: f64,
    stop: f64,
    target: f64,
    peak: f64,
    trailed: bool,
}

enum Phase {
    Pending,
    Open(Position),
}

pub struct TradeSimulator {
    config: BacktestConfig,
    breakout: BreakoutRule,
}

impl TradeSimulator {
    /// `breakout` is the rule an APPROACHING signal must meet to enter
    pub fn new(config: BacktestConfig, breakout: BreakoutRule) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, breakout })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn trades(&self, signal_type: SignalType) -> bool {
        matches!(
            (self.config.entry_trigger, signal_type),
            (EntryTrigger::Any, _)
                | (EntryTrigger::Breakout, SignalType::Breakout)
                | (EntryTrigger::Approaching, SignalType::Approaching)
        )
    }

    fn slip(&self) -> f64 {
        self.config.slippage_pct / 100.0
    }

    /// Entry fill on bar `index`, if the signal enters there
    fn entry_fill(
        &self,
        signal: &Signal,
        candles: &[Candle],
        volumes: &[f64],
        signal_index: usize,
        index: usize,
    ) -> Option<f64> {
        let bar = &candles[index];
        match signal.signal_type {
            SignalType::Breakout => {
                (index == signal_index).then(|| signal.pivot_high * (1.0 + self.slip()))
            }
            SignalType::Approaching => {
                if index == signal_index {
                    return None;
                }
                let clears = bar.close > signal.pivot_high * (1.0 + self.breakout.margin_pct / 100.0);
                if !clears {
                    return None;
                }
                // Trailing window before `index` only
                let average =
                    average_nonzero_volume(volumes, index, self.breakout.volume_lookback)?;
                if bar.volume / average < self.breakout.volume_threshold {
                    return None;
                }
                Some(bar.open.max(signal.pivot_high) * (1.0 + self.slip()))
            }
        }
    }

    fn open_position(&self, signal: &Signal, index: usize, entry_price: f64) -> Result<Position, RejectReason> {
        let stop_fraction = self.config.stop_loss_value / 100.0;
        let stop = match self.config.stop_loss_type {
            StopLossType::FixedPct => entry_price * (1.0 - stop_fraction),
            StopLossType::StructuralLow => signal.contraction_low * (1.0 - stop_fraction),
        };
        if stop >= entry_price {
            return Err(RejectReason::StopNotBelowEntry {
                stop,
                entry: entry_price,
            });
        }

        Ok(Position {
            entry_index: index,
            entry_price,
            quantity: self.config.trade_notional / entry_price,
            initial_stop: stop,
            stop,
            target: entry_price * (1.0 + self.config.take_profit_pct / 100.0),
            peak: entry_price,
            trailed: false,
        })
    }

    /// Advance an open position through one bar; returns the exit level
    fn step(&self, position: &mut Position, bar: &Candle, index: usize) -> Option<(ExitReason, f64)> {
        let stop_hit = bar.low <= position.stop;
        let target_hit = bar.high >= position.target;
        let target_wins = target_hit && self.config.tie_break == TieBreak::TargetFirst;

        if stop_hit && !target_wins {
            let reason = if position.trailed {
                ExitReason::TrailingStop
            } else {
                ExitReason::Stop
            };
            return Some((reason, position.stop));
        }

        if let Some(trail) = self.config.trailing_fraction() {
            if bar.high > position.peak {
                position.peak = bar.high;
                let candidate = position.peak * (1.0 - trail);
                if candidate > position.stop {
                    position.stop = candidate;
                    position.trailed = true;
                }
            }
        }

        if target_hit {
            return Some((ExitReason::Target, position.target));
        }

        let held = index - position.entry_index;
        if self.config.max_holding_bars.is_some_and(|max| held >= max) {
            return Some((ExitReason::TimeExit, bar.close));
        }

        None
    }

    fn close_position(
        &self,
        signal: &Signal,
        position: &Position,
        candles: &[Candle],
        exit_index: usize,
        reason: ExitReason,
        level: f64,
        regimes: &RegimeClassifier,
    ) -> Trade {
        let entry_bar = &candles[position.entry_index];
        let exit_price = level * (1.0 - self.slip());
        let qty = position.quantity;

        let entry_notional = position.entry_price * qty;
        let exit_notional = exit_price * qty;
        let gross = (exit_price - position.entry_price) * qty;
        let fees = self.config.commission_pct / 100.0 * (entry_notional + exit_notional);
        let net = gross - fees;
        let risk = qty * (position.entry_price - position.initial_stop);

        let gross_pnl = Money::from_f64(gross).round_dp(8);
        let fees_money = Money::from_f64(fees).round_dp(8);

        Trade {
            symbol: signal.symbol.clone(),
            entry_type: signal.signal_type,
            entry_time: entry_bar.datetime,
            entry_price: position.entry_price,
            exit_time: candles[exit_index].datetime,
            exit_price,
            exit_reason: reason,
            quantity: qty,
            initial_stop: position.initial_stop,
            bars_held: exit_index - position.entry_index,
            return_pct: net / entry_notional * 100.0,
            r_multiple: if risk > 0.0 { net / risk } else { 0.0 },
            gross_pnl,
            fees: fees_money,
            net_pnl: gross_pnl - fees_money,
            market_regime: regimes.classify_at(entry_bar.datetime),
            score: signal.score,
            ml_win_prob: signal.ml_win_prob,
            is_winner: net > 0.0,
        }
    }

    /// Replay `signal` over `series`, which must be the signal's own series
    pub fn simulate(&self, signal: &Signal, series: &BarSeries, regimes: &RegimeClassifier) -> Simulation {
        if !self.trades(signal.signal_type) {
            return Simulation::ended(
                SimOutcome::Rejected(RejectReason::NotTraded(signal.signal_type)),
                TradeState::PendingEntry,
            );
        }
        self.replay(signal, series, regimes)
    }

    /// Like `simulate`, but ignores the entry trigger
    ///
    /// Used to tell whether an untraded signal is still live.
    pub fn replay(&self, signal: &Signal, series: &BarSeries, regimes: &RegimeClassifier) -> Simulation {
        let Some(signal_index) = series.index_of(signal.detected_at) else {
            return Simulation::ended(
                SimOutcome::Rejected(RejectReason::SignalBarMissing),
                TradeState::PendingEntry,
            );
        };

        let candles = series.candles();
        let entry_deadline = match signal.signal_type {
            SignalType::Breakout => signal_index,
            SignalType::Approaching => signal_index + self.config.confirmation_bars,
        };

        let volumes: Vec<f64> = match signal.signal_type {
            SignalType::Approaching => candles.iter().map(|c| c.volume).collect(),
            SignalType::Breakout => Vec::new(),
        };

        let mut phase = Phase::Pending;
        let mut stop_path = Vec::new();

        for index in signal_index..candles.len() {
            match &mut phase {
                Phase::Pending => {
                    if index > entry_deadline {
                        return Simulation {
                            outcome: SimOutcome::Unconfirmed,
                            state: TradeState::PendingEntry,
                            stop_path,
                        };
                    }
                    let Some(fill) = self.entry_fill(signal, candles, &volumes, signal_index, index) else {
                        continue;
                    };
                    match self.open_position(signal, index, fill) {
                        Ok(position) => {
                            debug!(
                                "{} {:?}: entry {:.4} stop {:.4} target {:.4}",
                                signal.symbol,
                                signal.signal_type,
                                position.entry_price,
                                position.stop,
                                position.target
                            );
                            stop_path.push(position.stop);
                            phase = Phase::Open(position);
                        }
                        Err(reason) => {
                            debug!("{}: signal rejected: {}", signal.symbol, reason);
                            return Simulation {
                                outcome: SimOutcome::Rejected(reason),
                                state: TradeState::PendingEntry,
                                stop_path,
                            };
                        }
                    }
                }
                Phase::Open(position) => {
                    if let Some((reason, level)) = self.step(position, &candles[index], index) {
                        let trade = self.close_position(
                            signal, position, candles, index, reason, level, regimes,
                        );
                        return Simulation {
                            outcome: SimOutcome::Closed(trade),
                            state: TradeState::Exited(reason),
                            stop_path,
                        };
                    }
                    stop_path.push(position.stop);
                }
            }
        }

        match phase {
            Phase::Pending => Simulation {
                outcome: SimOutcome::Pending,
                state: TradeState::PendingEntry,
                stop_path,
            },
            Phase::Open(_) => Simulation {
                outcome: SimOutcome::OpenAtEnd,
                state: TradeState::Open,
                stop_path,
            },
        }
    }
}
