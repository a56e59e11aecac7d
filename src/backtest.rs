//! Backtest orchestration
//!
//! Bulk-loads the universe, builds the shared regime classifier once, fans
//! symbols out across a rayon pool, then merges per-symbol reports and runs
//! the single-threaded aggregation after the barrier.

use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EntryTrigger};
use crate::data::{BarProvider, BarSeries};
use crate::metrics::{aggregate, aggregate_by_regime, sort_by_exit, MetricsOptions, PerformanceSummary};
use crate::pattern::{supersede_approaching, VcpDetector};
use crate::regime::RegimeClassifier;
use crate::simulator::{SimOutcome, TradeSimulator};
use crate::{Config, Regime, Signal, Symbol, Timeframe, Trade};

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation checked before each symbol starts
///
/// Clones share the flag. A symbol already in progress always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also trips once `timeout` has elapsed from now
    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// =============================================================================
// Per-symbol records
// =============================================================================

/// Why a symbol produced no results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    NoData { message: String },
    InvalidSeries { message: String },
    InsufficientHistory { bars: usize, required: usize },
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoData { message } => write!(f, "no data: {}", message),
            SkipReason::InvalidSeries { message } => write!(f, "invalid series: {}", message),
            SkipReason::InsufficientHistory { bars, required } => {
                write!(f, "insufficient history: {} bars, need {}", bars, required)
            }
            SkipReason::Cancelled => write!(f, "cancelled before processing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSymbol {
    pub symbol: Symbol,
    pub reason: SkipReason,
}

/// Loaded series, ready for fan-out
#[derive(Debug, Clone, Default)]
pub struct Universe {
    pub series: Vec<BarSeries>,
    pub reference: Option<BarSeries>,
    /// Symbols that failed to load or validate
    pub skipped: Vec<SkippedSymbol>,
}

impl Universe {
    pub fn from_series(series: Vec<BarSeries>, reference: Option<BarSeries>) -> Self {
        Self {
            series,
            reference,
            skipped: Vec::new(),
        }
    }
}

/// Everything one worker produced for one symbol
#[derive(Debug, Clone, Default)]
pub struct SymbolReport {
    pub signals: Vec<Signal>,
    pub trades: Vec<Trade>,
    /// Signals with no outcome yet (open position or awaiting confirmation)
    pub live: Vec<Signal>,
    pub open_at_end: usize,
    pub unconfirmed: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BacktestResult {
    pub summary: PerformanceSummary,
    pub regime_breakdown: BTreeMap<Regime, PerformanceSummary>,
    /// Completed trades ordered by exit time
    pub trades: Vec<Trade>,
    pub signals: Vec<Signal>,
    pub live_signals: Vec<Signal>,
    pub skipped: Vec<SkippedSymbol>,
    pub symbols_processed: usize,
    pub open_at_end: usize,
    pub unconfirmed: usize,
    pub cancelled: bool,
}

/// Detection-only pass over the universe
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub signals: Vec<Signal>,
    pub live_signals: Vec<Signal>,
    pub skipped: Vec<SkippedSymbol>,
    pub symbols_processed: usize,
    pub cancelled: bool,
}

// =============================================================================
// Backtester
// =============================================================================

pub struct Backtester {
    config: Config,
    detector: VcpDetector,
    simulator: TradeSimulator,
    ml_scores: HashMap<Symbol, u8>,
    pool: Option<rayon::ThreadPool>,
    progress: Option<ProgressBar>,
}

impl Backtester {
    /// Validates the whole configuration before anything runs
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let detector = VcpDetector::new(config.detector.clone())?;
        let simulator = TradeSimulator::new(config.backtest.clone(), config.detector.breakout.clone())?;

        let pool = config.scan.workers.and_then(|workers| {
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("Failed to build {}-thread pool, using global pool: {}", workers, e);
                    None
                }
            }
        });

        Ok(Self {
            config,
            detector,
            simulator,
            ml_scores: HashMap::new(),
            pool,
            progress: None,
        })
    }

    pub fn with_ml_scores(mut self, scores: HashMap<Symbol, u8>) -> Self {
        self.ml_scores = scores;
        self
    }

    /// Ticked once per symbol processed
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Minimum bars a symbol needs to be scanned
    pub fn min_history(&self) -> usize {
        self.detector.min_history()
    }

    /// Read every configured symbol plus the reference series
    pub fn load(&self, provider: &dyn BarProvider) -> Universe {
        let timeframe = self.config.scan.timeframe;
        let symbols = self.config.scan.symbols();

        let loaded: Vec<(Symbol, Result<BarSeries, SkipReason>)> = symbols
            .par_iter()
            .map(|symbol| (symbol.clone(), load_series(provider, symbol, timeframe)))
            .collect();

        let mut universe = Universe::default();
        for (symbol, result) in loaded {
            match result {
                Ok(series) => universe.series.push(series),
                Err(reason) => {
                    warn!("Skipping {}: {}", symbol, reason);
                    universe.skipped.push(SkippedSymbol { symbol, reason });
                }
            }
        }

        universe.reference = self.config.scan.reference().and_then(|symbol| {
            match load_series(provider, &symbol, timeframe) {
                Ok(series) => Some(series),
                Err(reason) => {
                    warn!("Reference {} unavailable: {}", symbol, reason);
                    None
                }
            }
        });

        info!(
            "Loaded {} symbols ({} skipped)",
            universe.series.len(),
            universe.skipped.len()
        );
        universe
    }

    fn regimes(&self, universe: &Universe) -> RegimeClassifier {
        match &universe.reference {
            Some(reference) => {
                RegimeClassifier::new(&self.config.regime, reference, self.config.scan.market)
            }
            None => RegimeClassifier::unavailable(self.config.scan.market),
        }
    }

    /// Detect, simulate and aggregate across the universe
    pub fn run(&self, universe: &Universe, cancel: &CancelToken) -> BacktestResult {
        let regimes = self.regimes(universe);
        info!(
            "Backtesting {} symbols (trigger {:?})",
            universe.series.len(),
            self.config.backtest.entry_trigger
        );

        let (reports, mut skipped, cancelled) =
            self.fan_out(universe, cancel, |series| self.process_symbol(series, &regimes));

        // Barrier passed: merge once, then reduce single-threaded
        let mut result = BacktestResult {
            symbols_processed: reports.len(),
            cancelled,
            ..Default::default()
        };
        for report in reports {
            result.signals.extend(report.signals);
            result.trades.extend(report.trades);
            result.live_signals.extend(report.live);
            result.open_at_end += report.open_at_end;
            result.unconfirmed += report.unconfirmed;
        }
        sort_by_exit(&mut result.trades);
        sort_signals(&mut result.signals);
        sort_signals(&mut result.live_signals);

        let options = MetricsOptions::from(&self.config.backtest);
        result.summary = aggregate(&result.trades, &options);
        result.regime_breakdown = aggregate_by_regime(&result.trades, &options);

        skipped.splice(0..0, universe.skipped.iter().cloned());
        result.skipped = skipped;

        info!(
            "Backtest finished: {} symbols, {} signals, {} trades, {} open, {} skipped{}",
            result.symbols_processed,
            result.signals.len(),
            result.trades.len(),
            result.open_at_end,
            result.skipped.len(),
            if result.cancelled { " (cancelled)" } else { "" }
        );
        result
    }

    /// Detection only; no trades are aggregated
    pub fn scan(&self, universe: &Universe, cancel: &CancelToken) -> ScanResult {
        let regimes = self.regimes(universe);
        let (reports, mut skipped, cancelled) = self.fan_out(universe, cancel, |series| {
            let signals = self.detect(series);
            let live = self.one_per_pattern(
                signals
                    .iter()
                    .filter(|s| self.simulator.replay(s, series, &regimes).is_live())
                    .cloned()
                    .collect(),
            );
            SymbolReport {
                signals,
                live,
                ..Default::default()
            }
        });

        let mut result = ScanResult {
            symbols_processed: reports.len(),
            cancelled,
            ..Default::default()
        };
        for report in reports {
            result.signals.extend(report.signals);
            result.live_signals.extend(report.live);
        }
        sort_signals(&mut result.signals);
        sort_signals(&mut result.live_signals);

        skipped.splice(0..0, universe.skipped.iter().cloned());
        result.skipped = skipped;
        info!(
            "Scan finished: {} symbols, {} signals, {} live",
            result.symbols_processed,
            result.signals.len(),
            result.live_signals.len()
        );
        result
    }

    /// Run `work` per symbol on the pool, checking cancellation first
    fn fan_out<F>(
        &self,
        universe: &Universe,
        cancel: &CancelToken,
        work: F,
    ) -> (Vec<SymbolReport>, Vec<SkippedSymbol>, bool)
    where
        F: Fn(&BarSeries) -> SymbolReport + Send + Sync,
    {
        let required = self.min_history();
        let unit = |series: &BarSeries| -> Result<SymbolReport, SkipReason> {
            if cancel.is_cancelled() {
                return Err(SkipReason::Cancelled);
            }
            let outcome = if series.len() < required {
                Err(SkipReason::InsufficientHistory {
                    bars: series.len(),
                    required,
                })
            } else {
                Ok(work(series))
            };
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
            outcome
        };

        let collect = || -> Vec<(Symbol, Result<SymbolReport, SkipReason>)> {
            universe
                .series
                .par_iter()
                .map(|series| (series.symbol().clone(), unit(series)))
                .collect()
        };
        let outcomes = match &self.pool {
            Some(pool) => pool.install(collect),
            None => collect(),
        };

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        let mut cancelled = false;
        for (symbol, outcome) in outcomes {
            match outcome {
                Ok(report) => reports.push(report),
                Err(reason) => {
                    if reason == SkipReason::Cancelled {
                        cancelled = true;
                    } else {
                        warn!("Skipping {}: {}", symbol, reason);
                    }
                    skipped.push(SkippedSymbol { symbol, reason });
                }
            }
        }
        if cancelled {
            warn!("Run cancelled; results cover completed symbols only");
        }
        (reports, skipped, cancelled)
    }

    fn detect(&self, series: &BarSeries) -> Vec<Signal> {
        let probability = self.ml_scores.get(series.symbol()).copied();
        self.detector
            .detect(series, &self.config.scan.exchange, self.config.scan.timeframe)
            .into_iter()
            .map(|s| s.with_win_probability(probability))
            .collect()
    }

    fn process_symbol(&self, series: &BarSeries, regimes: &RegimeClassifier) -> SymbolReport {
        let signals = self.detect(series);
        let candidates = match self.config.backtest.entry_trigger {
            EntryTrigger::Any => supersede_approaching(signals.clone()),
            _ => signals.clone(),
        };

        let mut report = SymbolReport {
            signals,
            ..Default::default()
        };

        for signal in &candidates {
            let simulation = if self.simulator.trades(signal.signal_type) {
                self.simulator.simulate(signal, series, regimes)
            } else {
                // Untraded type: only its live status matters
                if self.simulator.replay(signal, series, regimes).is_live() {
                    report.live.push(signal.clone());
                }
                continue;
            };

            match simulation.outcome {
                SimOutcome::Closed(trade) => report.trades.push(trade),
                SimOutcome::OpenAtEnd => {
                    report.open_at_end += 1;
                    report.live.push(signal.clone());
                }
                SimOutcome::Pending => report.live.push(signal.clone()),
                SimOutcome::Unconfirmed => report.unconfirmed += 1,
                SimOutcome::Rejected(reason) => {
                    debug!("{} {}: {}", signal.symbol, signal.detected_at, reason);
                    report.rejected += 1;
                }
            }
        }

        report.live = self.one_per_pattern(std::mem::take(&mut report.live));

        debug!(
            "{}: {} signals, {} trades, {} live",
            series.symbol(),
            report.signals.len(),
            report.trades.len(),
            report.live.len()
        );
        report
    }

    /// Keep one live signal per pattern of a symbol
    ///
    /// A signal type the trigger trades wins over one it does not; otherwise
    /// the later detection supersedes the earlier.
    fn one_per_pattern(&self, live: Vec<Signal>) -> Vec<Signal> {
        let rank = |s: &Signal| (self.simulator.trades(s.signal_type), s.detected_at);
        let mut by_pattern: BTreeMap<DateTime<Utc>, Signal> = BTreeMap::new();
        for signal in live {
            match by_pattern.entry(signal.pattern_start) {
                Entry::Vacant(slot) => {
                    slot.insert(signal);
                }
                Entry::Occupied(mut slot) => {
                    if rank(&signal) > rank(slot.get()) {
                        slot.insert(signal);
                    }
                }
            }
        }
        by_pattern.into_values().collect()
    }
}

fn load_series(
    provider: &dyn BarProvider,
    symbol: &Symbol,
    timeframe: Timeframe,
) -> Result<BarSeries, SkipReason> {
    let candles = provider.load(symbol, timeframe).map_err(|e| SkipReason::NoData {
        message: e.to_string(),
    })?;
    BarSeries::new(symbol.clone(), candles).map_err(|e| SkipReason::InvalidSeries {
        message: e.to_string(),
    })
}

fn sort_signals(signals: &mut [Signal]) {
    signals.sort_by(|a, b| {
        a.detected_at
            .cmp(&b.detected_at)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}
