//! Scan command implementation

use anyhow::Result;
use tracing::{info, warn};

use vcp_scanner::backtest::Backtester;
use vcp_scanner::data::CsvBarProvider;
use vcp_scanner::report;

use super::{cancel_token, live_signals_path, load_config, ml_scores};
use crate::RunArgs;

pub fn run(args: RunArgs) -> Result<()> {
    info!("Starting scan");

    let config = load_config(&args)?;
    let scores = ml_scores(&config)?;

    let provider = CsvBarProvider::new(&config.scan.data_dir);
    let backtester = Backtester::new(config.clone())?.with_ml_scores(scores);
    let universe = backtester.load(&provider);
    let result = backtester.scan(&universe, &cancel_token(&config));

    for skipped in &result.skipped {
        warn!("{} skipped: {}", skipped.symbol, skipped.reason);
    }

    let live_path = live_signals_path(&config);
    let live = report::write_live_signals(&result.live_signals, &live_path)?;

    println!("\n{}", "=".repeat(60));
    println!("LIVE SIGNALS ({})", config.scan.timeframe);
    println!("{}", "=".repeat(60));
    if live.is_empty() {
        println!("No live signals");
    }
    for signal in &live {
        let ml = signal
            .ml_win_prob
            .map_or_else(|| "-".to_string(), |p| format!("{}%", p));
        println!(
            "{:<12} {:<12} score {:>3}  pivot {:>12.4}  vol {:>5.2}x  ml {:>4}",
            signal.symbol, signal.signal_type, signal.score, signal.pivot_high, signal.vol_ratio, ml
        );
    }
    println!("{}", "=".repeat(60));
    println!(
        "{} symbols scanned, {} signals, {} skipped{}",
        result.symbols_processed,
        result.signals.len(),
        result.skipped.len(),
        if result.cancelled { " (cancelled)" } else { "" }
    );
    println!("Live Signals:       {}", live_path.display());

    info!("Scan completed successfully");
    Ok(())
}
