//! Backtest command implementation

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use vcp_scanner::backtest::Backtester;
use vcp_scanner::data::CsvBarProvider;
use vcp_scanner::report::{self, ResultBundle};

use super::{cancel_token, live_signals_path, load_config, ml_scores};
use crate::RunArgs;

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}", v))
}

pub fn run(args: RunArgs) -> Result<()> {
    info!("Starting backtest");

    let config = load_config(&args)?;
    let scores = ml_scores(&config)?;

    info!("Loading data from: {}", config.scan.data_dir);
    let provider = CsvBarProvider::new(&config.scan.data_dir);
    let backtester = Backtester::new(config.clone())?.with_ml_scores(scores);
    let universe = backtester.load(&provider);

    let pb = ProgressBar::new(universe.series.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec:.2}] {msg}")?
            .progress_chars("█░ "),
    );
    let backtester = backtester.with_progress(pb.clone());

    let result = backtester.run(&universe, &cancel_token(&config));
    pb.finish_with_message("done");

    let bundle = ResultBundle::new(&result, &config.backtest, config.scan.market);
    let bundle_path = report::write_bundle(&bundle, &config.output.results_dir)?;
    let live_path = live_signals_path(&config);
    let live = report::write_live_signals(&result.live_signals, &live_path)?;

    let s = &result.summary;
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Symbols Processed:  {}", result.symbols_processed);
    println!("Symbols Skipped:    {}", result.skipped.len());
    println!("Signals:            {}", result.signals.len());
    println!("Total Trades:       {}", s.total_trades);
    println!("Winning Trades:     {}", s.winners);
    println!("Losing Trades:      {}", s.losers);
    println!("Win Rate:           {:.2}%", s.win_rate);
    println!("Profit Factor:      {}", fmt_opt(s.profit_factor));
    println!("Sharpe Ratio:       {}", fmt_opt(s.sharpe_ratio));
    println!("Max Drawdown:       {:.2}%", s.max_drawdown_pct);
    println!("Net P&L:            {:.2}", s.total_pnl_net.to_f64());
    println!("Total Fees:         {:.2}", s.total_fees.to_f64());
    println!("Avg R-Multiple:     {:.2}", s.avg_r_multiple);
    println!("Max Consec. Losses: {}", s.max_consecutive_losses);
    println!("Open At End:        {}", result.open_at_end);
    println!("Unconfirmed:        {}", result.unconfirmed);
    println!("{}", "-".repeat(60));
    for (label, stats) in &bundle.regime_breakdown {
        println!(
            "{:<18}  {:>4} trades  {:>6.2}% win  {:>9.2} avg",
            label, stats.trades, stats.win_rate, stats.avg_pnl
        );
    }
    println!("{}", "=".repeat(60));
    if result.cancelled {
        println!("Run cancelled: results cover completed symbols only");
    }
    println!("Results:            {}", bundle_path.display());
    println!("Live Signals:       {} -> {}", live.len(), live_path.display());

    info!("Backtest completed successfully");
    Ok(())
}
