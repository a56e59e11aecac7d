//! VCP scanner - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Scan the universe, simulate every signal, write the result bundle
//! - scan: Detect signals only and refresh the live-signals feed

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "vcp-scanner")]
#[command(about = "Volatility Contraction Pattern scanner and backtester", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Overrides shared by both subcommands
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "configs/vcp_crypto_1d.json")]
    pub config: String,

    /// Directory holding {SYMBOL}_{timeframe}.csv files
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Symbols to scan (comma-separated). E.g., "BTCUSDT,ETHUSDT"
    #[arg(long)]
    pub symbols: Option<String>,

    /// Bar interval. E.g., "1d", "4h"
    #[arg(long)]
    pub timeframe: Option<String>,

    /// Worker threads (default: one per core)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Stop starting new symbols after this many seconds
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect, simulate and aggregate; writes the result bundle and live feed
    Backtest {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Detect signals only; writes the live feed
    Scan {
        #[command(flatten)]
        args: RunArgs,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // Create log file with naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Keep the console clean for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        // Same format as the console, without ANSI colors
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    }

    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { .. } => ("backtest", true),
        Commands::Scan { .. } => ("scan", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Backtest { args } => commands::backtest::run(args),
        Commands::Scan { args } => commands::scan::run(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_backtest_overrides() {
        let cli = Cli::try_parse_from(["vcp-scanner", "backtest", "--symbols", "A,B", "--workers", "2"]).unwrap();
        let Commands::Backtest { args } = cli.command else {
            panic!("expected backtest");
        };
        assert_eq!(args.symbols.as_deref(), Some("A,B"));
        assert_eq!(args.workers, Some(2));
        assert_eq!(args.config, "configs/vcp_crypto_1d.json");
    }

    #[test]
    fn test_scan_with_global_verbose() {
        let cli = Cli::try_parse_from(["vcp-scanner", "scan", "--timeframe", "4h", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Scan { ref args } if args.timeframe.as_deref() == Some("4h")));
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["vcp-scanner"]).is_err());
    }
}
