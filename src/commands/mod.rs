//! Subcommand implementations

pub mod backtest;
pub mod scan;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use vcp_scanner::backtest::CancelToken;
use vcp_scanner::{data, Config, Symbol, Timeframe};

use crate::RunArgs;

/// Load the config file and apply command-line overrides
///
/// Validation runs again after the overrides so a bad flag fails before any
/// data is read.
pub fn load_config(args: &RunArgs) -> Result<Config> {
    let mut config = Config::from_file(&args.config)?;
    info!("Loaded configuration from: {}", args.config);

    if let Some(dir) = &args.data_dir {
        info!("Overriding data directory to: {}", dir);
        config.scan.data_dir = dir.clone();
    }

    if let Some(symbols) = &args.symbols {
        config.scan.symbols = symbols
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        info!("Overriding symbols to: {:?}", config.scan.symbols);
    }

    if let Some(tf) = &args.timeframe {
        config.scan.timeframe = tf.parse::<Timeframe>().map_err(anyhow::Error::msg)?;
        info!("Overriding timeframe to: {}", config.scan.timeframe);
    }

    if let Some(workers) = args.workers {
        info!("Overriding worker count to: {}", workers);
        config.scan.workers = Some(workers);
    }

    if let Some(secs) = args.deadline_secs {
        info!("Overriding deadline to: {}s", secs);
        config.scan.deadline_secs = Some(secs);
    }

    config.validate().context("Invalid configuration")?;
    debug!("Effective configuration: {:?}", config);
    Ok(config)
}

/// Externally computed win probabilities, empty when no file is configured
pub fn ml_scores(config: &Config) -> Result<HashMap<Symbol, u8>> {
    match &config.scan.ml_scores_path {
        Some(path) => {
            let scores = data::load_ml_scores(path)?;
            info!("Loaded {} ML win probabilities from {}", scores.len(), path);
            Ok(scores)
        }
        None => Ok(HashMap::new()),
    }
}

pub fn cancel_token(config: &Config) -> CancelToken {
    match config.scan.deadline_secs {
        Some(secs) => CancelToken::with_deadline(Duration::from_secs(secs)),
        None => CancelToken::new(),
    }
}

pub fn live_signals_path(config: &Config) -> PathBuf {
    PathBuf::from(&config.output.results_dir).join(&config.output.live_signals_file)
}
