//! VCP Scanner
//!
//! Detects Volatility Contraction Patterns across a universe of symbols,
//! replays the resulting trades bar by bar, and aggregates performance
//! overall and per market regime.

pub mod backtest;
pub mod config;
pub mod data;
pub mod indicators;
pub mod metrics;
pub mod pattern;
pub mod regime;
pub mod report;
pub mod simulator;
pub mod types;

pub use config::Config;
pub use types::*;
