//! Volatility Contraction Pattern detection
//!
//! A left-side high (the pivot) followed by pullbacks that shrink by a
//! configurable factor, resolved by a volume-confirmed close above the pivot.

mod config;
mod detector;
pub mod swing;

pub use config::{BreakoutRule, DetectorConfig, ScoreWeights};
pub use detector::{merge_duplicates, supersede_approaching, VcpDetector};
