//! Data loading and management
//!
//! Handles loading OHLCV bars from CSV files into validated, strictly ordered
//! per-symbol series. Acquisition itself is out of scope; providers only read
//! what is already on disk or in memory.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{Candle, CandleValidationError, Symbol, Timeframe};

/// A bar sequence that cannot be used as a series
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SeriesError {
    #[error("series is empty")]
    Empty,

    #[error("bar {index}: timestamp {current} is not after {previous}")]
    NotIncreasing {
        index: usize,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("bar {index}: {source}")]
    InvalidCandle {
        index: usize,
        #[source]
        source: CandleValidationError,
    },
}

/// Failure to read bars from a provider
#[derive(Debug, Error)]
pub enum DataError {
    #[error("no data for {symbol} at {}", path.display())]
    NotFound { symbol: String, path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{}: row {row}: {message}", path.display())]
    Parse {
        path: PathBuf,
        row: usize,
        message: String,
    },

    #[error("no data for {0}")]
    Missing(String),
}

// =============================================================================
// Bar Series
// =============================================================================

/// Read-only, strictly time-ordered bars of one symbol
#[derive(Debug, Clone)]
pub struct BarSeries {
    symbol: Symbol,
    candles: Vec<Candle>,
}

impl BarSeries {
    /// Validate every bar and the timestamp order
    pub fn new(symbol: Symbol, candles: Vec<Candle>) -> Result<Self, SeriesError> {
        if candles.is_empty() {
            return Err(SeriesError::Empty);
        }

        for (index, candle) in candles.iter().enumerate() {
            candle
                .validate()
                .map_err(|source| SeriesError::InvalidCandle { index, source })?;
            if index > 0 {
                let previous = candles[index - 1].datetime;
                if candle.datetime <= previous {
                    return Err(SeriesError::NotIncreasing {
                        index,
                        previous,
                        current: candle.datetime,
                    });
                }
            }
        }

        Ok(BarSeries { symbol, candles })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.first().map(|c| c.datetime)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.last().map(|c| c.datetime)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Index of the last bar at or before `at`
    pub fn index_at_or_before(&self, at: DateTime<Utc>) -> Option<usize> {
        let after = self.candles.partition_point(|c| c.datetime <= at);
        after.checked_sub(1)
    }

    /// Index of the bar stamped exactly `at`
    pub fn index_of(&self, at: DateTime<Utc>) -> Option<usize> {
        self.candles
            .binary_search_by(|c| c.datetime.cmp(&at))
            .ok()
    }

    /// Copy of the history up to and including `at`
    pub fn truncated_at(&self, at: DateTime<Utc>) -> Option<BarSeries> {
        let end = self.index_at_or_before(at)? + 1;
        Some(BarSeries {
            symbol: self.symbol.clone(),
            candles: self.candles[..end].to_vec(),
        })
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Source of per-symbol bars
pub trait BarProvider: Send + Sync {
    fn load(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Vec<Candle>, DataError>;
}

/// Reads `{data_dir}/{SYMBOL}_{timeframe}.csv`
#[derive(Debug, Clone)]
pub struct CsvBarProvider {
    data_dir: PathBuf,
}

impl CsvBarProvider {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        CsvBarProvider {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, symbol: &Symbol, timeframe: Timeframe) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.csv", symbol.as_str(), timeframe.as_str()))
    }
}

impl BarProvider for CsvBarProvider {
    fn load(&self, symbol: &Symbol, timeframe: Timeframe) -> Result<Vec<Candle>, DataError> {
        let path = self.path_for(symbol, timeframe);
        if !path.exists() {
            return Err(DataError::NotFound {
                symbol: symbol.to_string(),
                path,
            });
        }
        let candles = read_csv(&path)?;
        debug!("Loaded {} candles for {} from {}", candles.len(), symbol, path.display());

        let report = validate_candles(&candles);
        if let Some(first) = report.warnings.first() {
            debug!("{}: {} data warnings ({})", symbol, report.warnings.len(), first);
        }
        Ok(candles)
    }
}

/// Series held in memory, keyed by symbol
#[derive(Debug, Clone, Default)]
pub struct InMemoryBarProvider {
    series: HashMap<Symbol, Vec<Candle>>,
}

impl InMemoryBarProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: Symbol, candles: Vec<Candle>) {
        self.series.insert(symbol, candles);
    }

    pub fn with_series(mut self, symbol: impl AsRef<str>, candles: Vec<Candle>) -> Self {
        self.insert(Symbol::new(symbol), candles);
        self
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl BarProvider for InMemoryBarProvider {
    fn load(&self, symbol: &Symbol, _timeframe: Timeframe) -> Result<Vec<Candle>, DataError> {
        self.series
            .get(symbol)
            .cloned()
            .ok_or_else(|| DataError::Missing(symbol.to_string()))
    }
}

// =============================================================================
// CSV Data Loading
// =============================================================================

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(ndt.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}

fn read_csv(path: &Path) -> Result<Vec<Candle>, DataError> {
    let mut reader = csv::Reader::from_path(path).map_err(|source| DataError::Csv {
        path: path.to_path_buf(),
        source,
    })?;

    let parse_err = |row: usize, message: String| DataError::Parse {
        path: path.to_path_buf(),
        row,
        message,
    };

    let mut candles = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let row = idx + 1;
        let record = result.map_err(|source| DataError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        let dt_str = record
            .get(0)
            .ok_or_else(|| parse_err(row, "missing datetime column".to_string()))?;
        let datetime = parse_datetime(dt_str)
            .ok_or_else(|| parse_err(row, format!("unparseable datetime '{}'", dt_str)))?;

        let mut fields = [0.0f64; 5];
        for (col, (slot, name)) in fields
            .iter_mut()
            .zip(["open", "high", "low", "close", "volume"])
            .enumerate()
        {
            let raw = record
                .get(col + 1)
                .ok_or_else(|| parse_err(row, format!("missing {} column", name)))?;
            *slot = raw
                .trim()
                .parse()
                .map_err(|_| parse_err(row, format!("invalid {} '{}'", name, raw)))?;
        }
        let [open, high, low, close, volume] = fields;

        candles.push(Candle {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    Ok(candles)
}

/// Load OHLCV data from a CSV file
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    read_csv(path).with_context(|| format!("Failed to load candles from {}", path.display()))
}

/// Load the `{ "SYMBOL": probability }` map produced by the external model
///
/// Probabilities outside 0-100 are dropped.
pub fn load_ml_scores(path: impl AsRef<Path>) -> Result<HashMap<Symbol, u8>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read ML scores from {}", path.display()))?;
    let raw: HashMap<String, f64> =
        serde_json::from_str(&contents).context("Failed to parse ML scores JSON")?;

    let mut scores = HashMap::with_capacity(raw.len());
    for (symbol, probability) in raw {
        if probability.is_finite() && (0.0..=100.0).contains(&probability) {
            scores.insert(Symbol::new(&symbol), probability.round() as u8);
        } else {
            warn!("Dropping ML score {} for {}: outside 0-100", probability, symbol);
        }
    }
    Ok(scores)
}

// =============================================================================
// Data Validation
// =============================================================================

/// Validate candle data for consistency without failing
pub fn validate_candles(candles: &[Candle]) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if candles.is_empty() {
        errors.push("No candles provided".to_string());
        return ValidationResult { errors, warnings };
    }

    for (i, candle) in candles.iter().enumerate() {
        if let Err(e) = candle.validate() {
            errors.push(format!("Candle {}: {}", i, e));
        }
        if candle.volume == 0.0 {
            warnings.push(format!("Candle {}: zero volume", i));
        }
        if i > 0 && candle.datetime <= candles[i - 1].datetime {
            errors.push(format!("Candle {}: not strictly after previous bar", i));
        }
    }

    ValidationResult { errors, warnings }
}

/// Result of data validation
#[derive(Debug)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}
