//! Technical indicators powered by the `ta` crate
//!
//! Only what the detector and regime classifier need: moving averages over a
//! close series and the zero-aware trailing volume average.

use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};
use ta::Next;

/// Calculate Simple Moving Average
///
/// Entry `i` is `None` until `period` values have been seen, so every value
/// depends only on `values[..=i]`.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let sma_val = indicator.next(value);
            (i + 1 >= period).then_some(sma_val)
        })
        .collect()
}

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let ema_val = indicator.next(value);
            (i + 1 >= period).then_some(ema_val)
        })
        .collect()
}

/// Mean of the non-zero volumes in the `lookback` bars before `end`
///
/// Returns `None` (insufficient data) when fewer than `lookback` bars precede
/// `end` or when fewer than half of them traded.
pub fn average_nonzero_volume(volumes: &[f64], end: usize, lookback: usize) -> Option<f64> {
    if lookback == 0 || end < lookback || end > volumes.len() {
        return None;
    }

    let window = &volumes[end - lookback..end];
    let traded: Vec<f64> = window.iter().copied().filter(|v| *v > 0.0).collect();
    if traded.is_empty() || traded.len() * 2 < lookback {
        return None;
    }

    Some(traded.iter().sum::<f64>() / traded.len() as f64)
}

/// Percent change of `values[i]` over `values[i - lookback]`
pub fn pct_change(values: &[f64], i: usize, lookback: usize) -> Option<f64> {
    let base = *values.get(i.checked_sub(lookback)?)?;
    let current = *values.get(i)?;
    (base > 0.0).then(|| (current - base) / base * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sma_warmup_and_values() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);
        assert_eq!(result.len(), 5);
        assert!(result[1].is_none());
        assert_relative_eq!(result[2].unwrap(), 2.0);
        assert_relative_eq!(result[4].unwrap(), 4.0);
    }

    #[test]
    fn test_sma_is_causal() {
        let values = [5.0, 7.0, 6.0, 9.0, 12.0, 3.0];
        let full = sma(&values, 2);
        let truncated = sma(&values[..4], 2);
        assert_eq!(&full[..4], &truncated[..]);
    }

    #[test]
    fn test_ema_warmup() {
        let values = [1.0; 10];
        let result = ema(&values, 4);
        assert!(result[2].is_none());
        assert_relative_eq!(result[9].unwrap(), 1.0);
    }

    #[test]
    fn test_average_nonzero_volume_skips_zero_bars() {
        let volumes = [100.0, 0.0, 300.0, 200.0, 999.0];
        assert_relative_eq!(average_nonzero_volume(&volumes, 4, 4).unwrap(), 200.0);
    }

    #[test]
    fn test_average_nonzero_volume_insufficient() {
        let volumes = [0.0, 0.0, 0.0, 100.0, 50.0];
        assert_eq!(average_nonzero_volume(&volumes, 4, 4), None);
        assert_eq!(average_nonzero_volume(&volumes, 2, 4), None);
        assert_eq!(average_nonzero_volume(&[0.0; 5], 5, 5), None);
    }

    #[test]
    fn test_pct_change() {
        let values = [100.0, 105.0, 110.0];
        assert_relative_eq!(pct_change(&values, 2, 2).unwrap(), 10.0);
        assert_eq!(pct_change(&values, 1, 2), None);
    }
}
