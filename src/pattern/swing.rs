//! Swing-point extraction
//!
//! A bar is a swing high when its high beats the `window` bars before it and
//! is not beaten by the `window` bars after it (lows mirror this). Because the
//! right side must exist, a swing at index `i` is only known at bar `i + window`.

use ordered_float::OrderedFloat;

use crate::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwingPoint {
    pub index: usize,
    pub kind: SwingKind,
    pub price: f64,
}

impl SwingPoint {
    /// First bar at which this swing can be used without lookahead
    pub fn confirmed_at(&self, window: usize) -> usize {
        self.index + window
    }
}

fn max_high(candles: &[Candle]) -> Option<OrderedFloat<f64>> {
    candles.iter().map(|c| OrderedFloat(c.high)).max()
}

fn min_low(candles: &[Candle]) -> Option<OrderedFloat<f64>> {
    candles.iter().map(|c| OrderedFloat(c.low)).min()
}

/// All swing highs and lows, ordered by index
pub fn find_swings(candles: &[Candle], window: usize) -> Vec<SwingPoint> {
    let mut swings = Vec::new();
    if window == 0 || candles.len() < 2 * window + 1 {
        return swings;
    }

    for i in window..candles.len() - window {
        let left = &candles[i - window..i];
        let right = &candles[i + 1..=i + window];
        let high = OrderedFloat(candles[i].high);
        let low = OrderedFloat(candles[i].low);

        if max_high(left).is_some_and(|m| high > m) && max_high(right).is_some_and(|m| high >= m)
        {
            swings.push(SwingPoint {
                index: i,
                kind: SwingKind::High,
                price: candles[i].high,
            });
        }
        if min_low(left).is_some_and(|m| low < m) && min_low(right).is_some_and(|m| low <= m) {
            swings.push(SwingPoint {
                index: i,
                kind: SwingKind::Low,
                price: candles[i].low,
            });
        }
    }

    swings
}

/// Collapse runs of same-kind swings to their extreme so kinds alternate
///
/// Highs keep the higher (earlier on ties), lows keep the lower.
pub fn zigzag<'a>(swings: impl IntoIterator<Item = &'a SwingPoint>) -> Vec<SwingPoint> {
    let mut out: Vec<SwingPoint> = Vec::new();
    for swing in swings {
        match out.last_mut() {
            Some(last) if last.kind == swing.kind => {
                let more_extreme = match swing.kind {
                    SwingKind::High => swing.price > last.price,
                    SwingKind::Low => swing.price < last.price,
                };
                if more_extreme {
                    *last = *swing;
                }
            }
            _ => out.push(*swing),
        }
    }
    out
}
