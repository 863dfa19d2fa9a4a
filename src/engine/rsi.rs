//! Rolling RSI with Wilder smoothing.
//!
//! First average is a simple mean over the first `period` changes;
//! afterwards avg = (prev * (period - 1) + change) / period.
//! RSI = 100 - 100 / (1 + avg_gain / avg_loss), 100 when avg_loss is zero.

use rust_decimal::Decimal;

/// Incremental RSI over a single (symbol, timeframe) close series
#[derive(Debug, Clone)]
pub struct RsiTracker {
    period: usize,
    prev_close: Option<Decimal>,
    avg_gain: Decimal,
    avg_loss: Decimal,
    /// Price changes consumed so far
    changes_seen: usize,
    previous: Option<Decimal>,
    current: Option<Decimal>,
}

impl RsiTracker {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            avg_gain: Decimal::ZERO,
            avg_loss: Decimal::ZERO,
            changes_seen: 0,
            previous: None,
            current: None,
        }
    }

    /// Feed the next close; returns the RSI once warm (`period` changes seen)
    pub fn update(&mut self, close: Decimal) -> Option<Decimal> {
        let Some(prev_close) = self.prev_close.replace(close) else {
            return None;
        };

        let change = close - prev_close;
        let gain = if change > Decimal::ZERO { change } else { Decimal::ZERO };
        let loss = if change < Decimal::ZERO { -change } else { Decimal::ZERO };

        self.changes_seen += 1;
        let n = Decimal::from(self.period as u64);

        if self.changes_seen < self.period {
            // Warmup: accumulate for the initial simple mean
            self.avg_gain += gain;
            self.avg_loss += loss;
            return None;
        } else if self.changes_seen == self.period {
            self.avg_gain = (self.avg_gain + gain) / n;
            self.avg_loss = (self.avg_loss + loss) / n;
        } else {
            self.avg_gain = (self.avg_gain * (n - Decimal::ONE) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - Decimal::ONE) + loss) / n;
        }

        let rsi = if self.avg_loss.is_zero() {
            Decimal::from(100)
        } else {
            let rs = self.avg_gain / self.avg_loss;
            Decimal::from(100) - Decimal::from(100) / (Decimal::ONE + rs)
        };

        self.previous = self.current.replace(rsi);
        self.current
    }

    /// RSI of the most recent bar, once warm
    pub fn value(&self) -> Option<Decimal> {
        self.current
    }

    /// RSI of the bar before the most recent one
    pub fn previous(&self) -> Option<Decimal> {
        self.previous
    }

    /// Edge-triggered: previous bar at or below the threshold and the
    /// current bar above it. Never fires from a single sample.
    pub fn crossed_above(&self, threshold: Decimal) -> bool {
        match (self.previous, self.current) {
            (Some(prev), Some(curr)) => prev <= threshold && curr > threshold,
            _ => false,
        }
    }

    /// Symmetric cross below the threshold
    pub fn crossed_below(&self, threshold: Decimal) -> bool {
        match (self.previous, self.current) {
            (Some(prev), Some(curr)) => prev >= threshold && curr < threshold,
            _ => false,
        }
    }
}
