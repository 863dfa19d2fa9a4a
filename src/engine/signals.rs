//! Signal engine: RSI crossings and price-extreme watermarks.
//!
//! One instance per symbol, fed closed bars in order per timeframe.
//! Crossing signals are edge-triggered and become tradable at the open of
//! the bar following the crossing bar (which is the crossing bar's close
//! time), never on the crossing bar itself.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::config::SignalConfig;
use crate::domain::{Bar, Signal, SignalKind, Timeframe};

use super::rsi::RsiTracker;

/// Rolling 52-week window of daily highs
const YEAR_WINDOW_DAYS: i64 = 364;

pub struct SignalEngine {
    symbol: String,
    config: SignalConfig,
    trackers: HashMap<Timeframe, RsiTracker>,
    last_processed: HashMap<Timeframe, DateTime<Utc>>,
    /// (close time, high) of daily bars inside the 52-week window
    daily_highs: VecDeque<(DateTime<Utc>, Decimal)>,
    all_time_high: Option<Decimal>,
}

impl SignalEngine {
    pub fn new(symbol: impl Into<String>, config: SignalConfig) -> Self {
        let period = config.rsi_period;
        let mut trackers = HashMap::new();
        for timeframe in [Timeframe::M15, Timeframe::Daily, Timeframe::Weekly] {
            trackers.insert(timeframe, RsiTracker::new(period));
        }
        Self {
            symbol: symbol.into(),
            config,
            trackers,
            last_processed: HashMap::new(),
            daily_highs: VecDeque::new(),
            all_time_high: None,
        }
    }

    /// Seed the price watermarks from broker history at startup so the
    /// first session does not mistake every bar for a new extreme.
    pub fn seed_watermarks(&mut self, all_time_high: Decimal, year_high: Decimal) {
        self.all_time_high = Some(all_time_high);
        self.daily_highs
            .push_back((Utc::now() - Duration::days(1), year_high));
    }

    /// Current RSI for a timeframe, once warm
    pub fn rsi(&self, timeframe: Timeframe) -> Option<Decimal> {
        self.trackers.get(&timeframe).and_then(|t| t.value())
    }

    /// Process a closed bar, returning at most one signal per close.
    ///
    /// Bars at or before the last processed close for their timeframe are
    /// discarded; the engine never recomputes backward.
    pub fn on_bar(&mut self, bar: &Bar) -> Vec<Signal> {
        if let Some(last) = self.last_processed.get(&bar.timeframe) {
            if bar.timestamp <= *last {
                debug!(
                    symbol = %self.symbol,
                    timeframe = %bar.timeframe,
                    "discarding stale bar at {}",
                    bar.timestamp
                );
                return Vec::new();
            }
        }
        self.last_processed.insert(bar.timeframe, bar.timestamp);

        let tracker = self
            .trackers
            .get_mut(&bar.timeframe)
            .expect("tracker exists for every timeframe");
        let rsi = tracker.update(bar.close);

        let mut signals = Vec::new();

        match bar.timeframe {
            Timeframe::M15 => {
                let tracker = &self.trackers[&Timeframe::M15];
                if tracker.crossed_above(self.config.entry_threshold) {
                    signals.push(self.signal(bar, SignalKind::RsiCrossUp, rsi));
                } else if tracker.crossed_below(self.config.entry_threshold) {
                    signals.push(self.signal(bar, SignalKind::RsiCrossDown, rsi));
                }
            }
            Timeframe::Weekly => {
                // Evaluated only at weekly close; no intra-week triggers
                if let Some(value) = rsi {
                    if value > self.config.risk_off_threshold {
                        signals.push(self.signal(bar, SignalKind::WeeklyRsiHigh, Some(value)));
                    }
                }
            }
            Timeframe::Daily => {
                signals.extend(self.watermark_signals(bar));
            }
        }

        signals
    }

    fn watermark_signals(&mut self, bar: &Bar) -> Vec<Signal> {
        let mut signals = Vec::new();

        let cutoff = bar.timestamp - Duration::days(YEAR_WINDOW_DAYS);
        while let Some((ts, _)) = self.daily_highs.front() {
            if *ts < cutoff {
                self.daily_highs.pop_front();
            } else {
                break;
            }
        }

        let year_high = self.daily_highs.iter().map(|(_, h)| *h).max();
        if let Some(year_high) = year_high {
            if bar.close > year_high {
                signals.push(self.signal(bar, SignalKind::Price52wHigh, Some(bar.close)));
            }
        }

        if let Some(ath) = self.all_time_high {
            if bar.close > ath {
                signals.push(self.signal(bar, SignalKind::AllTimeHigh, Some(bar.close)));
                self.all_time_high = Some(bar.close);
            }
        } else {
            self.all_time_high = Some(bar.high);
        }

        self.daily_highs.push_back((bar.timestamp, bar.high));
        signals
    }

    fn signal(&self, bar: &Bar, kind: SignalKind, value: Option<Decimal>) -> Signal {
        Signal {
            symbol: self.symbol.clone(),
            timeframe: bar.timeframe,
            kind,
            value: value.unwrap_or(bar.close),
            timestamp: bar.timestamp,
            // Next bar opens when the crossing bar closes
            effective_at: bar.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn config() -> SignalConfig {
        AppConfig::default_config().signals
    }

    fn bar(tf: Timeframe, close: Decimal, minute_index: i64) -> Bar {
        let ts = Utc.with_ymd_and_hms(2025, 3, 3, 9, 30, 0).unwrap()
            + Duration::minutes(15 * minute_index);
        Bar::new("SOXL", tf, close, close, close, close, ts)
    }

    fn daily_bar(close: Decimal, high: Decimal, day: i64) -> Bar {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 21, 0, 0).unwrap() + Duration::days(day);
        Bar::new("SOXL", Timeframe::Daily, close, high, close, close, ts)
    }

    #[test]
    fn entry_signal_fires_once_on_cross() {
        let mut engine = SignalEngine::new("SOXL", config());

        // Decline long enough to warm the 7-period RSI and pin it low
        let mut idx = 0;
        for close in [100, 98, 96, 94, 92, 90, 88, 86, 84] {
            let signals = engine.on_bar(&bar(Timeframe::M15, Decimal::from(close), idx));
            assert!(signals.is_empty(), "no signal during decline");
            idx += 1;
        }
        assert!(engine.rsi(Timeframe::M15).unwrap() < dec!(30));

        // Sharp recovery crosses the threshold: exactly one signal
        let signals = engine.on_bar(&bar(Timeframe::M15, dec!(103), idx));
        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.kind, SignalKind::RsiCrossUp);
        assert_eq!(signal.effective_at, signal.timestamp);

        // Still above on the next bar: no second signal
        let signals = engine.on_bar(&bar(Timeframe::M15, dec!(104), idx + 1));
        assert!(signals.is_empty());
    }

    #[test]
    fn stale_bars_are_discarded() {
        let mut engine = SignalEngine::new("SOXL", config());
        engine.on_bar(&bar(Timeframe::M15, dec!(100), 5));
        // Re-delivery of the same close time and anything earlier is dropped
        assert!(engine.on_bar(&bar(Timeframe::M15, dec!(101), 5)).is_empty());
        assert!(engine.on_bar(&bar(Timeframe::M15, dec!(101), 3)).is_empty());
        // RSI state untouched by the stale bars
        assert!(engine.rsi(Timeframe::M15).is_none());
    }

    #[test]
    fn weekly_high_fires_at_weekly_close_only() {
        let mut engine = SignalEngine::new("SOXL", config());
        let mut signals = Vec::new();
        for week in 0..10 {
            let close = dec!(100) + Decimal::from(week * 5);
            let ts = Utc.with_ymd_and_hms(2025, 1, 3, 21, 0, 0).unwrap()
                + Duration::weeks(week);
            let b = Bar::new("SOXL", Timeframe::Weekly, close, close, close, close, ts);
            signals.extend(engine.on_bar(&b));
        }
        // A straight ascent pins weekly RSI at 100 once warm
        assert!(signals.iter().all(|s| s.kind == SignalKind::WeeklyRsiHigh));
        assert!(!signals.is_empty());
        assert!(signals.iter().all(|s| s.value > dec!(70)));
    }

    #[test]
    fn watermarks_track_new_highs() {
        let mut engine = SignalEngine::new("SOXL", config());
        engine.seed_watermarks(dec!(120), dec!(110));

        // Below both watermarks: nothing
        assert!(engine.on_bar(&daily_bar(dec!(105), dec!(106), 0)).is_empty());

        // Above the 52-week high but under the all-time high
        let signals = engine.on_bar(&daily_bar(dec!(112), dec!(112), 1));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Price52wHigh);

        // Above everything: both extremes fire
        let signals = engine.on_bar(&daily_bar(dec!(125), dec!(125), 2));
        let kinds: Vec<SignalKind> = signals.iter().map(|s| s.kind).collect();
        assert!(kinds.contains(&SignalKind::Price52wHigh));
        assert!(kinds.contains(&SignalKind::AllTimeHigh));
    }
}
