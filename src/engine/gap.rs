//! Pre-market gap detection.
//!
//! Active only during the first minutes of the pre-market session; outside
//! that window the detector is inert. A detected gap-up instructs the order
//! lifecycle to replace the standing profit-target sell with an aggressive
//! repriced sell (see `reprice_price`).

use chrono::{Duration, NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use tracing::info;

use crate::config::GapConfig;
use crate::domain::{Bar, GapDirection, GapEvent, Quote, Timeframe};

/// Limit price for a gap-scenario sell: slightly under the last trade, but
/// never above the bid. Both branches matter: thin books are bid-driven,
/// liquid ones price-driven.
pub fn reprice_price(quote: &Quote, discount: Decimal) -> Decimal {
    let discounted = quote.last * (Decimal::ONE - discount);
    match quote.bid {
        Some(bid) => discounted.min(bid),
        None => discounted,
    }
}

pub struct GapDetector {
    symbol: String,
    threshold: Decimal,
    session_open: NaiveTime,
    window: Duration,
    previous_close: Option<Decimal>,
    emitted_on: Option<NaiveDate>,
}

impl GapDetector {
    pub fn new(symbol: impl Into<String>, config: &GapConfig, session_open: NaiveTime) -> Self {
        Self {
            symbol: symbol.into(),
            threshold: config.threshold_percent,
            session_open,
            window: Duration::minutes(config.window_minutes as i64),
            previous_close: None,
            emitted_on: None,
        }
    }

    /// Record the reference close gaps are measured against
    pub fn set_previous_close(&mut self, close: Decimal) {
        self.previous_close = Some(close);
    }

    /// Inspect a closed bar. Emits at most one gap event per symbol per
    /// trading day, and only inside the opening window.
    pub fn observe(&mut self, bar: &Bar) -> Option<GapEvent> {
        if bar.timeframe != Timeframe::M15 {
            return None;
        }
        let date = bar.timestamp.date_naive();
        if self.emitted_on == Some(date) {
            return None;
        }

        let window_end = self.session_open + self.window;
        let bar_open_time = bar
            .timestamp
            .time()
            .overflowing_sub_signed(Duration::minutes(15))
            .0;
        if bar_open_time < self.session_open || bar_open_time >= window_end {
            return None;
        }

        let previous_close = self.previous_close?;
        if previous_close <= Decimal::ZERO {
            return None;
        }

        let gap_percent = (bar.open - previous_close) / previous_close;
        let direction = if gap_percent > Decimal::ZERO {
            GapDirection::Up
        } else {
            GapDirection::Down
        };

        // Only up-gaps beyond the threshold are actionable
        if direction != GapDirection::Up || gap_percent <= self.threshold {
            return None;
        }

        self.emitted_on = Some(date);
        let expires_at = bar
            .timestamp
            .with_hour(window_end.hour())
            .and_then(|t| t.with_minute(window_end.minute()))
            .and_then(|t| t.with_second(0))
            .unwrap_or(bar.timestamp);

        info!(
            symbol = %self.symbol,
            "gap up {:.4}%: prev close {} -> open {}",
            gap_percent * Decimal::from(100),
            previous_close,
            bar.open
        );

        Some(GapEvent {
            symbol: self.symbol.clone(),
            previous_close,
            current_open: bar.open,
            gap_percent,
            direction,
            detected_at: bar.timestamp,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn detector() -> GapDetector {
        let config = AppConfig::default_config();
        GapDetector::new(
            "SOXL",
            &config.gap,
            NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
        )
    }

    fn premarket_bar(open: Decimal, close: Decimal, minute: u32) -> Bar {
        // Bar close timestamp; the bar opened 15 minutes earlier
        let ts = Utc.with_ymd_and_hms(2025, 3, 3, 4, minute, 0).unwrap();
        Bar::new("SOXL", Timeframe::M15, open, close, open, close, ts)
    }

    #[test]
    fn detects_gap_up_in_window() {
        let mut detector = detector();
        detector.set_previous_close(dec!(100));

        let event = detector.observe(&premarket_bar(dec!(102), dec!(102.5), 15)).unwrap();
        assert_eq!(event.direction, GapDirection::Up);
        assert_eq!(event.gap_percent, dec!(0.02));
        assert_eq!(event.previous_close, dec!(100));
        // Valid inside the window, dead once it closes
        assert!(!event.is_expired(event.expires_at - Duration::minutes(1)));
        assert!(event.is_expired(event.expires_at));
    }

    #[test]
    fn inert_outside_window() {
        let mut detector = detector();
        detector.set_previous_close(dec!(100));

        // Bar opening 04:30, after the 15-minute window
        let ts = Utc.with_ymd_and_hms(2025, 3, 3, 4, 45, 0).unwrap();
        let bar = Bar::new("SOXL", Timeframe::M15, dec!(105), dec!(105), dec!(105), dec!(105), ts);
        assert!(detector.observe(&bar).is_none());

        // Regular-hours bar
        let ts = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        let bar = Bar::new("SOXL", Timeframe::M15, dec!(105), dec!(105), dec!(105), dec!(105), ts);
        assert!(detector.observe(&bar).is_none());
    }

    #[test]
    fn ignores_small_and_down_gaps() {
        let mut detector = detector();
        detector.set_previous_close(dec!(100));
        // 0.5% gap: below the 1% threshold
        assert!(detector.observe(&premarket_bar(dec!(100.5), dec!(101), 15)).is_none());
        // Down gap: never actionable
        assert!(detector.observe(&premarket_bar(dec!(95), dec!(96), 15)).is_none());
    }

    #[test]
    fn one_event_per_day() {
        let mut detector = detector();
        detector.set_previous_close(dec!(100));
        assert!(detector.observe(&premarket_bar(dec!(102), dec!(102), 15)).is_some());
        assert!(detector.observe(&premarket_bar(dec!(103), dec!(103), 15)).is_none());
    }

    #[test]
    fn no_detection_without_reference_close() {
        let mut detector = detector();
        assert!(detector.observe(&premarket_bar(dec!(102), dec!(102), 15)).is_none());
    }

    #[test]
    fn reprice_uses_cheaper_of_discounted_last_and_bid() {
        let quote = |bid: Decimal, last: Decimal| Quote {
            symbol: "SOXL".to_string(),
            bid: Some(bid),
            ask: Some(last + dec!(0.05)),
            last,
            timestamp: Utc::now(),
        };

        // Price-driven branch: last * 0.999 = 99.9 < bid 100.5
        assert_eq!(reprice_price(&quote(dec!(100.5), dec!(100)), dec!(0.001)), dec!(99.900));
        // Bid-driven branch: bid 99.5 < last * 0.999 = 99.9
        assert_eq!(reprice_price(&quote(dec!(99.5), dec!(100)), dec!(0.001)), dec!(99.5));
    }
}
