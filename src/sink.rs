//! External collaborator seams: audit persistence and alerting.
//!
//! Persistence is write-behind: the engine keeps trading when a record
//! call fails, logging the failure. Alerts are fire-and-forget.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{GapEvent, Lot, Order, Signal};
use crate::error::Result;

/// Append-only audit record
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Signal(Signal),
    Gap(GapEvent),
    Order(Order),
    Lot(Lot),
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Fatal,
}

/// Structured alert events pushed to the alerting collaborator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    SignalFired {
        symbol: String,
        signal: String,
    },
    OrderRejected {
        symbol: String,
        reason: String,
    },
    RiskTransition {
        symbol: String,
        from: String,
        to: String,
        reason: String,
    },
    UnwindTriggered {
        symbol: String,
        quantity: u64,
    },
    GapRetriesExhausted {
        symbol: String,
    },
    ReconciliationRequired {
        symbol: String,
        detail: String,
    },
}

impl Alert {
    pub fn level(&self) -> AlertLevel {
        match self {
            Alert::SignalFired { .. } => AlertLevel::Info,
            Alert::OrderRejected { .. } => AlertLevel::Warning,
            Alert::RiskTransition { .. } => AlertLevel::Warning,
            Alert::UnwindTriggered { .. } => AlertLevel::Warning,
            Alert::GapRetriesExhausted { .. } => AlertLevel::Warning,
            Alert::ReconciliationRequired { .. } => AlertLevel::Fatal,
        }
    }
}

/// Append-only sink for state changes
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

/// Fire-and-forget alert delivery
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: Alert);
}

/// Sink that writes structured lines through tracing; the default for
/// paper runs
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        info!(target: "keel::audit", "{}", serde_json::to_string(&event)?);
        Ok(())
    }
}

#[async_trait]
impl AlertSink for LogSink {
    async fn alert(&self, alert: Alert) {
        match serde_json::to_string(&alert) {
            Ok(payload) => info!(target: "keel::alert", level = ?alert.level(), "{payload}"),
            Err(e) => warn!("alert serialization failed: {e}"),
        }
    }
}

/// Sink that drops everything (tests)
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn record(&self, _event: AuditEvent) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl AlertSink for NoopSink {
    async fn alert(&self, _alert: Alert) {}
}

/// Write-behind record: failures are logged, never fatal to trading
pub async fn record_write_behind(sink: &dyn EventSink, event: AuditEvent) {
    if let Err(e) = sink.record(event).await {
        warn!("audit sink write failed (continuing): {e}");
    }
}
