use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum KeelError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Broker errors (transient unless stated otherwise)
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Broker call timed out after {elapsed_ms}ms")]
    BrokerTimeout { elapsed_ms: u64 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Market data errors
    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    #[error("Stale data: {0}")]
    StaleData(String),

    #[error("Quote unavailable for symbol: {symbol}")]
    QuoteUnavailable { symbol: String },

    // Order execution errors
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    // Risk / capital limit errors
    #[error("Risk error: {0}")]
    Risk(#[from] RiskError),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for KeelError
pub type Result<T> = std::result::Result<T, KeelError>;

/// Specific error types for the order lifecycle
#[derive(Error, Debug, Clone)]
pub enum OrderError {
    #[error("Order not found: {correlation_key}")]
    NotFound { correlation_key: String },

    #[error("Order already terminal: {status}")]
    AlreadyTerminal { status: String },

    #[error("Submission failed: {reason}")]
    SubmitFailed { reason: String },

    #[error("Max retries exceeded: {attempts}")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("Duplicate fill {fill_id} ignored")]
    DuplicateFill { fill_id: String },

    #[error("Fill for unknown broker order: {broker_order_id}")]
    UnknownFill { broker_order_id: String },
}

/// Specific error types for risk and capital limits
#[derive(Error, Debug, Clone)]
pub enum RiskError {
    #[error("{limit} limit breached: allowed {allowed}, projected {projected} (excess {excess})")]
    LimitBreach {
        limit: LimitKind,
        allowed: Decimal,
        projected: Decimal,
        excess: Decimal,
    },

    #[error("Trading halted for {symbol}: {reason}")]
    TradingHalted { symbol: String, reason: String },

    #[error("Ledger diverges from broker for {symbol}: ledger {ledger_qty}, broker {broker_qty}")]
    ReconciliationDivergence {
        symbol: String,
        ledger_qty: u64,
        broker_qty: u64,
    },
}

/// Which capital limit a rejected order ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Per-symbol exposure above core target + buffer
    SymbolExposure,
    /// Account cash below the minimum reserve
    CashReserve,
    /// Total invested above the maximum
    TotalInvested,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::SymbolExposure => write!(f, "symbol exposure"),
            LimitKind::CashReserve => write!(f, "cash reserve"),
            LimitKind::TotalInvested => write!(f, "total invested"),
        }
    }
}
