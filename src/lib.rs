pub mod broker;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod sink;

pub use broker::{BrokerClient, BrokerEvent, FillMode, PaperBroker};
pub use config::AppConfig;
pub use domain::{
    Bar, Fill, GapEvent, Lot, LotRole, LotStatus, Order, OrderKind, OrderRequest, OrderSide,
    OrderStatus, PositionSnapshot, Quote, Signal, SignalKind, Timeframe,
};
pub use engine::{
    AccountState, CoreBuildProgress, CorePositionBuilder, GapDetector, LotLedger,
    OrderLifecycleManager, PositionSizer, RiskState, RiskStateMachine, RsiTracker, SignalEngine,
    SymbolWorker, TradingEngine, WorkerEvent,
};
pub use error::{KeelError, Result};
pub use sink::{Alert, AlertLevel, AlertSink, AuditEvent, EventSink, LogSink, NoopSink};
