//! Engine front: one worker task per configured symbol, event routing,
//! and coordinated shutdown.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{BrokerClient, BrokerEvent};
use crate::config::AppConfig;
use crate::domain::Bar;
use crate::error::{KeelError, Result};
use crate::sink::{AlertSink, EventSink};

use super::sizer::AccountState;
use super::worker::{SymbolWorker, WorkerEvent};

const WORKER_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TradingEngine {
    account: Arc<RwLock<AccountState>>,
    senders: Arc<DashMap<String, mpsc::Sender<WorkerEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TradingEngine {
    /// Build and start one worker per configured symbol
    pub fn start(
        config: &AppConfig,
        broker: Arc<dyn BrokerClient>,
        starting_cash: Decimal,
        event_sink: Arc<dyn EventSink>,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let account = Arc::new(RwLock::new(AccountState::new(starting_cash)));
        let (shutdown_tx, _) = watch::channel(false);
        let senders = Arc::new(DashMap::new());
        let mut handles = Vec::new();

        for symbol_config in &config.symbols {
            let worker = SymbolWorker::new(
                symbol_config.symbol.clone(),
                symbol_config.core_target_percent,
                config,
                broker.clone(),
                account.clone(),
                event_sink.clone(),
                alert_sink.clone(),
            )?;
            let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            senders.insert(symbol_config.symbol.clone(), tx);
            handles.push(tokio::spawn(worker.run(rx, shutdown_tx.subscribe())));
        }

        info!("engine started with {} symbol workers", handles.len());
        Ok(Self {
            account,
            senders,
            shutdown_tx,
            handles,
        })
    }

    pub fn account(&self) -> Arc<RwLock<AccountState>> {
        self.account.clone()
    }

    /// Route a closed bar to its symbol's worker. Bars for symbols
    /// without a worker are dropped with a warning.
    pub async fn dispatch_bar(&self, bar: Bar) -> Result<()> {
        let Some(sender) = self.senders.get(&bar.symbol).map(|s| s.clone()) else {
            warn!("bar for unconfigured symbol {} dropped", bar.symbol);
            return Ok(());
        };
        sender
            .send(WorkerEvent::Bar(bar))
            .await
            .map_err(|_| KeelError::Internal("worker channel closed".to_string()))
    }

    /// Spawn the broker event router: fills and rejections fan out to the
    /// owning symbol's worker, preserving per-symbol order.
    pub fn route_broker_events(&self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        let senders = self.senders.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let symbol = event.symbol().to_string();
                let Some(sender) = senders.get(&symbol).map(|s| s.clone()) else {
                    warn!("broker event for unconfigured symbol {symbol} dropped");
                    continue;
                };
                if sender.send(WorkerEvent::Broker(event)).await.is_err() {
                    warn!("worker for {symbol} gone; broker event dropped");
                }
            }
        });
    }

    /// Stop all workers: signal, then join each with a bounded timeout.
    /// Workers cancel their resting orders on the way out.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!("worker did not stop within {SHUTDOWN_JOIN_TIMEOUT:?}");
            }
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FillMode, PaperBroker};
    use crate::sink::NoopSink;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn engine_starts_and_stops_cleanly() {
        let config = AppConfig::default_config();
        let (broker, events) = PaperBroker::new(FillMode::Immediate);
        let engine = TradingEngine::start(
            &config,
            broker,
            dec!(100000),
            Arc::new(NoopSink),
            Arc::new(NoopSink),
        )
        .unwrap();
        engine.route_broker_events(events);

        assert_eq!(engine.account().read().await.equity(), dec!(100000));
        engine.shutdown().await;
    }
}
