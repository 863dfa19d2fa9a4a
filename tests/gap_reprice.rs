//! Gap scenario end to end: a pre-market gap up replaces the standing
//! profit-target sell with an aggressive repriced sell at
//! min(last x 0.999, bid) on the short deadline.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use keel::broker::{BrokerEvent, FillMode, PaperBroker};
use keel::config::{AppConfig, SymbolConfig};
use keel::domain::{Bar, LotRole, OrderKind, Timeframe};
use keel::engine::{AccountState, SymbolWorker, WorkerEvent};
use keel::sink::NoopSink;

fn setup(broker: Arc<PaperBroker>) -> SymbolWorker {
    let mut config = AppConfig::default_config();
    // Core target zero so trading entries are allowed immediately
    config.symbols = vec![SymbolConfig {
        symbol: "SOXL".to_string(),
        core_target_percent: dec!(0),
    }];
    let account = Arc::new(RwLock::new(AccountState::new(dec!(100000))));
    SymbolWorker::new(
        "SOXL",
        dec!(0),
        &config,
        broker,
        account,
        Arc::new(NoopSink),
        Arc::new(NoopSink),
    )
    .unwrap()
}

fn m15(open: Decimal, close: Decimal, hour: u32, minute: u32, day: u32) -> Bar {
    let ts = Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap();
    Bar::new(
        "SOXL",
        Timeframe::M15,
        open,
        open.max(close),
        open.min(close),
        close,
        ts,
    )
}

async fn drain(worker: &mut SymbolWorker, events: &mut mpsc::UnboundedReceiver<BrokerEvent>) {
    while let Ok(event) = events.try_recv() {
        worker.handle(WorkerEvent::Broker(event)).await;
    }
}

#[tokio::test]
async fn gap_up_replaces_standing_sell_with_repriced_one() {
    let (broker, mut events) = PaperBroker::new(FillMode::Manual);
    let mut worker = setup(broker.clone());

    // Oversold decline, then the crossing bar fires the entry
    let closes = [
        dec!(100),
        dec!(98),
        dec!(96),
        dec!(94),
        dec!(92),
        dec!(90),
        dec!(88),
        dec!(86),
        dec!(84),
    ];
    for (index, close) in closes.iter().enumerate() {
        let minute = (index % 4) as u32 * 15;
        let hour = 14 + (index / 4) as u32;
        worker
            .handle(WorkerEvent::Bar(m15(*close, *close, hour, minute, 3)))
            .await;
    }
    worker
        .handle(WorkerEvent::Bar(m15(dec!(103), dec!(103), 16, 30, 3)))
        .await;

    // Entry rests; fill it so the profit-target exit gets armed
    let resting = broker.resting_order_ids("SOXL").await;
    assert_eq!(resting.len(), 1);
    broker.fill_order(&resting[0], 9, dec!(103)).await;
    drain(&mut worker, &mut events).await;

    let resting = broker.resting_order_ids("SOXL").await;
    assert_eq!(resting.len(), 1, "profit-target exit is resting");
    let exit = broker.resting_request(&resting[0]).await.unwrap();
    assert_eq!(exit.kind, OrderKind::Exit);
    assert_eq!(exit.limit_price, dec!(104.03)); // 103 + 1%
    let exit_id = resting[0].clone();

    // The daily close goes on record as the gap reference
    let daily_close = Utc.with_ymd_and_hms(2025, 3, 3, 21, 0, 0).unwrap();
    worker
        .handle(WorkerEvent::Bar(Bar::new(
            "SOXL",
            Timeframe::Daily,
            dec!(103),
            dec!(103),
            dec!(103),
            dec!(103),
            daily_close,
        )))
        .await;
    broker.set_quote("SOXL", dec!(104.8), dec!(105.2), dec!(105)).await;

    // First 15-minute pre-market bar the next day: open 105 vs close 103
    // is a 1.94% gap, over the 1% threshold
    worker
        .handle(WorkerEvent::Bar(m15(dec!(105), dec!(105.5), 4, 15, 4)))
        .await;
    drain(&mut worker, &mut events).await;

    // The standing exit was cancelled and replaced under the gap rule:
    // min(105 x 0.999, 104.8) = min(104.895, 104.8) -> bid-driven
    let resting = broker.resting_order_ids("SOXL").await;
    assert_eq!(resting.len(), 1);
    assert_ne!(resting[0], exit_id);
    let repriced = broker.resting_request(&resting[0]).await.unwrap();
    assert_eq!(repriced.kind, OrderKind::GapReprice);
    assert_eq!(repriced.quantity, 9);
    assert_eq!(repriced.limit_price, dec!(104.8));

    // It fills; the round trip closes out above the original target
    broker.fill_order(&resting[0], 9, dec!(104.8)).await;
    drain(&mut worker, &mut events).await;
    assert_eq!(worker.ledger().open_quantity(LotRole::Trading), 0);
    assert_eq!(worker.active_orders(), 0);
}
