//! Aged-position lifecycle through the wired engine: detection, price-driven
//! close, ghost handling and crash recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use warden_domain::{AgedPhase, EngineEvent, ExchangeId, Position, Price, Quantity, Side, Symbol};
use warden_exec::{ExchangePort, ExchangePosition, Gateways, StubExchange};
use warden_store::{MemoryStore, Store};
use wardend::{Config, Engine, NoopPriceFeed, RegistrationOutcome};

fn btc() -> Symbol {
    Symbol::from_pair("BTCUSDT").unwrap()
}

fn binance() -> ExchangeId {
    ExchangeId::new("binance").unwrap()
}

struct Fixture {
    store: Arc<MemoryStore>,
    exchange: Arc<StubExchange>,
    engine: Engine<MemoryStore>,
}

fn fixture(store: Arc<MemoryStore>, exchange: Arc<StubExchange>) -> Fixture {
    let mut gateways = Gateways::new();
    gateways.insert(binance(), exchange.clone() as Arc<dyn ExchangePort>);
    let engine = Engine::new(
        &Config::test(),
        gateways,
        store.clone(),
        Arc::new(NoopPriceFeed),
        &CancellationToken::new(),
    )
    .unwrap();
    Fixture { store, exchange, engine }
}

/// BTCUSDT long, entry 42000, opened 4 h ago, present on the exchange
async fn seed_aged_long(f: &Fixture) -> Position {
    let position = Position::new_active(
        btc(),
        binance(),
        Side::Long,
        Quantity::new(dec!(0.5)).unwrap(),
        Price::new(dec!(42000)).unwrap(),
        "entry-1".to_string(),
    )
    .with_opened_at(Utc::now() - ChronoDuration::hours(4));
    f.store.positions().save(&position).await.unwrap();
    f.exchange.add_position(
        ExchangePosition::new(btc(), Side::Long, dec!(0.5), dec!(42000)).with_exchange_id("entry-1"),
    );
    f.exchange.set_ticker(&btc(), dec!(42100));
    position
}

async fn tick(f: &Fixture, price: rust_decimal::Decimal) {
    f.engine.bus.update_price(&btc(), Price::new(price).unwrap()).await;
}

async fn wait_until_closed(f: &Fixture, position: &Position) -> Position {
    for _ in 0..100 {
        let stored = f.store.positions().find_by_id(position.id).await.unwrap().unwrap();
        if !stored.is_active() {
            return stored;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("position {} was not closed", position.id);
}

async fn register_with_live_feed(f: &Fixture) -> RegistrationOutcome {
    let symbol = btc();
    let (outcome, _) = tokio::join!(f.engine.aged_adapter.register_symbol(&symbol), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        // below entry and below the break-even target: no close
        tick(f, dec!(41900)).await;
    });
    outcome.unwrap()
}

#[tokio::test]
async fn test_grace_position_closes_at_break_even_tick() {
    let f = fixture(Arc::new(MemoryStore::new()), Arc::new(StubExchange::new(binance())));
    let position = seed_aged_long(&f).await;

    let scan = f.engine.monitor.scan_positions().await.unwrap();
    assert_eq!(scan.added, 1);
    let target = f.engine.monitor.target(position.id).await.unwrap();
    assert_eq!(target.phase, AgedPhase::Grace);
    assert_eq!(target.target_price, dec!(42050.4));

    assert_eq!(register_with_live_feed(&f).await, RegistrationOutcome::Registered);
    assert!(f.store.positions().find_by_id(position.id).await.unwrap().unwrap().is_active());

    tick(&f, dec!(42060)).await;
    let closed = wait_until_closed(&f, &position).await;

    assert_eq!(closed.exit_reason.as_deref(), Some("aged_grace"));
    assert!(f.exchange.positions().is_empty());

    let success = f.store.events().find_by_type("aged_close_success").await.unwrap();
    assert!(matches!(
        &success[..],
        [EngineEvent::AgedCloseSuccess { phase: AgedPhase::Grace, attempts: 1, .. }]
    ));
    let executed = f.store.events().find_by_type("close_order_executed").await.unwrap();
    assert!(matches!(
        &executed[..],
        [EngineEvent::CloseOrderExecuted { reason, .. }] if reason == "aged_grace"
    ));
    assert_eq!(f.engine.monitor.tracked_count().await, 0);
}

#[tokio::test]
async fn test_ghost_position_is_closed_without_an_order() {
    let f = fixture(Arc::new(MemoryStore::new()), Arc::new(StubExchange::new(binance())));
    let position = seed_aged_long(&f).await;
    f.engine.monitor.add_aged_position(&position).await.unwrap();
    register_with_live_feed(&f).await;

    // closed manually on the exchange
    f.exchange.remove_position(&btc());
    tick(&f, dec!(42100)).await;
    let closed = wait_until_closed(&f, &position).await;

    assert_eq!(closed.exit_reason.as_deref(), Some("aged_ghost"));
    assert!(f.exchange.placed_orders().is_empty());
    assert_eq!(f.store.events().find_by_type("aged_ghost_detected").await.unwrap().len(), 1);
    assert_eq!(f.engine.executor.stats().closes_requested, 0);
}

#[tokio::test]
async fn test_tracking_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let exchange = Arc::new(StubExchange::new(binance()));

    let before = fixture(store.clone(), exchange.clone());
    let position = seed_aged_long(&before).await;
    before.engine.monitor.add_aged_position(&position).await.unwrap();
    assert_eq!(before.engine.monitor.persist_state().await.unwrap(), 1);
    drop(before);

    let after = fixture(store, exchange);
    let report = after.engine.monitor.recover_state().await.unwrap();

    assert_eq!(report.recovered, 1);
    let target = after.engine.monitor.target(position.id).await.unwrap();
    assert_eq!(target.phase, AgedPhase::Grace);
    assert_eq!(after.engine.monitor.tracked_symbols().await, vec![btc()]);
}

#[tokio::test]
async fn test_adapter_follows_monitor_tracking() {
    let f = fixture(Arc::new(MemoryStore::new()), Arc::new(StubExchange::new(binance())));
    let cancel = CancellationToken::new();
    let adapter_task = tokio::spawn(f.engine.aged_adapter.clone().run(cancel.clone()));

    let position = seed_aged_long(&f).await;
    f.engine.monitor.add_aged_position(&position).await.unwrap();

    let mut subscribed = false;
    for _ in 0..50 {
        if f.engine.bus.is_subscribed(&btc(), wardend::AGED_MODULE).await {
            subscribed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(subscribed);

    cancel.cancel();
    adapter_task.await.unwrap();
}
