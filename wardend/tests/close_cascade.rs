//! Aged closes that need the executor's fallback order types.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;
use warden_domain::{EngineEvent, ExchangeId, Position, Price, Quantity, Side, Symbol};
use warden_exec::{
    BookLevel, ExchangePort, ExchangePosition, ExecError, Gateways, OrderBook, StubExchange,
    StubOrderKind,
};
use warden_store::{MemoryStore, Store};
use wardend::{CloseOutcome, Config, Engine, NoopPriceFeed};

fn eth() -> Symbol {
    Symbol::from_pair("ETHUSDT").unwrap()
}

fn bybit() -> ExchangeId {
    ExchangeId::new("bybit").unwrap()
}

async fn setup() -> (Arc<MemoryStore>, Arc<StubExchange>, Engine<MemoryStore>, Position) {
    let store = Arc::new(MemoryStore::new());
    let exchange = Arc::new(StubExchange::new(bybit()));
    exchange.add_position(ExchangePosition::new(eth(), Side::Short, dec!(3), dec!(2500)));
    exchange.set_ticker(&eth(), dec!(2490.123456));
    exchange.set_order_book(
        &eth(),
        OrderBook {
            bids: vec![BookLevel { price: dec!(2490.1), amount: dec!(10) }],
            asks: vec![BookLevel { price: dec!(2490.2), amount: dec!(10) }],
        },
    );

    let mut gateways = Gateways::new();
    gateways.insert(bybit(), exchange.clone() as Arc<dyn ExchangePort>);
    let engine = Engine::new(
        &Config::test(),
        gateways,
        store.clone(),
        Arc::new(NoopPriceFeed),
        &CancellationToken::new(),
    )
    .unwrap();

    let position = Position::new_active(
        eth(),
        bybit(),
        Side::Short,
        Quantity::new(dec!(3)).unwrap(),
        Price::new(dec!(2500)).unwrap(),
        "s-1".to_string(),
    )
    .with_opened_at(Utc::now() - ChronoDuration::hours(5));
    store.positions().save(&position).await.unwrap();
    engine.monitor.add_aged_position(&position).await.unwrap();

    (store, exchange, engine, position)
}

#[tokio::test]
async fn test_close_falls_back_to_aggressive_limit() {
    let (store, exchange, engine, position) = setup().await;
    exchange.fail_orders(
        StubOrderKind::Market,
        (0..3).map(|i| ExecError::Network(format!("reset {}", i))),
    );

    let outcome = engine.monitor.close_position(position.id, Price::new(dec!(2490)).unwrap()).await;

    assert_eq!(outcome, CloseOutcome::Closed);
    let ioc = exchange.placed_orders().pop().unwrap();
    assert!(ioc.reduce_only);
    assert!(ioc.price.is_some());

    let success = store.events().find_by_type("aged_close_success").await.unwrap();
    assert!(matches!(
        &success[..],
        [EngineEvent::AgedCloseSuccess { attempts: 4, order_type: Some(t), .. }] if t == "limit_aggressive"
    ));
    let closed = store.positions().find_by_id(position.id).await.unwrap().unwrap();
    assert_eq!(closed.exit_reason.as_deref(), Some("aged_grace"));
}

#[tokio::test]
async fn test_permanent_rejection_keeps_position_open_and_tracked() {
    let (store, exchange, engine, position) = setup().await;
    exchange.fail_orders(
        StubOrderKind::Market,
        [ExecError::SymbolUnavailable("ETHUSDT delisted".into())],
    );

    let outcome = engine.monitor.close_position(position.id, Price::new(dec!(2490)).unwrap()).await;

    assert_eq!(outcome, CloseOutcome::Failed);
    assert!(exchange.placed_orders().is_empty());
    assert!(store.positions().find_by_id(position.id).await.unwrap().unwrap().is_active());
    assert!(engine.monitor.target(position.id).await.is_some());

    let failed = store.events().find_by_type("close_order_failed").await.unwrap();
    assert!(matches!(&failed[..], [EngineEvent::CloseOrderFailed { attempts: 1, .. }]));
    assert_eq!(engine.executor.stats().permanent_failures, 1);
}
