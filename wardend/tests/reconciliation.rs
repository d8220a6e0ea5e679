//! Reconciliation properties: idempotence and the single-active-position
//! guarantee under concurrent writers.

use std::sync::Arc;

use rust_decimal_macros::dec;
use warden_domain::{ExchangeId, Position, Price, Quantity, Side, Symbol};
use warden_exec::{ExchangePort, ExchangePosition, Gateways, StoreEventSink, StubExchange};
use warden_store::{insert_active_exclusive, InsertOutcome, MemoryStore, Store};
use wardend::{PositionSynchronizer, SyncConfig};

fn btc() -> Symbol {
    Symbol::from_pair("BTCUSDT").unwrap()
}

fn binance() -> ExchangeId {
    ExchangeId::new("binance").unwrap()
}

fn synchronizer(
    store: Arc<MemoryStore>,
    exchange: Arc<StubExchange>,
) -> Arc<PositionSynchronizer<MemoryStore>> {
    let mut gateways = Gateways::new();
    gateways.insert(binance(), exchange as Arc<dyn ExchangePort>);
    Arc::new(PositionSynchronizer::new(
        SyncConfig::default(),
        gateways,
        store.clone(),
        Arc::new(StoreEventSink::new(store)),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_passes_adopt_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let exchange = Arc::new(StubExchange::new(binance()));
    exchange.add_position(
        ExchangePosition::new(btc(), Side::Long, dec!(0.5), dec!(42000)).with_exchange_id("7781"),
    );

    // independent synchronizers share nothing but the store
    let first = synchronizer(store.clone(), exchange.clone());
    let second = synchronizer(store.clone(), exchange.clone());
    let a = tokio::spawn(async move { first.synchronize_exchange(&binance()).await });
    let b = tokio::spawn(async move { second.synchronize_exchange(&binance()).await });
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    assert_eq!(a.added + b.added, 1);
    assert_eq!(a.already_present + b.already_present, 1);
    assert_eq!(store.position_count().await, 1);
    let added = store.events().find_by_type("missing_position_added").await.unwrap();
    assert_eq!(added.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_guarded_insert_is_unique_under_contention() {
    let store = Arc::new(MemoryStore::new());

    let mut handles = Vec::new();
    for n in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let position = Position::new_active(
                btc(),
                binance(),
                Side::Long,
                Quantity::new(dec!(1)).unwrap(),
                Price::new(dec!(42000)).unwrap(),
                format!("ord-{}", n),
            );
            insert_active_exclusive(store.as_ref(), &position).await.unwrap()
        }));
    }

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() == InsertOutcome::Inserted {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(store.positions().find_active().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_passes_without_exchange_change_are_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let exchange = Arc::new(StubExchange::new(binance()));
    exchange.set_positions(vec![
        ExchangePosition::new(btc(), Side::Long, dec!(0.5), dec!(42000)).with_exchange_id("1"),
        ExchangePosition::new(Symbol::from_pair("ETH/USDT:USDT").unwrap(), Side::Short, dec!(4), dec!(2500))
            .with_exchange_id("2"),
        // no native id: rejected, never adopted
        ExchangePosition::new(Symbol::from_pair("SOLUSDT").unwrap(), Side::Long, dec!(10), dec!(20)),
        // cached entry whose raw quantity is zero
        ExchangePosition::new(Symbol::from_pair("XRPUSDT").unwrap(), Side::Long, dec!(50), dec!(1))
            .with_exchange_id("4")
            .with_native_quantity(Some(dec!(0))),
    ]);
    let sync = synchronizer(store.clone(), exchange);

    let first = sync.synchronize_exchange(&binance()).await.unwrap();
    assert_eq!((first.added, first.rejected), (2, 2));
    let snapshot = store.positions().find_active().await.unwrap();
    let events_after_first = store.events().count().await.unwrap();

    for _ in 0..3 {
        let report = sync.synchronize_exchange(&binance()).await.unwrap();
        assert_eq!(
            (report.added, report.corrected, report.closed_phantom, report.rejected, report.verified),
            (0, 0, 0, 0, 0)
        );
    }

    let mut after = store.positions().find_active().await.unwrap();
    let mut before = snapshot;
    after.sort_by_key(|p| p.id);
    before.sort_by_key(|p| p.id);
    assert_eq!(after, before);
    // only the started/completed pair per pass
    assert_eq!(store.events().count().await.unwrap(), events_after_first + 6);
    assert_eq!(store.events().find_by_type("missing_position_rejected").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_one_failing_exchange_does_not_stop_the_others() {
    let store = Arc::new(MemoryStore::new());
    let healthy = Arc::new(StubExchange::new(binance()));
    healthy.add_position(
        ExchangePosition::new(btc(), Side::Long, dec!(1), dec!(42000)).with_exchange_id("h-1"),
    );
    let bybit = ExchangeId::new("bybit").unwrap();
    let failing = Arc::new(StubExchange::new(bybit.clone()));
    failing.fail_fetch_positions(warden_exec::ExecError::Network("reset".into()));

    let mut gateways = Gateways::new();
    gateways.insert(binance(), healthy as Arc<dyn ExchangePort>);
    gateways.insert(bybit, failing as Arc<dyn ExchangePort>);
    let sync = PositionSynchronizer::new(
        SyncConfig::default(),
        gateways,
        store.clone(),
        Arc::new(StoreEventSink::new(store.clone())),
    );

    let results = sync.synchronize_all().await;

    assert_eq!(results.len(), 2);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(store.position_count().await, 1);
}
