//! Stub exchange for tests and stub mode.
//!
//! Holds positions, tickers and order books in memory and fills every order
//! it accepts in full. Failures and short fills are scripted per order kind
//! so the close cascade can be driven through any path.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use warden_domain::{ExchangeId, Symbol};

use crate::error::ExecError;
use crate::ports::{
    ExchangePort, ExchangePosition, OpenOrder, OrderBook, OrderKind, OrderRequest, PlacedOrder,
    Ticker, TimeInForce,
};

/// Order shape used to script failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubOrderKind {
    /// Market order
    Market,
    /// Immediate-or-cancel limit order
    LimitIoc,
    /// Post-only limit order
    LimitPostOnly,
}

impl StubOrderKind {
    fn of(request: &OrderRequest) -> Self {
        match (request.kind, request.post_only, request.time_in_force) {
            (OrderKind::Market, _, _) => StubOrderKind::Market,
            (OrderKind::Limit, true, _) => StubOrderKind::LimitPostOnly,
            (OrderKind::Limit, false, Some(TimeInForce::Ioc)) => StubOrderKind::LimitIoc,
            // plain GTC limits share the IOC script
            (OrderKind::Limit, false, _) => StubOrderKind::LimitIoc,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory exchange.
pub struct StubExchange {
    id: ExchangeId,
    positions: RwLock<Vec<ExchangePosition>>,
    open_orders: RwLock<Vec<OpenOrder>>,
    tickers: RwLock<HashMap<Symbol, Decimal>>,
    books: RwLock<HashMap<Symbol, OrderBook>>,
    order_failures: Mutex<HashMap<StubOrderKind, VecDeque<ExecError>>>,
    order_fills: Mutex<HashMap<StubOrderKind, VecDeque<Decimal>>>,
    position_failures: Mutex<VecDeque<ExecError>>,
    placed: Mutex<Vec<OrderRequest>>,
    cancelled: Mutex<Vec<String>>,
    order_counter: AtomicU64,
    fetch_positions_calls: AtomicU64,
}

impl StubExchange {
    /// Empty exchange
    pub fn new(id: ExchangeId) -> Self {
        Self {
            id,
            positions: RwLock::new(Vec::new()),
            open_orders: RwLock::new(Vec::new()),
            tickers: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            order_failures: Mutex::new(HashMap::new()),
            order_fills: Mutex::new(HashMap::new()),
            position_failures: Mutex::new(VecDeque::new()),
            placed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            order_counter: AtomicU64::new(0),
            fetch_positions_calls: AtomicU64::new(0),
        }
    }

    /// Replace the reported positions
    pub fn set_positions(&self, positions: Vec<ExchangePosition>) {
        *write(&self.positions) = positions;
    }

    /// Add one reported position
    pub fn add_position(&self, position: ExchangePosition) {
        write(&self.positions).push(position);
    }

    /// Remove every reported position for `symbol`
    pub fn remove_position(&self, symbol: &Symbol) {
        write(&self.positions).retain(|p| &p.symbol != symbol);
    }

    /// Currently reported positions
    pub fn positions(&self) -> Vec<ExchangePosition> {
        read(&self.positions).clone()
    }

    /// Set the last trade price for `symbol`
    pub fn set_ticker(&self, symbol: &Symbol, last: Decimal) {
        write(&self.tickers).insert(symbol.clone(), last);
    }

    /// Set the order book for `symbol`
    pub fn set_order_book(&self, symbol: &Symbol, book: OrderBook) {
        write(&self.books).insert(symbol.clone(), book);
    }

    /// Add a resting order
    pub fn add_open_order(&self, order: OpenOrder) {
        write(&self.open_orders).push(order);
    }

    /// Fail the next orders of `kind` with `errors`, in order
    pub fn fail_orders(&self, kind: StubOrderKind, errors: impl IntoIterator<Item = ExecError>) {
        lock(&self.order_failures).entry(kind).or_default().extend(errors);
    }

    /// Fill the next accepted orders of `kind` with these amounts instead of
    /// in full (zero leaves the order unfilled)
    pub fn fill_orders(&self, kind: StubOrderKind, fills: impl IntoIterator<Item = Decimal>) {
        lock(&self.order_fills).entry(kind).or_default().extend(fills);
    }

    /// Fail the next `fetch_positions` call
    pub fn fail_fetch_positions(&self, error: ExecError) {
        lock(&self.position_failures).push_back(error);
    }

    /// Every order request that reached `create_order` and was accepted
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        lock(&self.placed).clone()
    }

    /// Ids passed to `cancel_order` that matched a resting order
    pub fn cancelled_orders(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    /// Number of `fetch_positions` calls so far
    pub fn fetch_positions_calls(&self) -> u64 {
        self.fetch_positions_calls.load(Ordering::Relaxed)
    }

    fn next_order_id(&self) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("STUB-{}", n)
    }

    fn take_failure(&self, kind: StubOrderKind) -> Option<ExecError> {
        lock(&self.order_failures).get_mut(&kind).and_then(VecDeque::pop_front)
    }

    fn take_fill(&self, kind: StubOrderKind) -> Option<Decimal> {
        lock(&self.order_fills).get_mut(&kind).and_then(VecDeque::pop_front)
    }

    /// Shrink the position an exit order closes against.
    fn apply_reduce_only(&self, request: &OrderRequest, filled: Decimal) {
        let mut positions = write(&self.positions);
        if let Some(pos) = positions
            .iter_mut()
            .find(|p| p.symbol == request.symbol && p.side.exit_action() == request.side)
        {
            pos.contracts = (pos.contracts - filled).max(Decimal::ZERO);
            pos.native_quantity = Some(pos.contracts);
        }
        positions.retain(|p| !p.contracts.is_zero());
    }
}

#[async_trait]
impl ExchangePort for StubExchange {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExecError> {
        self.fetch_positions_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = lock(&self.position_failures).pop_front() {
            return Err(err);
        }
        Ok(read(&self.positions).clone())
    }

    async fn fetch_open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OpenOrder>, ExecError> {
        Ok(read(&self.open_orders)
            .iter()
            .filter(|o| symbol.map_or(true, |s| &o.symbol == s))
            .cloned()
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExecError> {
        let kind = StubOrderKind::of(request);
        if let Some(err) = self.take_failure(kind) {
            return Err(err);
        }
        let filled = self.take_fill(kind).map_or(request.amount, |f| f.min(request.amount));

        let average_price = match request.kind {
            OrderKind::Market => read(&self.tickers).get(&request.symbol).copied(),
            OrderKind::Limit => request.price,
        };
        let id = self.next_order_id();

        lock(&self.placed).push(request.clone());
        if request.reduce_only {
            self.apply_reduce_only(request, filled);
        }
        tracing::debug!(order_id = %id, %request, %filled, "Stub: order accepted");

        Ok(PlacedOrder { id, average_price, filled })
    }

    async fn cancel_order(&self, _symbol: &Symbol, order_id: &str) -> Result<(), ExecError> {
        let mut orders = write(&self.open_orders);
        let before = orders.len();
        orders.retain(|o| o.id != order_id);
        if orders.len() == before {
            return Err(ExecError::OrderRejected(format!("unknown order {}", order_id)));
        }
        lock(&self.cancelled).push(order_id.to_string());
        Ok(())
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExecError> {
        read(&self.tickers)
            .get(symbol)
            .map(|last| Ticker { last: *last })
            .ok_or_else(|| ExecError::SymbolUnavailable(symbol.to_string()))
    }

    async fn fetch_order_book(
        &self,
        symbol: &Symbol,
        depth: usize,
    ) -> Result<OrderBook, ExecError> {
        let mut book = read(&self.books).get(symbol).cloned().unwrap_or_default();
        book.bids.truncate(depth);
        book.asks.truncate(depth);
        Ok(book)
    }
}
