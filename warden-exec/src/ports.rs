//! Execution layer port definitions.
//!
//! `ExchangePort` is the capability interface over one exchange account.
//! Adapters implement it for specific venues; `StubExchange` implements it
//! for tests and stub mode.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use warden_domain::{ExchangeId, OrderSide, Side, Symbol};

use crate::error::ExecError;

// =============================================================================
// Exchange Port
// =============================================================================

/// Port for one exchange account.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Exchange this gateway talks to
    fn id(&self) -> &ExchangeId;

    /// Open positions as reported by the exchange.
    ///
    /// Entries may carry zero contracts; callers filter them.
    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExecError>;

    /// Resting orders, optionally for a single symbol.
    async fn fetch_open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<OpenOrder>, ExecError>;

    /// Place an order.
    async fn create_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExecError>;

    /// Cancel an existing order.
    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExecError>;

    /// Latest trade price.
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker, ExecError>;

    /// Top `depth` levels of the order book.
    async fn fetch_order_book(&self, symbol: &Symbol, depth: usize)
        -> Result<OrderBook, ExecError>;
}

/// Gateways keyed by exchange
pub type Gateways = HashMap<ExchangeId, Arc<dyn ExchangePort>>;

// =============================================================================
// Exchange-side records
// =============================================================================

/// Position as reported by an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Trading pair
    pub symbol: Symbol,
    /// Direction
    pub side: Side,
    /// Normalised quantity
    pub contracts: Decimal,
    /// Average entry price
    pub entry_price: Decimal,
    /// Raw quantity from the exchange payload (e.g. `positionAmt`), if present
    pub native_quantity: Option<Decimal>,
    /// Exchange-native identifier (position or order id), if present
    pub exchange_position_id: Option<String>,
}

impl ExchangePosition {
    /// Position with matching native quantity and no identifier
    pub fn new(symbol: Symbol, side: Side, contracts: Decimal, entry_price: Decimal) -> Self {
        Self {
            symbol,
            side,
            contracts,
            entry_price,
            native_quantity: Some(contracts),
            exchange_position_id: None,
        }
    }

    /// Attach the exchange-native identifier
    pub fn with_exchange_id(mut self, id: impl Into<String>) -> Self {
        self.exchange_position_id = Some(id.into());
        self
    }

    /// Override the raw native quantity
    pub fn with_native_quantity(mut self, quantity: Option<Decimal>) -> Self {
        self.native_quantity = quantity;
        self
    }

    /// Normalised quantity is nonzero but the raw payload says zero.
    ///
    /// Seen when an exchange serves a cached position that was already closed.
    pub fn is_stale_cache(&self) -> bool {
        !self.contracts.is_zero() && matches!(self.native_quantity, Some(q) if q.is_zero())
    }
}

/// Resting order on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    /// Exchange order id
    pub id: String,
    /// Trading pair
    pub symbol: Symbol,
    /// Buy or sell
    pub side: OrderSide,
    /// Order type
    pub kind: OrderKind,
    /// Remaining amount
    pub amount: Decimal,
    /// Limit price
    pub price: Option<Decimal>,
    /// Whether the order can only reduce a position
    pub reduce_only: bool,
}

/// Last trade summary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    /// Last traded price
    pub last: Decimal,
}

/// One price level of an order book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price
    pub price: Decimal,
    /// Amount available at that price
    pub amount: Decimal,
}

/// Order book snapshot, best levels first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    /// Buy side, descending price
    pub bids: Vec<BookLevel>,
    /// Sell side, ascending price
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Highest bid
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Lowest ask
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// No levels on either side
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

// =============================================================================
// Orders
// =============================================================================

/// Order type sent to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    /// Market order
    Market,
    /// Limit order
    Limit,
}

/// Time in force for limit orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good till cancelled
    Gtc,
    /// Immediate or cancel
    Ioc,
}

/// Order placement request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Trading pair
    pub symbol: Symbol,
    /// Market or limit
    pub kind: OrderKind,
    /// Buy or sell
    pub side: OrderSide,
    /// Amount in base units
    pub amount: Decimal,
    /// Limit price (limit orders only)
    pub price: Option<Decimal>,
    /// Only reduce an existing position
    pub reduce_only: bool,
    /// Reject if the order would take liquidity
    pub post_only: bool,
    /// Time in force
    pub time_in_force: Option<TimeInForce>,
}

impl OrderRequest {
    /// Reduce-only market order
    pub fn market_close(symbol: Symbol, side: OrderSide, amount: Decimal) -> Self {
        Self {
            symbol,
            kind: OrderKind::Market,
            side,
            amount,
            price: None,
            reduce_only: true,
            post_only: false,
            time_in_force: None,
        }
    }

    /// Reduce-only limit order
    pub fn limit_close(symbol: Symbol, side: OrderSide, amount: Decimal, price: Decimal) -> Self {
        Self {
            symbol,
            kind: OrderKind::Limit,
            side,
            amount,
            price: Some(price),
            reduce_only: true,
            post_only: false,
            time_in_force: Some(TimeInForce::Gtc),
        }
    }

    /// Set immediate-or-cancel
    pub fn ioc(mut self) -> Self {
        self.time_in_force = Some(TimeInForce::Ioc);
        self
    }

    /// Set post-only
    pub fn post_only(mut self) -> Self {
        self.post_only = true;
        self
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {} {}", self.kind, self.side, self.amount, self.symbol)?;
        if let Some(price) = self.price {
            write!(f, " @ {}", price)?;
        }
        Ok(())
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    /// Exchange order id
    pub id: String,
    /// Average fill price, if filled
    pub average_price: Option<Decimal>,
    /// Filled amount
    pub filled: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::from_pair("BTCUSDT").unwrap()
    }

    #[test]
    fn test_stale_cache_guard() {
        let pos = ExchangePosition::new(btc(), Side::Long, dec!(0.5), dec!(42000));
        assert!(!pos.is_stale_cache());

        let cached = pos.clone().with_native_quantity(Some(dec!(0)));
        assert!(cached.is_stale_cache());

        // no raw field to compare against
        let unknown = pos.with_native_quantity(None);
        assert!(!unknown.is_stale_cache());
    }

    #[test]
    fn test_book_best_levels() {
        let book = OrderBook {
            bids: vec![
                BookLevel { price: dec!(99), amount: dec!(1) },
                BookLevel { price: dec!(98), amount: dec!(2) },
            ],
            asks: vec![BookLevel { price: dec!(101), amount: dec!(1) }],
        };
        assert_eq!(book.best_bid(), Some(dec!(99)));
        assert_eq!(book.best_ask(), Some(dec!(101)));
        assert!(!book.is_empty());
        assert!(OrderBook::default().is_empty());
    }

    #[test]
    fn test_close_requests_are_reduce_only() {
        let market = OrderRequest::market_close(btc(), OrderSide::Sell, dec!(1));
        assert!(market.reduce_only);
        assert_eq!(market.price, None);

        let maker = OrderRequest::limit_close(btc(), OrderSide::Buy, dec!(1), dec!(100)).post_only();
        assert!(maker.reduce_only && maker.post_only);
        assert_eq!(maker.to_string(), "Limit BUY 1 BTCUSDT @ 100");
    }
}
