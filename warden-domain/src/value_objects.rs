//! Value Objects for the Warden domain
//!
//! Immutable, validated domain primitives.
//! All value objects enforce invariants at construction time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Price must be positive
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    /// Quantity must be positive
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Symbol must be valid trading pair
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Exchange identifier must be non-empty
    #[error("Invalid exchange: {0}")]
    InvalidExchange(String),

    /// Unknown enum spelling (side, status, phase)
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Aged policy parameters are inconsistent
    #[error("Invalid aged policy: {0}")]
    InvalidPolicy(String),

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

// =============================================================================
// Price
// =============================================================================

/// Price represents a positive decimal price
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    /// Create a new Price with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPrice` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidPrice(format!("Price must be positive, got {}", value)));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Quantity
// =============================================================================

/// Quantity represents a positive decimal position size (contracts)
///
/// # Invariants
/// - Must be > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Create a new Quantity with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidQuantity` if value <= 0
    pub fn new(value: Decimal) -> Result<Self, DomainError> {
        if value <= Decimal::ZERO {
            return Err(DomainError::InvalidQuantity(format!(
                "Quantity must be positive, got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    /// Get the underlying Decimal value
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// True when `other` differs from this quantity by more than `tolerance`
    pub fn differs_from(&self, other: Decimal, tolerance: Decimal) -> bool {
        (self.0 - other).abs() > tolerance
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Symbol
// =============================================================================

/// Symbol represents a perpetual trading pair (e.g., BTCUSDT)
///
/// Accepts the compact exchange spelling (`BTCUSDT`) as well as the unified
/// `BASE/QUOTE` and `BASE/QUOTE:SETTLE` spellings. Serialized as the compact pair.
///
/// # Invariants
/// - Base and quote must be non-empty, upper-case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Quote currencies recognised when parsing compact pairs, longest match first
    const QUOTE_CURRENCIES: &'static [&'static str] = &["USDT", "USDC", "BUSD", "USD", "BTC", "ETH"];

    /// Create a Symbol from a trading pair string
    ///
    /// # Examples
    /// ```
    /// # use warden_domain::value_objects::Symbol;
    /// let symbol = Symbol::from_pair("BTCUSDT").unwrap();
    /// assert_eq!(symbol.base(), "BTC");
    /// assert_eq!(symbol.quote(), "USDT");
    ///
    /// let unified = Symbol::from_pair("btc/usdt:USDT").unwrap();
    /// assert_eq!(unified, symbol);
    /// ```
    ///
    /// # Errors
    /// Returns `DomainError::InvalidSymbol` if format is invalid
    pub fn from_pair(pair: &str) -> Result<Self, DomainError> {
        let normalized = pair.trim().to_uppercase();
        let without_settle = normalized.split(':').next().unwrap_or_default();

        if let Some((base, quote)) = without_settle.split_once('/') {
            return Self::new(base.to_string(), quote.to_string());
        }

        for quote in Self::QUOTE_CURRENCIES {
            if let Some(base) = without_settle.strip_suffix(quote) {
                if !base.is_empty() {
                    return Self::new(base.to_string(), quote.to_string());
                }
            }
        }

        Err(DomainError::InvalidSymbol(format!("Cannot parse trading pair: {}", pair)))
    }

    /// Create a Symbol from explicit base and quote
    pub fn new(base: String, quote: String) -> Result<Self, DomainError> {
        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        if base.is_empty() || quote.is_empty() {
            return Err(DomainError::InvalidSymbol("Base and quote must be non-empty".to_string()));
        }
        Ok(Self { base, quote })
    }

    /// Get the base currency
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Get the quote currency
    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Get the trading pair as string (e.g., "BTCUSDT")
    pub fn as_pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

impl FromStr for Symbol {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_pair(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_pair(&value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.as_pair()
    }
}

// =============================================================================
// ExchangeId
// =============================================================================

/// Identifier of an exchange account (e.g., "binance", "bybit")
///
/// Normalised to lower case so that lookups are spelling-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    /// Create an ExchangeId
    ///
    /// # Errors
    /// Returns `DomainError::InvalidExchange` if the name is blank or contains
    /// characters other than ASCII alphanumerics, `-` and `_`
    pub fn new(name: &str) -> Result<Self, DomainError> {
        let normalized = name.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(DomainError::InvalidExchange("Exchange name must be non-empty".to_string()));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(DomainError::InvalidExchange(format!(
                "Exchange name has invalid characters: {}",
                name
            )));
        }
        Ok(Self(normalized))
    }

    /// Build from a literal known to be a valid exchange name
    pub fn from_static(name: &'static str) -> Self {
        debug_assert!(!name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase()));
        Self(name.to_string())
    }

    /// Borrow as &str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ExchangeId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// =============================================================================
// Side
// =============================================================================

/// Side represents the position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Long position (buy low, sell high)
    Long,
    /// Short position (sell high, buy low)
    Short,
}

impl Side {
    /// Get the exit action for this side
    ///
    /// Long → Sell, Short → Buy
    pub fn exit_action(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    /// Storage spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// Signed PnL percentage of moving from `entry` to `price`
    ///
    /// Positive when the move favours the position.
    pub fn pnl_percent(&self, entry: Decimal, price: Decimal) -> Decimal {
        if entry.is_zero() {
            return Decimal::ZERO;
        }
        let raw = (price - entry) / entry * Decimal::ONE_HUNDRED;
        match self {
            Side::Long => raw,
            Side::Short => -raw,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(DomainError::InvalidValue(format!("Unknown side: {}", other))),
        }
    }
}

/// OrderSide represents the order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    /// Buy order
    Buy,
    /// Sell order
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_validation() {
        assert!(Price::new(dec!(100.0)).is_ok());
        assert!(Price::new(dec!(0.00012345)).is_ok());
        assert!(Price::new(dec!(-1.0)).is_err());
        assert!(Price::new(dec!(0.0)).is_err());
    }

    #[test]
    fn test_quantity_validation() {
        assert!(Quantity::new(dec!(0.001)).is_ok());
        assert!(Quantity::new(dec!(0)).is_err());
        assert!(Quantity::new(dec!(-0.1)).is_err());
    }

    #[test]
    fn test_quantity_differs_from() {
        let qty = Quantity::new(dec!(1.00)).unwrap();
        assert!(!qty.differs_from(dec!(1.01), dec!(0.01)));
        assert!(qty.differs_from(dec!(1.02), dec!(0.01)));
        assert!(qty.differs_from(dec!(0.5), dec!(0.01)));
    }

    #[test]
    fn test_symbol_spellings() {
        let compact = Symbol::from_pair("BTCUSDT").unwrap();
        assert_eq!(compact.base(), "BTC");
        assert_eq!(compact.quote(), "USDT");

        assert_eq!(Symbol::from_pair("BTC/USDT").unwrap(), compact);
        assert_eq!(Symbol::from_pair("BTC/USDT:USDT").unwrap(), compact);
        assert_eq!(Symbol::from_pair("ethusdc").unwrap().as_pair(), "ETHUSDC");
    }

    #[test]
    fn test_symbol_invalid() {
        assert!(Symbol::from_pair("INVALID").is_err());
        assert!(Symbol::from_pair("").is_err());
        assert!(Symbol::from_pair("/USDT").is_err());
    }

    #[test]
    fn test_symbol_serializes_as_pair() {
        let symbol = Symbol::from_pair("SOL/USDT:USDT").unwrap();
        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"SOLUSDT\"");

        let back: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, symbol);
    }

    #[test]
    fn test_exchange_id_normalized() {
        let id = ExchangeId::new(" Binance ").unwrap();
        assert_eq!(id.as_str(), "binance");
        assert!(ExchangeId::new("  ").is_err());
    }

    #[test]
    fn test_side_parsing_and_exit() {
        assert_eq!("LONG".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Short);
        assert!("flat".parse::<Side>().is_err());
        assert_eq!(Side::Long.exit_action(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_action(), OrderSide::Buy);
    }

    #[test]
    fn test_pnl_percent_by_side() {
        assert_eq!(Side::Long.pnl_percent(dec!(100), dec!(110)), dec!(10));
        assert_eq!(Side::Short.pnl_percent(dec!(100), dec!(110)), dec!(-10));
        assert_eq!(Side::Short.pnl_percent(dec!(100), dec!(95)), dec!(5));
    }
}
