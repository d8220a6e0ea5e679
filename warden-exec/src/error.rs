//! Execution layer error types and failure classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use warden_domain::ExchangeId;

/// Errors that can occur during execution operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Account cannot cover the order
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Symbol suspended, delisted or unknown to the exchange
    #[error("Symbol unavailable: {0}")]
    SymbolUnavailable(String),

    /// Price outside the exchange's accepted band or precision
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    /// Order was rejected by exchange business rules
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// Exchange throttled the request
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout waiting for operation
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Order accepted but left part of the amount open
    #[error("Order not filled: {0}")]
    Unfilled(String),

    /// Exchange error that did not map to a known kind
    #[error("Exchange error: {message}")]
    Exchange {
        /// Exchange-native error code, if any
        code: Option<String>,
        /// Exchange message
        message: String,
    },

    /// Pre-placement check failed (empty book, non-positive ticker)
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// No gateway configured for the exchange
    #[error("Unknown exchange: {0}")]
    UnknownExchange(ExchangeId),

    /// Operation interrupted by shutdown
    #[error("Cancelled")]
    Cancelled,

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] warden_store::StoreError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] warden_domain::DomainError),
}

/// Result type for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;

/// How a failure affects the close cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retrying cannot help; abort the cascade
    Permanent,
    /// Back off for the fixed cooldown
    RateLimited,
    /// Exponential backoff
    Transient,
    /// Treated as transient
    Unknown,
    /// Checked before reaching the exchange; next order type
    Validation,
}

impl ErrorClass {
    /// Snake-case name used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Permanent => "permanent",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Transient => "transient",
            ErrorClass::Unknown => "unknown",
            ErrorClass::Validation => "validation",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExecError {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExecError::InsufficientFunds(_)
            | ExecError::SymbolUnavailable(_)
            | ExecError::InvalidPrice(_)
            | ExecError::OrderRejected(_)
            | ExecError::UnknownExchange(_)
            | ExecError::Cancelled
            | ExecError::Domain(_) => ErrorClass::Permanent,
            ExecError::RateLimited(_) => ErrorClass::RateLimited,
            ExecError::Network(_) | ExecError::Timeout(_) | ExecError::Unfilled(_) => {
                ErrorClass::Transient
            },
            ExecError::Precondition(_) => ErrorClass::Validation,
            ExecError::Exchange { code, message } => {
                let code_class = code.as_deref().map(classify_message);
                match code_class {
                    Some(class) if class != ErrorClass::Unknown => class,
                    _ => classify_message(message),
                }
            },
            ExecError::Store(_) => ErrorClass::Unknown,
        }
    }

    /// Short machine-readable code for results and events.
    pub fn error_code(&self) -> String {
        match self {
            ExecError::InsufficientFunds(_) => "insufficient_funds".to_string(),
            ExecError::SymbolUnavailable(_) => "symbol_unavailable".to_string(),
            ExecError::InvalidPrice(_) => "invalid_price".to_string(),
            ExecError::OrderRejected(_) => "order_rejected".to_string(),
            ExecError::RateLimited(_) => "rate_limited".to_string(),
            ExecError::Network(_) => "network".to_string(),
            ExecError::Timeout(_) => "timeout".to_string(),
            ExecError::Unfilled(_) => "unfilled".to_string(),
            ExecError::Exchange { code: Some(code), .. } => code.clone(),
            ExecError::Exchange { code: None, .. } => "exchange".to_string(),
            ExecError::Precondition(_) => "precondition".to_string(),
            ExecError::UnknownExchange(_) => "unknown_exchange".to_string(),
            ExecError::Cancelled => "cancelled".to_string(),
            ExecError::Store(_) => "store".to_string(),
            ExecError::Domain(_) => "domain".to_string(),
        }
    }
}

/// Classify a free-form exchange message (or native code) by substring.
///
/// Codes follow the Binance numbering (`-2019` margin insufficient, `-1121`
/// invalid symbol, `-1003` too many requests); other venues are matched on
/// their English messages.
pub fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["insufficient", "-2019", "margin is insufficient"]) {
        ErrorClass::Permanent
    } else if has(&["suspended", "delisted", "-1121", "invalid symbol", "not trading"]) {
        ErrorClass::Permanent
    } else if has(&["invalid price", "price filter", "-1013", "reduceonly order is rejected"]) {
        ErrorClass::Permanent
    } else if has(&["rate limit", "too many requests", "429", "-1003", "ratelimit"]) {
        ErrorClass::RateLimited
    } else if has(&["timeout", "timed out", "network", "connection", "502", "503", "504"]) {
        ErrorClass::Transient
    } else {
        ErrorClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_errors_classify() {
        assert_eq!(ExecError::InsufficientFunds("x".into()).class(), ErrorClass::Permanent);
        assert_eq!(ExecError::RateLimited("x".into()).class(), ErrorClass::RateLimited);
        assert_eq!(ExecError::Timeout("x".into()).class(), ErrorClass::Transient);
        assert_eq!(ExecError::Unfilled("x".into()).class(), ErrorClass::Transient);
        assert_eq!(ExecError::Precondition("empty book".into()).class(), ErrorClass::Validation);
        assert_eq!(ExecError::Cancelled.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_exchange_messages_classify() {
        let err = |message: &str| ExecError::Exchange { code: None, message: message.into() };

        assert_eq!(err("Account has insufficient balance").class(), ErrorClass::Permanent);
        assert_eq!(err("Symbol is delisted").class(), ErrorClass::Permanent);
        assert_eq!(err("HTTP 429 Too Many Requests").class(), ErrorClass::RateLimited);
        assert_eq!(err("Connection reset by peer").class(), ErrorClass::Transient);
        assert_eq!(err("something odd happened").class(), ErrorClass::Unknown);
    }

    #[test]
    fn test_native_code_wins_over_message() {
        let err = ExecError::Exchange {
            code: Some("-2019".to_string()),
            message: "request failed".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(err.error_code(), "-2019");

        let err = ExecError::Exchange {
            code: Some("E42".to_string()),
            message: "gateway timeout".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
