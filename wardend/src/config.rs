//! Daemon configuration.
//!
//! Loads configuration from `WARDEN_*` environment variables with sensible
//! defaults.

use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use warden_domain::{AgedPolicy, ExchangeId};
use warden_exec::{CloseConfig, RetryPolicy};

use crate::error::{DaemonError, DaemonResult};

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,
    /// Reconciliation loop
    pub sync: SyncConfig,
    /// Aged-position monitor
    pub aged: AgedConfig,
    /// Close executor
    pub executor: CloseConfig,
    /// Price bus
    pub price_bus: PriceBusConfig,
    /// Exchanges to manage
    pub exchanges: Vec<ExchangeId>,
    /// Environment (test, development, production)
    pub environment: Environment,
    /// PostgreSQL connection string (feature `postgres`)
    pub database_url: Option<String>,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Reconciliation configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time between passes
    pub interval: Duration,
    /// Quantity difference tolerated before a correction
    pub quantity_tolerance: Decimal,
}

/// Aged-position monitor configuration.
#[derive(Debug, Clone)]
pub struct AgedConfig {
    /// Liquidation policy
    pub policy: AgedPolicy,
    /// Full scan interval
    pub scan_interval: Duration,
    /// Exchange validation interval
    pub validation_interval: Duration,
    /// Quantity difference tolerated by the pre-close check
    pub quantity_tolerance: Decimal,
}

/// Price bus configuration.
#[derive(Debug, Clone)]
pub struct PriceBusConfig {
    /// Minimum time between dispatches for one symbol
    pub min_dispatch_interval: Duration,
    /// Staleness threshold for modules without their own
    pub default_stale_after: Duration,
    /// Staleness threshold for the aged-position module
    pub aged_stale_after: Duration,
    /// Health loop period
    pub health_interval: Duration,
    /// Per-subscription queue size
    pub channel_capacity: usize,
    /// Resubscription attempts per stale symbol
    pub max_resubscribe_attempts: u32,
    /// How long to wait for a real tick after resubscribing
    pub resubscribe_wait: Duration,
    /// First backoff between resubscription attempts
    pub resubscribe_backoff: Duration,
    /// Resubscriptions within `resubscribe_window` that trigger an alert
    pub resubscribe_alert_threshold: usize,
    /// Sliding window for the resubscription rate alert
    pub resubscribe_window: Duration,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            quantity_tolerance: Decimal::new(1, 2), // 0.01
        }
    }
}

impl Default for AgedConfig {
    fn default() -> Self {
        Self {
            policy: AgedPolicy::default(),
            scan_interval: Duration::from_secs(60),
            validation_interval: Duration::from_secs(300),
            quantity_tolerance: Decimal::new(1, 2),
        }
    }
}

impl Default for PriceBusConfig {
    fn default() -> Self {
        Self {
            min_dispatch_interval: Duration::from_millis(100),
            default_stale_after: Duration::from_secs(300),
            aged_stale_after: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
            channel_capacity: 64,
            max_resubscribe_attempts: 3,
            resubscribe_wait: Duration::from_secs(10),
            resubscribe_backoff: Duration::from_secs(1),
            resubscribe_alert_threshold: 10,
            resubscribe_window: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let api = Self::load_api_config()?;
        let exchanges = Self::load_exchanges()?;
        let sync = Self::load_sync_config()?;
        let aged = Self::load_aged_config()?;
        let executor = Self::load_executor_config()?;
        let price_bus = Self::load_price_bus_config()?;

        Ok(Self {
            api,
            sync,
            aged,
            executor,
            price_bus,
            exchanges,
            environment,
            database_url: env::var("DATABASE_URL").ok(),
        })
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            sync: SyncConfig { interval: Duration::from_secs(1), ..SyncConfig::default() },
            aged: AgedConfig {
                scan_interval: Duration::from_secs(1),
                validation_interval: Duration::from_secs(1),
                ..AgedConfig::default()
            },
            executor: CloseConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    rate_limit_cooldown: Duration::from_millis(50),
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(40),
                },
                ..CloseConfig::default()
            },
            price_bus: PriceBusConfig {
                min_dispatch_interval: Duration::ZERO,
                resubscribe_wait: Duration::from_millis(200),
                resubscribe_backoff: Duration::from_millis(10),
                ..PriceBusConfig::default()
            },
            exchanges: vec![default_exchange()],
            environment: Environment::Test,
            database_url: None,
        }
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid WARDEN_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config() -> DaemonResult<ApiConfig> {
        let host = env::var("WARDEN_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port_str = env::var("WARDEN_API_PORT").unwrap_or_else(|_| "8080".to_string());

        let port = port_str
            .parse::<u16>()
            .map_err(|_| DaemonError::Config(format!("Invalid WARDEN_API_PORT: {}", port_str)))?;

        Ok(ApiConfig { host, port })
    }

    fn load_exchanges() -> DaemonResult<Vec<ExchangeId>> {
        let raw = env::var("WARDEN_EXCHANGES").unwrap_or_else(|_| "binance".to_string());
        let exchanges = parse_exchange_list(&raw)?;
        if exchanges.is_empty() {
            return Err(DaemonError::Config("WARDEN_EXCHANGES is empty".to_string()));
        }
        Ok(exchanges)
    }

    fn load_sync_config() -> DaemonResult<SyncConfig> {
        let defaults = SyncConfig::default();
        Ok(SyncConfig {
            interval: Self::load_secs_env("WARDEN_SYNC_INTERVAL_SECS", defaults.interval)?,
            quantity_tolerance: Self::load_decimal_env(
                "WARDEN_QUANTITY_TOLERANCE",
                defaults.quantity_tolerance,
            )?,
        })
    }

    fn load_aged_config() -> DaemonResult<AgedConfig> {
        let defaults = AgedConfig::default();
        let policy = AgedPolicy {
            max_age_hours: Self::load_decimal_env(
                "WARDEN_AGED_MAX_AGE_HOURS",
                defaults.policy.max_age_hours,
            )?,
            grace_period_hours: Self::load_decimal_env(
                "WARDEN_AGED_GRACE_HOURS",
                defaults.policy.grace_period_hours,
            )?,
            loss_step_percent: Self::load_decimal_env(
                "WARDEN_AGED_LOSS_STEP_PERCENT",
                defaults.policy.loss_step_percent,
            )?,
            max_loss_percent: Self::load_decimal_env(
                "WARDEN_AGED_MAX_LOSS_PERCENT",
                defaults.policy.max_loss_percent,
            )?,
            commission_rate: Self::load_decimal_env(
                "WARDEN_COMMISSION_RATE",
                defaults.policy.commission_rate,
            )?,
        };
        policy.validate().map_err(|e| DaemonError::Config(e.to_string()))?;

        Ok(AgedConfig {
            policy,
            scan_interval: Self::load_secs_env(
                "WARDEN_AGED_SCAN_INTERVAL_SECS",
                defaults.scan_interval,
            )?,
            validation_interval: Self::load_secs_env(
                "WARDEN_AGED_VALIDATION_INTERVAL_SECS",
                defaults.validation_interval,
            )?,
            quantity_tolerance: Self::load_decimal_env(
                "WARDEN_QUANTITY_TOLERANCE",
                defaults.quantity_tolerance,
            )?,
        })
    }

    fn load_executor_config() -> DaemonResult<CloseConfig> {
        let defaults = CloseConfig::default();
        let max_attempts = Self::load_u64_env(
            "WARDEN_CLOSE_MAX_ATTEMPTS",
            u64::from(defaults.retry.max_attempts),
        )?;
        let max_attempts = u32::try_from(max_attempts)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                DaemonError::Config(format!("Invalid WARDEN_CLOSE_MAX_ATTEMPTS: {}", max_attempts))
            })?;

        Ok(CloseConfig {
            retry: RetryPolicy {
                max_attempts,
                rate_limit_cooldown: Self::load_secs_env(
                    "WARDEN_RATE_LIMIT_COOLDOWN_SECS",
                    defaults.retry.rate_limit_cooldown,
                )?,
                base_delay: Self::load_millis_env(
                    "WARDEN_RETRY_BASE_DELAY_MS",
                    defaults.retry.base_delay,
                )?,
                max_delay: Self::load_millis_env(
                    "WARDEN_RETRY_MAX_DELAY_MS",
                    defaults.retry.max_delay,
                )?,
            },
            limit_slippage: Self::load_decimal_env("WARDEN_LIMIT_SLIPPAGE", defaults.limit_slippage)?,
            book_depth: defaults.book_depth,
        })
    }

    fn load_price_bus_config() -> DaemonResult<PriceBusConfig> {
        let defaults = PriceBusConfig::default();
        Ok(PriceBusConfig {
            min_dispatch_interval: Self::load_millis_env(
                "WARDEN_PRICE_MIN_INTERVAL_MS",
                defaults.min_dispatch_interval,
            )?,
            default_stale_after: Self::load_secs_env(
                "WARDEN_STALE_DEFAULT_SECS",
                defaults.default_stale_after,
            )?,
            aged_stale_after: Self::load_secs_env(
                "WARDEN_STALE_AGED_SECS",
                defaults.aged_stale_after,
            )?,
            health_interval: Self::load_secs_env(
                "WARDEN_HEALTH_INTERVAL_SECS",
                defaults.health_interval,
            )?,
            ..defaults
        })
    }

    fn load_decimal_env(key: &str, default: Decimal) -> DaemonResult<Decimal> {
        match env::var(key) {
            Ok(val) => Decimal::from_str(&val)
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }

    fn load_u64_env(key: &str, default: u64) -> DaemonResult<u64> {
        match env::var(key) {
            Ok(val) => val
                .parse::<u64>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }

    fn load_secs_env(key: &str, default: Duration) -> DaemonResult<Duration> {
        Self::load_u64_env(key, default.as_secs()).map(Duration::from_secs)
    }

    fn load_millis_env(key: &str, default: Duration) -> DaemonResult<Duration> {
        Self::load_u64_env(key, default.as_millis() as u64).map(Duration::from_millis)
    }
}

fn default_exchange() -> ExchangeId {
    ExchangeId::from_static("binance")
}

/// Parse a comma-separated exchange list, ignoring blanks and duplicates.
fn parse_exchange_list(raw: &str) -> DaemonResult<Vec<ExchangeId>> {
    let mut exchanges: Vec<ExchangeId> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id = ExchangeId::new(name)
            .map_err(|e| DaemonError::Config(format!("Invalid WARDEN_EXCHANGES entry: {}", e)))?;
        if !exchanges.contains(&id) {
            exchanges.push(id);
        }
    }
    Ok(exchanges)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            sync: SyncConfig::default(),
            aged: AgedConfig::default(),
            executor: CloseConfig::default(),
            price_bus: PriceBusConfig::default(),
            exchanges: vec![default_exchange()],
            environment: Environment::Development,
            database_url: None,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
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
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.api.port, 8080);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.exchanges, vec![ExchangeId::new("binance").unwrap()]);
    }

    #[test]
    fn test_test_config() {
        let config = Config::test();

        assert_eq!(config.api.port, 0);
        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.price_bus.min_dispatch_interval, Duration::ZERO);
    }

    #[test]
    fn test_reconciliation_and_aged_defaults() {
        let config = Config::default();

        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert_eq!(config.sync.quantity_tolerance, dec!(0.01));
        assert_eq!(config.aged.policy.max_age_hours, dec!(3));
        assert_eq!(config.executor.retry.max_attempts, 3);
        assert_eq!(config.executor.retry.rate_limit_cooldown, Duration::from_secs(15));
        assert_eq!(config.price_bus.aged_stale_after, Duration::from_secs(30));
        assert_eq!(config.price_bus.default_stale_after, Duration::from_secs(300));
    }

    #[test]
    fn test_exchange_list_parsing() {
        let parsed = parse_exchange_list(" Binance, bybit,,binance ").unwrap();
        assert_eq!(
            parsed,
            vec![ExchangeId::new("binance").unwrap(), ExchangeId::new("bybit").unwrap()]
        );
        assert!(parse_exchange_list("bad exchange!").is_err());
    }

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Production.to_string(), "production");
    }
}
