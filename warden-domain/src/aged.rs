//! Aged-position policy.
//!
//! Pure, I/O-free rules for positions that have been open longer than the
//! configured maximum age. The monitor in `wardend` owns the mutable targets;
//! everything here is computation.
//!
//! # Phases
//!
//! ```text
//! hours_over = age - max_age_hours
//!
//!  0 ───────── grace_period_hours ───────────────── (tolerance reaches max_loss)
//!  │   GRACE    │        PROGRESSIVE                 │        STALE
//!  │ break-even │ tolerance grows by loss_step/hour  │ tolerance pinned at max_loss
//! ```
//!
//! Phases only move forward. A position leaves the machine by being closed
//! (or found to be a ghost), never by moving back a phase.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::entities::{hours_between, Position, PositionId};
use crate::value_objects::{DomainError, ExchangeId, Price, Quantity, Side, Symbol};

// =============================================================================
// AgedPhase
// =============================================================================

/// Liquidation phase of an aged position (ordered: grace < progressive < stale)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgedPhase {
    /// Waiting for break-even (including round-trip fees)
    Grace,
    /// Accepting a growing loss
    Progressive,
    /// Loss tolerance capped; close at any price inside the cap
    Stale,
}

impl AgedPhase {
    /// Storage spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            AgedPhase::Grace => "grace",
            AgedPhase::Progressive => "progressive",
            AgedPhase::Stale => "stale",
        }
    }

    /// Exit reason recorded when a close in this phase succeeds
    pub fn exit_reason(&self) -> String {
        format!("aged_{}", self.as_str())
    }
}

impl fmt::Display for AgedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgedPhase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grace" => Ok(AgedPhase::Grace),
            "progressive" => Ok(AgedPhase::Progressive),
            "stale" => Ok(AgedPhase::Stale),
            other => Err(DomainError::InvalidValue(format!("Unknown aged phase: {}", other))),
        }
    }
}

// =============================================================================
// AgedPolicy
// =============================================================================

/// Parameters of the age-driven liquidation policy.
///
/// Percent fields are in percent units (`0.5` = 0.5%); `commission_rate` is a
/// fraction per side (`0.0006` = 0.06%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgedPolicy {
    /// Age after which a position is considered aged
    pub max_age_hours: Decimal,
    /// Hours past `max_age_hours` spent waiting for break-even
    pub grace_period_hours: Decimal,
    /// Loss tolerance added per hour of progressive phase
    pub loss_step_percent: Decimal,
    /// Cap on loss tolerance
    pub max_loss_percent: Decimal,
    /// Taker commission per side, as a fraction
    pub commission_rate: Decimal,
}

/// Phase and target computed for a position at a given age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTarget {
    /// Current phase
    pub phase: AgedPhase,
    /// Price at which the position may be closed
    pub target_price: Decimal,
    /// Accepted loss in percent of entry
    pub loss_tolerance: Decimal,
    /// Hours beyond `max_age_hours`
    pub hours_over_limit: Decimal,
}

impl AgedPolicy {
    /// Validate parameters
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPolicy` on negative values or a zero max age.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.max_age_hours <= Decimal::ZERO {
            return Err(DomainError::InvalidPolicy("max_age_hours must be positive".to_string()));
        }
        for (name, value) in [
            ("grace_period_hours", self.grace_period_hours),
            ("loss_step_percent", self.loss_step_percent),
            ("max_loss_percent", self.max_loss_percent),
            ("commission_rate", self.commission_rate),
        ] {
            if value < Decimal::ZERO {
                return Err(DomainError::InvalidPolicy(format!("{} must not be negative", name)));
            }
        }
        Ok(())
    }

    /// Is a position of this age past the maximum
    pub fn is_aged(&self, age_hours: Decimal) -> bool {
        age_hours > self.max_age_hours
    }

    /// Compute phase and target for a position.
    ///
    /// Returns `None` while the position is not yet aged.
    ///
    /// # Example
    /// ```
    /// # use warden_domain::aged::{AgedPolicy, AgedPhase};
    /// # use warden_domain::Side;
    /// # use rust_decimal_macros::dec;
    /// let policy = AgedPolicy {
    ///     max_age_hours: dec!(3),
    ///     grace_period_hours: dec!(8),
    ///     loss_step_percent: dec!(0.5),
    ///     max_loss_percent: dec!(10),
    ///     commission_rate: dec!(0.0005),
    /// };
    /// let target = policy.evaluate(Side::Long, dec!(42000), dec!(4)).unwrap();
    /// assert_eq!(target.phase, AgedPhase::Grace);
    /// assert_eq!(target.target_price, dec!(42042)); // 42000 × (1 + 2 × 0.0005)
    /// ```
    pub fn evaluate(&self, side: Side, entry: Decimal, age_hours: Decimal) -> Option<PhaseTarget> {
        if !self.is_aged(age_hours) {
            return None;
        }
        let hours_over_limit = age_hours - self.max_age_hours;

        if hours_over_limit < self.grace_period_hours {
            return Some(PhaseTarget {
                phase: AgedPhase::Grace,
                target_price: self.break_even(side, entry),
                loss_tolerance: Decimal::ZERO,
                hours_over_limit,
            });
        }

        let uncapped = (hours_over_limit - self.grace_period_hours) * self.loss_step_percent;
        let (phase, loss_tolerance) = if uncapped > self.max_loss_percent {
            (AgedPhase::Stale, self.max_loss_percent)
        } else {
            (AgedPhase::Progressive, uncapped)
        };

        Some(PhaseTarget {
            phase,
            target_price: Self::loss_target(side, entry, loss_tolerance),
            loss_tolerance,
            hours_over_limit,
        })
    }

    /// Break-even price including round-trip commission
    pub fn break_even(&self, side: Side, entry: Decimal) -> Decimal {
        let fees = self.commission_rate * Decimal::TWO;
        match side {
            Side::Long => entry * (Decimal::ONE + fees),
            Side::Short => entry * (Decimal::ONE - fees),
        }
    }

    /// Entry moved against the position by `tolerance_percent`
    fn loss_target(side: Side, entry: Decimal, tolerance_percent: Decimal) -> Decimal {
        let fraction = tolerance_percent / Decimal::ONE_HUNDRED;
        match side {
            Side::Long => entry * (Decimal::ONE - fraction),
            Side::Short => entry * (Decimal::ONE + fraction),
        }
    }
}

impl Default for AgedPolicy {
    fn default() -> Self {
        Self {
            max_age_hours: Decimal::from(3),
            grace_period_hours: Decimal::from(8),
            loss_step_percent: Decimal::new(5, 1), // 0.5% per hour
            max_loss_percent: Decimal::from(10),
            commission_rate: Decimal::new(6, 4), // 0.06% per side
        }
    }
}

// =============================================================================
// AgedPositionTarget
// =============================================================================

/// Why a tick should close an aged position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseTrigger {
    /// PnL is non-negative
    Profit,
    /// Price crossed the phase target in the loss-accepting direction
    TargetReached,
}

/// In-memory tracking state for one aged position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgedPositionTarget {
    /// Backing position
    pub position_id: PositionId,
    /// Trading pair
    pub symbol: Symbol,
    /// Exchange account
    pub exchange: ExchangeId,
    /// Direction
    pub side: Side,
    /// Stored size (the exchange is consulted again before closing)
    pub quantity: Quantity,
    /// Entry price
    pub entry_price: Price,
    /// Current target price
    pub target_price: Decimal,
    /// Current phase
    pub phase: AgedPhase,
    /// Accepted loss in percent
    pub loss_tolerance: Decimal,
    /// Position age at last evaluation
    pub hours_aged: Decimal,
    /// When the backing position opened
    pub opened_at: DateTime<Utc>,
    /// When tracking started
    pub detected_at: DateTime<Utc>,
    /// Last re-evaluation
    pub last_updated: DateTime<Utc>,
}

/// Phase transition produced by [`AgedPositionTarget::refresh`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    /// Previous phase
    pub from: AgedPhase,
    /// New phase
    pub to: AgedPhase,
}

impl AgedPositionTarget {
    /// Start tracking `position` if the policy considers it aged at `now`.
    pub fn from_position(
        position: &Position,
        policy: &AgedPolicy,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let age = position.age_hours(now);
        let computed = policy.evaluate(position.side, position.entry_price.as_decimal(), age)?;

        Some(Self {
            position_id: position.id,
            symbol: position.symbol.clone(),
            exchange: position.exchange.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            target_price: computed.target_price,
            phase: computed.phase,
            loss_tolerance: computed.loss_tolerance,
            hours_aged: age,
            opened_at: position.opened_at,
            detected_at: now,
            last_updated: now,
        })
    }

    /// Recompute phase and target at `now`.
    ///
    /// Never moves backwards: if the computed phase precedes the current one
    /// (clock skew, policy change) the current phase and target are kept.
    pub fn refresh(&mut self, policy: &AgedPolicy, now: DateTime<Utc>) -> Option<PhaseChange> {
        let age = hours_between(self.opened_at, now);
        self.hours_aged = age;
        self.last_updated = now;

        let computed = policy.evaluate(self.side, self.entry_price.as_decimal(), age)?;
        if computed.phase < self.phase {
            return None;
        }

        let change = (computed.phase != self.phase).then_some(PhaseChange {
            from: self.phase,
            to: computed.phase,
        });
        self.phase = computed.phase;
        self.target_price = computed.target_price;
        self.loss_tolerance = computed.loss_tolerance;
        change
    }

    /// PnL in percent at `price`
    pub fn pnl_percent(&self, price: Price) -> Decimal {
        self.side.pnl_percent(self.entry_price.as_decimal(), price.as_decimal())
    }

    /// Decide whether a tick at `price` should close the position
    pub fn should_close(&self, price: Price) -> Option<CloseTrigger> {
        if self.pnl_percent(price) >= Decimal::ZERO {
            return Some(CloseTrigger::Profit);
        }
        let reached = match self.side {
            Side::Long => price.as_decimal() >= self.target_price,
            Side::Short => price.as_decimal() <= self.target_price,
        };
        reached.then_some(CloseTrigger::TargetReached)
    }
}

// =============================================================================
// AgedPositionRecord
// =============================================================================

/// Status of a persisted aged-position record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgedRecordStatus {
    /// Tracked by a running monitor
    Active,
    /// Backing position closed
    Closed,
    /// Could not be matched to an active position on recovery
    Stale,
}

impl AgedRecordStatus {
    /// Storage spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            AgedRecordStatus::Active => "active",
            AgedRecordStatus::Closed => "closed",
            AgedRecordStatus::Stale => "stale",
        }
    }
}

impl FromStr for AgedRecordStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgedRecordStatus::Active),
            "closed" => Ok(AgedRecordStatus::Closed),
            "stale" => Ok(AgedRecordStatus::Stale),
            other => Err(DomainError::InvalidValue(format!("Unknown record status: {}", other))),
        }
    }
}

/// Persisted mirror of an [`AgedPositionTarget`], used for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgedPositionRecord {
    /// Backing position (primary key)
    pub position_id: PositionId,
    /// Trading pair
    pub symbol: Symbol,
    /// Exchange account
    pub exchange: ExchangeId,
    /// Direction
    pub side: Side,
    /// Entry price
    pub entry_price: Price,
    /// Target at last persist
    pub target_price: Decimal,
    /// Phase at last persist
    pub phase: AgedPhase,
    /// Loss tolerance at last persist
    pub loss_tolerance: Decimal,
    /// Age at last persist
    pub hours_aged: Decimal,
    /// Record status
    pub status: AgedRecordStatus,
    /// When tracking started
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl AgedPositionRecord {
    /// Snapshot a live target
    pub fn from_target(target: &AgedPositionTarget, now: DateTime<Utc>) -> Self {
        Self {
            position_id: target.position_id,
            symbol: target.symbol.clone(),
            exchange: target.exchange.clone(),
            side: target.side,
            entry_price: target.entry_price,
            target_price: target.target_price,
            phase: target.phase,
            loss_tolerance: target.loss_tolerance,
            hours_aged: target.hours_aged,
            status: AgedRecordStatus::Active,
            created_at: target.detected_at,
            updated_at: now,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn policy() -> AgedPolicy {
        AgedPolicy {
            max_age_hours: dec!(3),
            grace_period_hours: dec!(8),
            loss_step_percent: dec!(0.5),
            max_loss_percent: dec!(2),
            commission_rate: dec!(0.0005),
        }
    }

    fn aged_long(hours: i64) -> (Position, DateTime<Utc>) {
        let now = Utc::now();
        let position = Position::new_active(
            Symbol::from_pair("BTCUSDT").unwrap(),
            ExchangeId::new("binance").unwrap(),
            Side::Long,
            Quantity::new(dec!(0.5)).unwrap(),
            Price::new(dec!(42000)).unwrap(),
            "1".to_string(),
        )
        .with_opened_at(now - Duration::hours(hours));
        (position, now)
    }

    #[test]
    fn test_not_aged_until_past_max_age() {
        assert!(policy().evaluate(Side::Long, dec!(100), dec!(2.9)).is_none());
        assert!(policy().evaluate(Side::Long, dec!(100), dec!(3)).is_none());
        assert!(policy().evaluate(Side::Long, dec!(100), dec!(3.01)).is_some());
    }

    #[test]
    fn test_grace_targets_break_even_with_fees() {
        let long = policy().evaluate(Side::Long, dec!(42000), dec!(4)).unwrap();
        assert_eq!(long.phase, AgedPhase::Grace);
        assert_eq!(long.loss_tolerance, Decimal::ZERO);
        assert_eq!(long.target_price, dec!(42042));

        let short = policy().evaluate(Side::Short, dec!(42000), dec!(4)).unwrap();
        assert_eq!(short.target_price, dec!(41958));
    }

    #[test]
    fn test_phase_boundary_is_progressive_with_zero_tolerance() {
        // exactly grace_period_hours past max_age_hours
        let at_boundary = policy().evaluate(Side::Long, dec!(100), dec!(11)).unwrap();
        assert_eq!(at_boundary.phase, AgedPhase::Progressive);
        assert_eq!(at_boundary.loss_tolerance, Decimal::ZERO);
        assert_eq!(at_boundary.target_price, dec!(100));
    }

    #[test]
    fn test_tolerance_increases_then_clamps() {
        let p = policy();
        let mut previous = Decimal::ZERO;
        for age in [dec!(11.5), dec!(12), dec!(13), dec!(14.5), dec!(15)] {
            let t = p.evaluate(Side::Long, dec!(100), age).unwrap();
            assert!(t.loss_tolerance > previous, "tolerance must grow at age {}", age);
            assert_eq!(t.phase, AgedPhase::Progressive);
            previous = t.loss_tolerance;
        }
        // 4h of progressive × 0.5 = 2 = cap
        assert_eq!(previous, dec!(2));

        let beyond = p.evaluate(Side::Long, dec!(100), dec!(20)).unwrap();
        assert_eq!(beyond.phase, AgedPhase::Stale);
        assert_eq!(beyond.loss_tolerance, dec!(2));
        assert_eq!(beyond.target_price, dec!(98));

        let short = p.evaluate(Side::Short, dec!(100), dec!(20)).unwrap();
        assert_eq!(short.target_price, dec!(102));
    }

    #[test]
    fn test_target_from_position_scenario() {
        let (position, now) = aged_long(4);
        let target = AgedPositionTarget::from_position(&position, &policy(), now).unwrap();

        assert_eq!(target.phase, AgedPhase::Grace);
        assert_eq!(target.target_price, dec!(42000) * (dec!(1) + dec!(2) * dec!(0.0005)));
        assert_eq!(target.phase.exit_reason(), "aged_grace");
    }

    #[test]
    fn test_refresh_moves_forward_only() {
        let (position, now) = aged_long(4);
        let mut target = AgedPositionTarget::from_position(&position, &policy(), now).unwrap();

        let change = target.refresh(&policy(), now + Duration::hours(8)).unwrap();
        assert_eq!(change.from, AgedPhase::Grace);
        assert_eq!(change.to, AgedPhase::Progressive);

        // evaluating at an earlier instant must not regress the phase
        assert!(target.refresh(&policy(), now).is_none());
        assert_eq!(target.phase, AgedPhase::Progressive);
    }

    #[test]
    fn test_should_close_rules() {
        let (position, now) = aged_long(4);
        let grace = AgedPositionTarget::from_position(&position, &policy(), now).unwrap();

        assert_eq!(grace.should_close(Price::new(dec!(42000)).unwrap()), Some(CloseTrigger::Profit));
        assert_eq!(grace.should_close(Price::new(dec!(41999)).unwrap()), None);

        let (old, now) = aged_long(13);
        let progressive = AgedPositionTarget::from_position(&old, &policy(), now).unwrap();
        // 2h into progressive → 1% tolerance → target 41580
        assert_eq!(progressive.target_price, dec!(41580));
        assert_eq!(
            progressive.should_close(Price::new(dec!(41600)).unwrap()),
            Some(CloseTrigger::TargetReached)
        );
        assert_eq!(progressive.should_close(Price::new(dec!(41500)).unwrap()), None);
    }

    #[test]
    fn test_policy_validation() {
        assert!(policy().validate().is_ok());
        let bad = AgedPolicy { max_age_hours: dec!(0), ..policy() };
        assert!(bad.validate().is_err());
        let negative = AgedPolicy { loss_step_percent: dec!(-1), ..policy() };
        assert!(negative.validate().is_err());
    }
}
