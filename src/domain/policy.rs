use super::money::{Amount, Balance};
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Regulator-mandated minimum down-payment rate. One month of cover costs
/// this fraction of the total annual premium.
pub const MONTHLY_PREMIUM_RATE: Decimal = dec!(0.35);

/// The narrow read model of a policy that the payment pipeline depends on.
///
/// Everything except `balance` is owned by the policy module and read-only
/// here; `balance` is mutated solely through the policy store's
/// `apply_payment`, one read-modify-write per completed intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy_ref: String,
    pub policy_number: String,
    pub registration_number: String,
    pub total_premium: Amount,
    pub balance: Balance,
    pub start_date: NaiveDate,
    pub expiry_date: NaiveDate,
}

impl PolicySnapshot {
    /// A freshly issued policy owes its full annual premium.
    pub fn new(
        policy_ref: impl Into<String>,
        policy_number: impl Into<String>,
        registration_number: impl Into<String>,
        total_premium: Amount,
        start_date: NaiveDate,
        expiry_date: NaiveDate,
    ) -> Self {
        Self {
            policy_ref: policy_ref.into(),
            policy_number: policy_number.into(),
            registration_number: registration_number.into(),
            total_premium,
            balance: total_premium.into(),
            start_date,
            expiry_date,
        }
    }

    /// One month's worth of premium at the minimum down-payment rate,
    /// rounded to cents half-up. Doubles as the first-payment threshold.
    pub fn monthly_requirement(&self) -> Decimal {
        (self.total_premium.value() * MONTHLY_PREMIUM_RATE)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn paid_to_date(&self) -> Decimal {
        self.total_premium.value() - self.balance.0
    }

    pub fn is_settled(&self) -> bool {
        self.balance.is_settled()
    }

    /// The single balance mutation point. Applied at most once per completed
    /// intent; the payment state machine enforces the at-most-once part.
    pub fn apply_payment(&mut self, amount: Amount) -> Balance {
        self.balance -= amount.into();
        self.balance
    }
}
