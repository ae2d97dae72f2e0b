use super::policy::PolicySnapshot;
use chrono::{Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Certificate issuance milestones.
///
/// MONTH_1/MONTH_2 are short-cover certificates earned by the down-payment;
/// the annual tiers close out the policy year once the premium is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "MONTH_1")]
    Month1,
    #[serde(rename = "MONTH_2")]
    Month2,
    #[serde(rename = "ANNUAL_REMAINDER")]
    AnnualRemainder,
    #[serde(rename = "ANNUAL_FULL")]
    AnnualFull,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Month1 => write!(f, "MONTH_1"),
            Tier::Month2 => write!(f, "MONTH_2"),
            Tier::AnnualRemainder => write!(f, "ANNUAL_REMAINDER"),
            Tier::AnnualFull => write!(f, "ANNUAL_FULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateStatus {
    Pending,
    Processing,
    Issued,
    Failed,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateStatus::Pending => write!(f, "PENDING"),
            CertificateStatus::Processing => write!(f, "PROCESSING"),
            CertificateStatus::Issued => write!(f, "ISSUED"),
            CertificateStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One requested/issued certificate. At most one record per
/// `(policy_ref, tier)` and one per idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: Uuid,
    pub policy_ref: String,
    pub tier: Tier,
    pub status: CertificateStatus,
    pub idempotency_key: String,
    pub external_reference: Option<String>,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
}

impl CertificateRecord {
    /// A fresh PENDING record with its own idempotency key; one request,
    /// one record.
    pub fn pending(policy_ref: impl Into<String>, grant: &TierGrant) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_ref: policy_ref.into(),
            tier: grant.tier,
            status: CertificateStatus::Pending,
            idempotency_key: Uuid::new_v4().to_string(),
            external_reference: None,
            valid_from: grant.valid_from,
            valid_to: grant.valid_to,
        }
    }
}

/// A tier that newly qualifies for issuance, with its cover window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierGrant {
    pub tier: Tier,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
}

fn months_after(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX)
}

fn day_before(date: NaiveDate) -> NaiveDate {
    date.pred_opt().unwrap_or(date)
}

/// Decides which certificates newly qualify after a completed payment.
///
/// Pure decision logic, re-evaluated on every completed payment since later
/// payments may cross later thresholds. Rules, in fixed order:
///
/// 1. `paid_to_date >= 35%` of the premium, and nothing ever requested for
///    this policy: MONTH_1; additionally MONTH_2 at twice that.
/// 2. Balance settled: ANNUAL_REMAINDER if a MONTH_1 record predates this
///    evaluation, else ANNUAL_FULL over the whole policy year.
///
/// Tiers with an existing record are suppressed, so a grant is produced at
/// most once per `(policy, tier)` no matter how many payments follow.
pub fn decide_issuances(
    policy: &PolicySnapshot,
    paid_to_date: Decimal,
    existing: &BTreeSet<Tier>,
) -> Vec<TierGrant> {
    let monthly = policy.monthly_requirement();
    let start = policy.start_date;
    let mut grants = Vec::new();

    if paid_to_date >= monthly && existing.is_empty() {
        grants.push(TierGrant {
            tier: Tier::Month1,
            valid_from: start,
            valid_to: day_before(months_after(start, 1)),
        });
        if paid_to_date >= monthly * Decimal::TWO {
            grants.push(TierGrant {
                tier: Tier::Month2,
                valid_from: months_after(start, 1),
                valid_to: day_before(months_after(start, 2)),
            });
        }
    }

    if policy.balance.is_settled() {
        if existing.contains(&Tier::Month1) {
            grants.push(TierGrant {
                tier: Tier::AnnualRemainder,
                valid_from: months_after(start, 2),
                valid_to: policy.expiry_date,
            });
        } else {
            grants.push(TierGrant {
                tier: Tier::AnnualFull,
                valid_from: start,
                valid_to: policy.expiry_date,
            });
        }
    }

    grants.retain(|g| !existing.contains(&g.tier));
    grants
}
