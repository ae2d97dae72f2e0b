use super::money::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentStatus::Pending => write!(f, "PENDING"),
            IntentStatus::Completed => write!(f, "COMPLETED"),
            IntentStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// One user-initiated payment attempt awaiting provider confirmation.
///
/// Created PENDING when a push is accepted by the gateway; moved to a
/// terminal state exactly once by the callback reconciler. Terminal states
/// never revert. `provider_receipt_id` is unique across all intents: a
/// real-world receipt settles at most one intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub policy_ref: String,
    pub amount: Amount,
    pub phone_ref: String,
    pub status: IntentStatus,
    pub provider_correlation_id: String,
    pub provider_receipt_id: Option<String>,
}

impl PaymentIntent {
    pub fn pending(
        policy_ref: impl Into<String>,
        amount: Amount,
        phone_ref: impl Into<String>,
        provider_correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_ref: policy_ref.into(),
            amount,
            phone_ref: phone_ref.into(),
            status: IntentStatus::Pending,
            provider_correlation_id: provider_correlation_id.into(),
            provider_receipt_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, IntentStatus::Completed | IntentStatus::Failed)
    }
}

/// A provider confirmation callback, already mapped out of the wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCallback {
    pub correlation_id: String,
    pub result_code: i32,
    pub result_desc: String,
    pub receipt_id: Option<String>,
}

impl ProviderCallback {
    pub fn succeeded(&self) -> bool {
        self.result_code == 0
    }

    /// Key for the idempotency guard. Chosen per logical occurrence: the
    /// provider reuses the correlation id on every redelivery of the same
    /// confirmation.
    pub fn idempotency_key(&self) -> String {
        format!("callback:{}", self.correlation_id)
    }
}
