use super::certificate::{CertificateRecord, CertificateStatus, Tier};
use super::event::{Consumption, Envelope, NotificationChannel};
use super::money::Amount;
use super::payment::PaymentIntent;
use super::policy::PolicySnapshot;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Read side of the policy module plus the single balance mutation.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, policy_ref: &str) -> Result<Option<PolicySnapshot>>;
    async fn insert(&self, policy: PolicySnapshot) -> Result<()>;
    /// Read-modify-write under one storage transaction. Errors with
    /// `PolicyNotFound` if the policy does not exist.
    async fn apply_payment(&self, policy_ref: &str, amount: Amount) -> Result<PolicySnapshot>;
}

#[async_trait]
pub trait IntentStore: Send + Sync {
    async fn insert(&self, intent: PaymentIntent) -> Result<()>;
    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<PaymentIntent>>;
    async fn has_completed_for_policy(&self, policy_ref: &str) -> Result<bool>;
    /// True if `receipt` is already attached to an intent other than
    /// `intent_id` — the cross-intent duplicate probe.
    async fn receipt_attached_elsewhere(&self, receipt: &str, intent_id: Uuid) -> Result<bool>;
    async fn mark_failed(&self, intent_id: Uuid) -> Result<()>;
    /// Terminal success transition. Enforces system-wide receipt uniqueness
    /// and errors with `ReceiptConflict` when a concurrent reconciliation
    /// got there first.
    async fn complete(&self, intent_id: Uuid, receipt: Option<&str>) -> Result<()>;
    async fn for_policy(&self, policy_ref: &str) -> Result<Vec<PaymentIntent>>;
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn insert(&self, record: CertificateRecord) -> Result<()>;
    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<CertificateRecord>>;
    async fn tiers_for_policy(&self, policy_ref: &str) -> Result<BTreeSet<Tier>>;
    async fn update_status(
        &self,
        idempotency_key: &str,
        status: CertificateStatus,
        external_reference: Option<String>,
    ) -> Result<()>;
    async fn for_policy(&self, policy_ref: &str) -> Result<Vec<CertificateRecord>>;
}

/// Shared "already handled" markers with expiry. Split into a read probe and
/// a separate commit so a reconciliation can record its marker only after
/// its side effects are durable.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_duplicate(&self, key: &str) -> Result<bool>;
    async fn record(&self, key: &str, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResponse {
    pub code: String,
    pub description: String,
    pub correlation_id: Option<String>,
}

impl PushResponse {
    pub fn accepted(&self) -> bool {
        self.code == "0"
    }
}

/// The mobile-money gateway. Confirmation arrives later via webhook.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_push(
        &self,
        phone_ref: &str,
        amount: Amount,
        account_ref: &str,
    ) -> Result<PushResponse>;
}

/// External certificate authority; synchronous, may fail or time out.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn issue(&self, registration_number: &str, policy_number: &str) -> Result<String>;
}

/// Fire-and-forget notification dispatcher.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        channel: NotificationChannel,
        subject: Option<&str>,
        content: &str,
    ) -> Result<()>;
}

/// Verbatim audit trail of inbound provider callbacks.
#[async_trait]
pub trait CallbackLog: Send + Sync {
    async fn record(&self, correlation_id: &str, payload: &Value) -> Result<()>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

/// A bus subscriber. The returned `Consumption` is the only redelivery
/// signal; consumers never panic their way to a retry.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, envelope: &Envelope) -> Consumption;
}

pub type PolicyStoreBox = Box<dyn PolicyStore>;
pub type IntentStoreBox = Box<dyn IntentStore>;
pub type CertificateStoreBox = Box<dyn CertificateStore>;
pub type IdempotencyStoreBox = Box<dyn IdempotencyStore>;
pub type PaymentGatewayBox = Box<dyn PaymentGateway>;
pub type CertificateAuthorityBox = Box<dyn CertificateAuthority>;
pub type NotifierBox = Box<dyn Notifier>;
pub type CallbackLogBox = Box<dyn CallbackLog>;
pub type EventPublisherBox = Box<dyn EventPublisher>;
