use crate::domain::certificate::{CertificateRecord, CertificateStatus, Tier};
use crate::domain::money::Amount;
use crate::domain::payment::{IntentStatus, PaymentIntent};
use crate::domain::policy::PolicySnapshot;
use crate::domain::ports::{
    CallbackLog, CertificateStore, IdempotencyStore, IntentStore, PolicyStore,
};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory policy read model. The write lock around `apply_payment` is the
/// in-memory analogue of the ledger transaction: the read-modify-write is
/// not interleavable.
#[derive(Default, Clone)]
pub struct InMemoryPolicyStore {
    policies: Arc<RwLock<HashMap<String, PolicySnapshot>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(&self, policy_ref: &str) -> Result<Option<PolicySnapshot>> {
        let policies = self.policies.read().await;
        Ok(policies.get(policy_ref).cloned())
    }

    async fn insert(&self, policy: PolicySnapshot) -> Result<()> {
        let mut policies = self.policies.write().await;
        policies.insert(policy.policy_ref.clone(), policy);
        Ok(())
    }

    async fn apply_payment(&self, policy_ref: &str, amount: Amount) -> Result<PolicySnapshot> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(policy_ref)
            .ok_or_else(|| PipelineError::PolicyNotFound(policy_ref.to_string()))?;
        policy.apply_payment(amount);
        Ok(policy.clone())
    }
}

#[derive(Default)]
struct IntentIndex {
    by_id: HashMap<Uuid, PaymentIntent>,
    by_correlation: HashMap<String, Uuid>,
    by_receipt: HashMap<String, Uuid>,
}

/// In-memory intent store. `by_receipt` plays the part of the storage-level
/// unique constraint on receipt ids: the actual mechanism that stops two
/// concurrent reconciliations settling one real-world payment twice.
#[derive(Default, Clone)]
pub struct InMemoryIntentStore {
    index: Arc<RwLock<IntentIndex>>,
}

impl InMemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IntentStore for InMemoryIntentStore {
    async fn insert(&self, intent: PaymentIntent) -> Result<()> {
        let mut index = self.index.write().await;
        if index
            .by_correlation
            .contains_key(&intent.provider_correlation_id)
        {
            return Err(PipelineError::Storage(format!(
                "correlation id already present: {}",
                intent.provider_correlation_id
            )));
        }
        index
            .by_correlation
            .insert(intent.provider_correlation_id.clone(), intent.id);
        index.by_id.insert(intent.id, intent);
        Ok(())
    }

    async fn find_by_correlation(&self, correlation_id: &str) -> Result<Option<PaymentIntent>> {
        let index = self.index.read().await;
        Ok(index
            .by_correlation
            .get(correlation_id)
            .and_then(|id| index.by_id.get(id))
            .cloned())
    }

    async fn has_completed_for_policy(&self, policy_ref: &str) -> Result<bool> {
        let index = self.index.read().await;
        Ok(index
            .by_id
            .values()
            .any(|i| i.policy_ref == policy_ref && i.status == IntentStatus::Completed))
    }

    async fn receipt_attached_elsewhere(&self, receipt: &str, intent_id: Uuid) -> Result<bool> {
        let index = self.index.read().await;
        Ok(index
            .by_receipt
            .get(receipt)
            .is_some_and(|owner| *owner != intent_id))
    }

    async fn mark_failed(&self, intent_id: Uuid) -> Result<()> {
        let mut index = self.index.write().await;
        let intent = index
            .by_id
            .get_mut(&intent_id)
            .ok_or_else(|| PipelineError::Storage(format!("intent not found: {intent_id}")))?;
        intent.status = IntentStatus::Failed;
        Ok(())
    }

    async fn complete(&self, intent_id: Uuid, receipt: Option<&str>) -> Result<()> {
        let mut index = self.index.write().await;
        if let Some(receipt) = receipt
            && index
                .by_receipt
                .get(receipt)
                .is_some_and(|owner| *owner != intent_id)
        {
            return Err(PipelineError::ReceiptConflict(receipt.to_string()));
        }
        let intent = index
            .by_id
            .get_mut(&intent_id)
            .ok_or_else(|| PipelineError::Storage(format!("intent not found: {intent_id}")))?;
        intent.status = IntentStatus::Completed;
        intent.provider_receipt_id = receipt.map(str::to_string);
        if let Some(receipt) = receipt {
            index.by_receipt.insert(receipt.to_string(), intent_id);
        }
        Ok(())
    }

    async fn for_policy(&self, policy_ref: &str) -> Result<Vec<PaymentIntent>> {
        let index = self.index.read().await;
        Ok(index
            .by_id
            .values()
            .filter(|i| i.policy_ref == policy_ref)
            .cloned()
            .collect())
    }
}

/// In-memory certificate store keyed by idempotency key (its unique
/// constraint); one request, one record.
#[derive(Default, Clone)]
pub struct InMemoryCertificateStore {
    records: Arc<RwLock<HashMap<String, CertificateRecord>>>,
}

impl InMemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertificateStore for InMemoryCertificateStore {
    async fn insert(&self, record: CertificateRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.idempotency_key) {
            return Err(PipelineError::Storage(format!(
                "idempotency key already present: {}",
                record.idempotency_key
            )));
        }
        records.insert(record.idempotency_key.clone(), record);
        Ok(())
    }

    async fn find_by_key(&self, idempotency_key: &str) -> Result<Option<CertificateRecord>> {
        let records = self.records.read().await;
        Ok(records.get(idempotency_key).cloned())
    }

    async fn tiers_for_policy(&self, policy_ref: &str) -> Result<BTreeSet<Tier>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.policy_ref == policy_ref)
            .map(|r| r.tier)
            .collect())
    }

    async fn update_status(
        &self,
        idempotency_key: &str,
        status: CertificateStatus,
        external_reference: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.get_mut(idempotency_key).ok_or_else(|| {
            PipelineError::Storage(format!("certificate not found: {idempotency_key}"))
        })?;
        record.status = status;
        if external_reference.is_some() {
            record.external_reference = external_reference;
        }
        Ok(())
    }

    async fn for_policy(&self, policy_ref: &str) -> Result<Vec<CertificateRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<CertificateRecord> = records
            .values()
            .filter(|r| r.policy_ref == policy_ref)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.tier);
        Ok(out)
    }
}

/// In-memory stand-in for the shared key/value idempotency store. Entries
/// expire by TTL; an expired marker reads as "never seen".
#[derive(Default, Clone)]
pub struct InMemoryIdempotencyStore {
    markers: Arc<RwLock<HashMap<String, Instant>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_duplicate(&self, key: &str) -> Result<bool> {
        let mut markers = self.markers.write().await;
        match markers.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => Ok(true),
            Some(_) => {
                markers.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn record(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut markers = self.markers.write().await;
        markers.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

/// In-memory audit trail of raw provider callbacks.
#[derive(Default, Clone)]
pub struct InMemoryCallbackLog {
    entries: Arc<RwLock<Vec<(String, Value)>>>,
}

impl InMemoryCallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CallbackLog for InMemoryCallbackLog {
    async fn record(&self, correlation_id: &str, payload: &Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push((correlation_id.to_string(), payload.clone()));
        Ok(())
    }
}
