use crate::domain::certificate::{decide_issuances, CertificateRecord};
use crate::domain::event::{topics, CertificateRequested, NotificationSend};
use crate::domain::money::Amount;
use crate::domain::payment::{PaymentIntent, ProviderCallback};
use crate::domain::ports::{
    CallbackLogBox, CertificateStoreBox, EventPublisherBox, IdempotencyStoreBox, IntentStoreBox,
    PaymentGatewayBox, PolicyStoreBox,
};
use crate::error::{PipelineError, Result};
use std::time::Duration;
use tracing::{error, info, warn};

/// Markers outlive any realistic provider redelivery window; the terminal
/// intent state covers redeliveries beyond it.
const MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// The payment state machine: issues payment intents against the gateway
/// and reconciles provider callbacks to their intents exactly once.
///
/// All duplicate suppression converges here. The idempotency guard absorbs
/// broker/webhook redelivery, the terminal-state check absorbs provider-side
/// replays after marker expiry, and the receipt index in the intent store
/// kills cross-intent replays of a single real-world payment.
pub struct PaymentService {
    policies: PolicyStoreBox,
    intents: IntentStoreBox,
    certificates: CertificateStoreBox,
    guard: IdempotencyStoreBox,
    gateway: PaymentGatewayBox,
    publisher: EventPublisherBox,
    callback_log: CallbackLogBox,
}

impl PaymentService {
    pub fn new(
        policies: PolicyStoreBox,
        intents: IntentStoreBox,
        certificates: CertificateStoreBox,
        guard: IdempotencyStoreBox,
        gateway: PaymentGatewayBox,
        publisher: EventPublisherBox,
        callback_log: CallbackLogBox,
    ) -> Self {
        Self {
            policies,
            intents,
            certificates,
            guard,
            gateway,
            publisher,
            callback_log,
        }
    }

    /// Initiates a payment push for a policy. Rejections here leave no
    /// state behind: the intent is persisted only once the gateway has
    /// accepted the push and handed back its correlation id.
    pub async fn initiate(
        &self,
        policy_ref: &str,
        amount: Amount,
        phone_ref: &str,
    ) -> Result<PaymentIntent> {
        info!(policy_ref, %amount, phone_ref, "initiating payment push");

        let policy = self
            .policies
            .get(policy_ref)
            .await?
            .ok_or_else(|| PipelineError::PolicyNotFound(policy_ref.to_string()))?;

        if policy.is_settled() {
            warn!(policy_ref, "payment rejected: policy already fully paid");
            return Err(PipelineError::PolicyAlreadySettled(policy_ref.to_string()));
        }

        let first_payment = !self.intents.has_completed_for_policy(policy_ref).await?;
        if first_payment {
            let required = policy.monthly_requirement();
            if amount.value() < required {
                warn!(
                    policy_ref,
                    %amount,
                    %required,
                    "payment rejected: below first-payment minimum"
                );
                return Err(PipelineError::InsufficientFirstPayment {
                    required,
                    offered: amount.value(),
                });
            }
        }

        let push = self
            .gateway
            .initiate_push(phone_ref, amount, &format!("APP-{policy_ref}"))
            .await?;
        if !push.accepted() {
            error!(policy_ref, code = %push.code, "gateway rejected the push");
            return Err(PipelineError::GatewayRejected {
                code: push.code,
                description: push.description,
            });
        }
        let correlation_id = push.correlation_id.ok_or_else(|| {
            PipelineError::Validation("gateway accepted push without a correlation id".to_string())
        })?;

        let intent = PaymentIntent::pending(policy_ref, amount, phone_ref, correlation_id);
        self.intents.insert(intent.clone()).await?;
        info!(
            intent_id = %intent.id,
            correlation_id = %intent.provider_correlation_id,
            "payment intent created PENDING"
        );
        Ok(intent)
    }

    /// Reconciles one provider confirmation against its intent, applying
    /// the payment to the ledger and deciding certificate issuances at most
    /// once per real-world payment, however many times the callback is
    /// delivered.
    pub async fn reconcile(&self, callback: ProviderCallback) -> Result<()> {
        self.audit(&callback).await;

        let key = callback.idempotency_key();
        if self.guard.is_duplicate(&key).await? {
            info!(correlation_id = %callback.correlation_id, "duplicate callback delivery, skipping");
            return Ok(());
        }

        let intent = self
            .intents
            .find_by_correlation(&callback.correlation_id)
            .await?
            .ok_or_else(|| {
                error!(
                    correlation_id = %callback.correlation_id,
                    "callback has no matching intent; acknowledging without retry"
                );
                PipelineError::IntentNotFound(callback.correlation_id.clone())
            })?;

        if intent.is_terminal() {
            info!(intent_id = %intent.id, status = %intent.status, "intent already terminal, skipping");
            return Ok(());
        }

        if !callback.succeeded() {
            warn!(
                intent_id = %intent.id,
                result_code = callback.result_code,
                reason = %callback.result_desc,
                "payment failed at provider"
            );
            self.intents.mark_failed(intent.id).await?;
            self.notify_payment_failed(&intent, &callback).await?;
            self.guard.record(&key, MARKER_TTL).await?;
            return Ok(());
        }

        // Cross-intent duplicate: the provider replayed a receipt that
        // already settled a different intent (two intents, one real
        // payment). This intent dies without touching the ledger.
        if let Some(receipt) = &callback.receipt_id {
            if self
                .intents
                .receipt_attached_elsewhere(receipt, intent.id)
                .await?
            {
                error!(
                    intent_id = %intent.id,
                    receipt = %receipt,
                    "receipt already settled another intent; failing this one"
                );
                self.intents.mark_failed(intent.id).await?;
                self.guard.record(&key, MARKER_TTL).await?;
                return Ok(());
            }
        }

        match self
            .intents
            .complete(intent.id, callback.receipt_id.as_deref())
            .await
        {
            Ok(()) => {}
            Err(PipelineError::ReceiptConflict(receipt)) => {
                // Lost the race to a concurrent reconciliation of the same
                // receipt. Terminal for this callback: retrying would only
                // re-attempt the same failed write.
                error!(intent_id = %intent.id, receipt = %receipt, "receipt conflict on completion; stopping");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let policy = self
            .policies
            .apply_payment(&intent.policy_ref, intent.amount)
            .await?;
        info!(
            policy_ref = %policy.policy_ref,
            balance = %policy.balance,
            "payment applied to ledger"
        );

        let existing = self.certificates.tiers_for_policy(&policy.policy_ref).await?;
        for grant in decide_issuances(&policy, policy.paid_to_date(), &existing) {
            let record = CertificateRecord::pending(policy.policy_ref.as_str(), &grant);
            self.certificates.insert(record.clone()).await?;

            let event = CertificateRequested {
                idempotency_key: record.idempotency_key.clone(),
                policy_ref: policy.policy_ref.clone(),
                policy_number: policy.policy_number.clone(),
                registration_number: policy.registration_number.clone(),
                tier: grant.tier,
                valid_from: grant.valid_from,
                valid_to: grant.valid_to,
                recipient_phone: Some(intent.phone_ref.clone()),
            };
            self.publisher
                .publish(topics::CERTIFICATE_REQUESTED, serde_json::to_value(&event)?)
                .await?;
            info!(
                policy_ref = %policy.policy_ref,
                tier = %grant.tier,
                idempotency_key = %record.idempotency_key,
                "certificate issuance requested"
            );
        }

        // Marker last: a crash anywhere above lets the next redelivery
        // replay into the terminal-state check instead of vanishing.
        self.guard.record(&key, MARKER_TTL).await?;
        Ok(())
    }

    /// Callback audit trail. Best effort: a failed audit write is logged
    /// and swallowed, never blocking reconciliation.
    async fn audit(&self, callback: &ProviderCallback) {
        let payload = match serde_json::to_value(callback) {
            Ok(v) => v,
            Err(err) => {
                error!(%err, "failed to serialize callback for audit log");
                return;
            }
        };
        if let Err(err) = self
            .callback_log
            .record(&callback.correlation_id, &payload)
            .await
        {
            error!(%err, "failed to record callback audit entry");
        }
    }

    async fn notify_payment_failed(
        &self,
        intent: &PaymentIntent,
        callback: &ProviderCallback,
    ) -> Result<()> {
        let notification = NotificationSend::sms(
            intent.phone_ref.as_str(),
            format!(
                "Your payment of {} for policy {} was not completed: {}",
                intent.amount, intent.policy_ref, callback.result_desc
            ),
        );
        self.publisher
            .publish(topics::NOTIFICATION_SEND, serde_json::to_value(&notification)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::certificate::Tier;
    use crate::domain::money::Balance;
    use crate::domain::payment::IntentStatus;
    use crate::domain::policy::PolicySnapshot;
    use crate::domain::ports::{
        CertificateStore, IntentStore, PaymentGateway, PolicyStore, PushResponse,
    };
    use crate::infrastructure::in_memory::{
        InMemoryCallbackLog, InMemoryCertificateStore, InMemoryIdempotencyStore,
        InMemoryIntentStore, InMemoryPolicyStore,
    };
    use crate::infrastructure::stub::SimulatedGateway;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct RejectingGateway;

    #[async_trait]
    impl PaymentGateway for RejectingGateway {
        async fn initiate_push(&self, _: &str, _: Amount, _: &str) -> crate::error::Result<PushResponse> {
            Ok(PushResponse {
                code: "1".to_string(),
                description: "Insufficient gateway float".to_string(),
                correlation_id: None,
            })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<(String, Value)>>>,
    }

    #[async_trait]
    impl crate::domain::ports::EventPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Value) -> crate::error::Result<()> {
            self.published.lock().await.push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct Fixture {
        policies: InMemoryPolicyStore,
        intents: InMemoryIntentStore,
        certificates: InMemoryCertificateStore,
        publisher: RecordingPublisher,
        service: PaymentService,
    }

    fn fixture_with_gateway(gateway: PaymentGatewayBox) -> Fixture {
        let policies = InMemoryPolicyStore::new();
        let intents = InMemoryIntentStore::new();
        let certificates = InMemoryCertificateStore::new();
        let publisher = RecordingPublisher::default();
        let service = PaymentService::new(
            Box::new(policies.clone()),
            Box::new(intents.clone()),
            Box::new(certificates.clone()),
            Box::new(InMemoryIdempotencyStore::new()),
            gateway,
            Box::new(publisher.clone()),
            Box::new(InMemoryCallbackLog::new()),
        );
        Fixture {
            policies,
            intents,
            certificates,
            publisher,
            service,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_gateway(Box::new(SimulatedGateway::new()))
    }

    async fn seed_policy(fx: &Fixture, total: rust_decimal::Decimal) {
        fx.policies
            .insert(PolicySnapshot::new(
                "POL-1",
                "POL/2026/0001",
                "KDA 123A",
                Amount::new(total).unwrap(),
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
            ))
            .await
            .unwrap();
    }

    fn success_callback(intent: &PaymentIntent, receipt: &str) -> ProviderCallback {
        ProviderCallback {
            correlation_id: intent.provider_correlation_id.clone(),
            result_code: 0,
            result_desc: "The service request is processed successfully.".to_string(),
            receipt_id: Some(receipt.to_string()),
        }
    }

    #[tokio::test]
    async fn test_initiate_rejects_insufficient_first_payment() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;

        let err = fx
            .service
            .initiate("POL-1", Amount::new(dec!(1000)).unwrap(), "254700000001")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientFirstPayment { required, .. } if required == dec!(3500.00)
        ));
        // Nothing persisted.
        assert!(fx.intents.for_policy("POL-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initiate_rejects_settled_policy() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;
        fx.policies
            .apply_payment("POL-1", Amount::new(dec!(10000)).unwrap())
            .await
            .unwrap();

        let err = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PolicyAlreadySettled(_)));
    }

    #[tokio::test]
    async fn test_initiate_gateway_rejection_persists_nothing() {
        let fx = fixture_with_gateway(Box::new(RejectingGateway));
        seed_policy(&fx, dec!(10000)).await;

        let err = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::GatewayRejected { .. }));
        assert!(fx.intents.for_policy("POL-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_replay_decrements_balance_once() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;
        let intent = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap();

        let callback = success_callback(&intent, "SBK1XYZ001");
        for _ in 0..3 {
            fx.service.reconcile(callback.clone()).await.unwrap();
        }

        let policy = fx.policies.get("POL-1").await.unwrap().unwrap();
        assert_eq!(policy.balance, Balance::new(dec!(6500)));

        let certs = fx.certificates.for_policy("POL-1").await.unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].tier, Tier::Month1);

        // One issuance event, not three.
        let published = fx.publisher.published.lock().await;
        let issuance_events = published
            .iter()
            .filter(|(topic, _)| topic == topics::CERTIFICATE_REQUESTED)
            .count();
        assert_eq!(issuance_events, 1);
    }

    #[tokio::test]
    async fn test_reconcile_failure_leaves_ledger_untouched_and_notifies() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;
        let intent = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap();

        fx.service
            .reconcile(ProviderCallback {
                correlation_id: intent.provider_correlation_id.clone(),
                result_code: 1032,
                result_desc: "Request cancelled by user".to_string(),
                receipt_id: None,
            })
            .await
            .unwrap();

        let stored = fx
            .intents
            .find_by_correlation(&intent.provider_correlation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, IntentStatus::Failed);

        let policy = fx.policies.get("POL-1").await.unwrap().unwrap();
        assert_eq!(policy.balance, Balance::new(dec!(10000)));
        assert!(fx.certificates.for_policy("POL-1").await.unwrap().is_empty());

        let published = fx.publisher.published.lock().await;
        assert!(published
            .iter()
            .any(|(topic, _)| topic == topics::NOTIFICATION_SEND));
    }

    #[tokio::test]
    async fn test_failed_intent_never_completes_on_late_success() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;
        let intent = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap();

        fx.service
            .reconcile(ProviderCallback {
                correlation_id: intent.provider_correlation_id.clone(),
                result_code: 1,
                result_desc: "timeout".to_string(),
                receipt_id: None,
            })
            .await
            .unwrap();

        // A later success replay for the same correlation id must not
        // resurrect the intent.
        fx.service
            .reconcile(success_callback(&intent, "SBK1XYZ002"))
            .await
            .unwrap();

        let stored = fx
            .intents
            .find_by_correlation(&intent.provider_correlation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, IntentStatus::Failed);
        let policy = fx.policies.get("POL-1").await.unwrap().unwrap();
        assert_eq!(policy.balance, Balance::new(dec!(10000)));
    }

    #[tokio::test]
    async fn test_cross_intent_receipt_fails_second_intent() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;

        // Client-side retry: two intents for one real payment.
        let first = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap();
        let second = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap();

        fx.service
            .reconcile(success_callback(&first, "SBK1XYZ003"))
            .await
            .unwrap();
        fx.service
            .reconcile(success_callback(&second, "SBK1XYZ003"))
            .await
            .unwrap();

        let stored_second = fx
            .intents
            .find_by_correlation(&second.provider_correlation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_second.status, IntentStatus::Failed);
        assert!(stored_second.provider_receipt_id.is_none());

        // Ledger decremented once, by the first reconciliation only.
        let policy = fx.policies.get("POL-1").await.unwrap().unwrap();
        assert_eq!(policy.balance, Balance::new(dec!(6500)));
    }

    #[tokio::test]
    async fn test_reconcile_unknown_correlation_is_terminal() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;

        let err = fx
            .service
            .reconcile(ProviderCallback {
                correlation_id: "ws_CO_unknown".to_string(),
                result_code: 0,
                result_desc: "ok".to_string(),
                receipt_id: Some("SBK1XYZ004".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IntentNotFound(_)));
    }

    #[tokio::test]
    async fn test_full_payment_grants_annual_full_in_one_reconciliation() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;
        let intent = fx
            .service
            .initiate("POL-1", Amount::new(dec!(10000)).unwrap(), "254700000001")
            .await
            .unwrap();
        fx.service
            .reconcile(success_callback(&intent, "SBK1XYZ005"))
            .await
            .unwrap();

        let tiers = fx.certificates.tiers_for_policy("POL-1").await.unwrap();
        assert!(tiers.contains(&Tier::Month1));
        assert!(tiers.contains(&Tier::AnnualFull));
        assert!(!tiers.contains(&Tier::AnnualRemainder));
    }

    #[tokio::test]
    async fn test_settling_payment_after_month_1_grants_annual_remainder() {
        let fx = fixture();
        seed_policy(&fx, dec!(10000)).await;

        let first = fx
            .service
            .initiate("POL-1", Amount::new(dec!(3500)).unwrap(), "254700000001")
            .await
            .unwrap();
        fx.service
            .reconcile(success_callback(&first, "SBK1XYZ006"))
            .await
            .unwrap();

        let second = fx
            .service
            .initiate("POL-1", Amount::new(dec!(6500)).unwrap(), "254700000001")
            .await
            .unwrap();
        fx.service
            .reconcile(success_callback(&second, "SBK1XYZ007"))
            .await
            .unwrap();

        let tiers = fx.certificates.tiers_for_policy("POL-1").await.unwrap();
        assert!(tiers.contains(&Tier::Month1));
        assert!(tiers.contains(&Tier::AnnualRemainder));
        assert!(!tiers.contains(&Tier::AnnualFull));

        let policy = fx.policies.get("POL-1").await.unwrap().unwrap();
        assert!(policy.is_settled());
    }
}
