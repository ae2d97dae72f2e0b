use crate::domain::certificate::{CertificateRecord, CertificateStatus};
use crate::domain::event::{
    topics, CertificateRequested, Consumption, Envelope, NotificationSend,
};
use crate::domain::ports::{
    CertificateAuthorityBox, CertificateStoreBox, Consumer, EventPublisherBox, IdempotencyStoreBox,
};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Drains `certificate.requested` events: one external authority call and
/// one ISSUED record per logical request, no matter how many deliveries.
///
/// The marker commits only after the record is ISSUED, so a crash between
/// the authority call and the commit re-runs the handler on redelivery;
/// the ISSUED check then drops it before a second authority call.
pub struct CertificateIssuanceConsumer {
    certificates: CertificateStoreBox,
    guard: IdempotencyStoreBox,
    authority: CertificateAuthorityBox,
    publisher: EventPublisherBox,
}

impl CertificateIssuanceConsumer {
    pub fn new(
        certificates: CertificateStoreBox,
        guard: IdempotencyStoreBox,
        authority: CertificateAuthorityBox,
        publisher: EventPublisherBox,
    ) -> Self {
        Self {
            certificates,
            guard,
            authority,
            publisher,
        }
    }

    async fn handle(&self, event: &CertificateRequested) -> Result<Consumption> {
        let key = &event.idempotency_key;
        if self.guard.is_duplicate(key).await? {
            info!(idempotency_key = %key, "duplicate issuance delivery, skipping");
            return Ok(Consumption::Ack);
        }

        let record = match self.certificates.find_by_key(key).await? {
            Some(record) => record,
            None => {
                // The reconciler normally persists the PENDING record before
                // publishing; recover from a lost write by rebuilding it
                // from the event.
                warn!(idempotency_key = %key, "no certificate record for event, creating one");
                let record = CertificateRecord {
                    id: Uuid::new_v4(),
                    policy_ref: event.policy_ref.clone(),
                    tier: event.tier,
                    status: CertificateStatus::Pending,
                    idempotency_key: key.clone(),
                    external_reference: None,
                    valid_from: event.valid_from,
                    valid_to: event.valid_to,
                };
                self.certificates.insert(record.clone()).await?;
                record
            }
        };

        if record.status == CertificateStatus::Issued {
            info!(idempotency_key = %key, "certificate already issued, skipping");
            return Ok(Consumption::Ack);
        }

        self.certificates
            .update_status(key, CertificateStatus::Processing, None)
            .await?;

        match self
            .authority
            .issue(&event.registration_number, &event.policy_number)
            .await
        {
            Ok(reference) => {
                self.certificates
                    .update_status(key, CertificateStatus::Issued, Some(reference.clone()))
                    .await?;
                self.guard.record(key, MARKER_TTL).await?;
                info!(
                    policy_number = %event.policy_number,
                    tier = %event.tier,
                    reference = %reference,
                    "certificate issued"
                );
                self.notify(
                    event,
                    "Insurance Certificate Issued",
                    format!(
                        "Your {} certificate for vehicle {} has been issued. Reference: {}",
                        event.tier, event.registration_number, reference
                    ),
                )
                .await;
                Ok(Consumption::Ack)
            }
            Err(err) => {
                error!(
                    idempotency_key = %key,
                    %err,
                    "certificate authority call failed, dead-lettering"
                );
                self.certificates
                    .update_status(key, CertificateStatus::Failed, None)
                    .await?;
                self.notify(
                    event,
                    "Insurance Certificate Issuance Failed",
                    format!(
                        "Failed to issue your {} certificate for vehicle {}. Our team is looking into it.",
                        event.tier, event.registration_number
                    ),
                )
                .await;
                Ok(Consumption::DeadLetter)
            }
        }
    }

    async fn notify(&self, event: &CertificateRequested, subject: &str, content: String) {
        let Some(recipient) = &event.recipient_phone else {
            warn!(policy_number = %event.policy_number, "no recipient on event, skipping notification");
            return;
        };
        let mut notification = NotificationSend::sms(recipient.as_str(), content);
        notification.subject = Some(subject.to_string());
        match serde_json::to_value(&notification) {
            Ok(payload) => {
                if let Err(err) = self.publisher.publish(topics::NOTIFICATION_SEND, payload).await {
                    error!(%err, "failed to publish notification event");
                }
            }
            Err(err) => error!(%err, "failed to serialize notification event"),
        }
    }
}

#[async_trait]
impl Consumer for CertificateIssuanceConsumer {
    async fn consume(&self, envelope: &Envelope) -> Consumption {
        let event: CertificateRequested = match serde_json::from_value(envelope.payload.clone()) {
            Ok(event) => event,
            Err(err) => {
                error!(envelope_id = %envelope.id, %err, "malformed issuance event");
                return Consumption::DeadLetter;
            }
        };
        match self.handle(&event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Store faults are transient here; let the bus redeliver.
                error!(idempotency_key = %event.idempotency_key, %err, "issuance handling failed");
                Consumption::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::certificate::Tier;
    use crate::domain::ports::{CertificateAuthority, CertificateStore, EventPublisher};
    use crate::infrastructure::in_memory::{InMemoryCertificateStore, InMemoryIdempotencyStore};
    use chrono::NaiveDate;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CountingAuthority {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CertificateAuthority for CountingAuthority {
        async fn issue(&self, _: &str, _: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(crate::error::PipelineError::Storage(
                    "authority timeout".to_string(),
                ))
            } else {
                Ok("CERT-A1B2C3D4".to_string())
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        published: Arc<Mutex<Vec<(String, Value)>>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
            self.published.lock().await.push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn event(key: &str) -> CertificateRequested {
        CertificateRequested {
            idempotency_key: key.to_string(),
            policy_ref: "POL-1".to_string(),
            policy_number: "POL/2026/0001".to_string(),
            registration_number: "KDA 123A".to_string(),
            tier: Tier::Month1,
            valid_from: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            valid_to: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            recipient_phone: Some("254700000001".to_string()),
        }
    }

    fn envelope(event: &CertificateRequested) -> Envelope {
        Envelope::new(
            topics::CERTIFICATE_REQUESTED,
            serde_json::to_value(event).unwrap(),
        )
    }

    fn consumer(
        authority: Arc<CountingAuthority>,
    ) -> (CertificateIssuanceConsumer, InMemoryCertificateStore, RecordingPublisher) {
        struct SharedAuthority(Arc<CountingAuthority>);

        #[async_trait]
        impl CertificateAuthority for SharedAuthority {
            async fn issue(&self, reg: &str, pol: &str) -> Result<String> {
                self.0.issue(reg, pol).await
            }
        }

        let certificates = InMemoryCertificateStore::new();
        let publisher = RecordingPublisher::default();
        let consumer = CertificateIssuanceConsumer::new(
            Box::new(certificates.clone()),
            Box::new(InMemoryIdempotencyStore::new()),
            Box::new(SharedAuthority(authority)),
            Box::new(publisher.clone()),
        );
        (consumer, certificates, publisher)
    }

    #[tokio::test]
    async fn test_issues_and_acks_on_success() {
        let authority = Arc::new(CountingAuthority::default());
        let (consumer, certificates, publisher) = consumer(authority.clone());
        let event = event("key-1");

        let outcome = consumer.consume(&envelope(&event)).await;
        assert_eq!(outcome, Consumption::Ack);

        let record = certificates.find_by_key("key-1").await.unwrap().unwrap();
        assert_eq!(record.status, CertificateStatus::Issued);
        assert_eq!(record.external_reference.as_deref(), Some("CERT-A1B2C3D4"));
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

        let published = publisher.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, topics::NOTIFICATION_SEND);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_skips_authority_call() {
        let authority = Arc::new(CountingAuthority::default());
        let (consumer, _, _) = consumer(authority.clone());
        let event = event("key-2");

        assert_eq!(consumer.consume(&envelope(&event)).await, Consumption::Ack);
        assert_eq!(consumer.consume(&envelope(&event)).await, Consumption::Ack);
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_authority_failure_dead_letters_and_notifies() {
        let authority = Arc::new(CountingAuthority {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (consumer, certificates, publisher) = consumer(authority);
        let event = event("key-3");

        let outcome = consumer.consume(&envelope(&event)).await;
        assert_eq!(outcome, Consumption::DeadLetter);

        let record = certificates.find_by_key("key-3").await.unwrap().unwrap();
        assert_eq!(record.status, CertificateStatus::Failed);

        let published = publisher.published.lock().await;
        assert_eq!(published.len(), 1);
        let content = published[0].1["content"].as_str().unwrap();
        assert!(content.contains("Failed to issue"));
    }

    #[tokio::test]
    async fn test_missing_record_is_rebuilt_from_event() {
        let authority = Arc::new(CountingAuthority::default());
        let (consumer, certificates, _) = consumer(authority);
        let event = event("key-4");

        // No PENDING record was persisted for this key.
        assert!(certificates.find_by_key("key-4").await.unwrap().is_none());
        assert_eq!(consumer.consume(&envelope(&event)).await, Consumption::Ack);

        let record = certificates.find_by_key("key-4").await.unwrap().unwrap();
        assert_eq!(record.status, CertificateStatus::Issued);
        assert_eq!(record.tier, Tier::Month1);
    }

    #[tokio::test]
    async fn test_malformed_payload_dead_letters() {
        let authority = Arc::new(CountingAuthority::default());
        let (consumer, _, _) = consumer(authority);
        let envelope = Envelope::new(
            topics::CERTIFICATE_REQUESTED,
            serde_json::json!({"not": "an event"}),
        );
        assert_eq!(consumer.consume(&envelope).await, Consumption::DeadLetter);
    }
}
