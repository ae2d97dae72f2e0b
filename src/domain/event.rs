use super::certificate::Tier;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Topic names, paired with `.dlq` stores by the bus.
pub mod topics {
    pub const CERTIFICATE_REQUESTED: &str = "certificate.requested";
    pub const NOTIFICATION_SEND: &str = "notification.send";

    pub fn dead_letter(topic: &str) -> String {
        format!("{topic}.dlq")
    }
}

/// Asks the issuance consumer to obtain one certificate from the external
/// authority. `idempotency_key` identifies the logical request across any
/// number of deliveries and matches the PENDING `CertificateRecord` created
/// alongside the publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRequested {
    pub idempotency_key: String,
    pub policy_ref: String,
    pub policy_number: String,
    pub registration_number: String,
    pub tier: Tier,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
    pub recipient_phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    Sms,
    Email,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationChannel::Sms => write!(f, "SMS"),
            NotificationChannel::Email => write!(f, "EMAIL"),
        }
    }
}

/// Fire-and-forget notification request; drained by the notification
/// consumer and handed to the dispatcher port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSend {
    pub event_id: String,
    pub recipient: String,
    pub channel: NotificationChannel,
    pub subject: Option<String>,
    pub content: String,
}

impl NotificationSend {
    pub fn sms(recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            recipient: recipient.into(),
            channel: NotificationChannel::Sms,
            subject: None,
            content: content.into(),
        }
    }
}

/// What a consumer decided about one delivery. Redelivery is signalled
/// through this result, not through panics or error propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    /// Handled (or safely ignored); the message is done.
    Ack,
    /// Transient failure; the bus should redeliver, dead-lettering once the
    /// delivery budget is exhausted.
    Retry,
    /// Unresolvable here; route straight to the dead-letter store for
    /// inspection instead of silent loss.
    DeadLetter,
}

/// One delivery of a published message. `deliveries` starts at 1 and grows
/// with each redelivery of the same envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub topic: String,
    pub deliveries: u32,
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            deliveries: 1,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_serializes_with_wire_names() {
        let event = CertificateRequested {
            idempotency_key: "k".to_string(),
            policy_ref: "POL-1".to_string(),
            policy_number: "POL/2026/0001".to_string(),
            registration_number: "KDA 123A".to_string(),
            tier: Tier::AnnualRemainder,
            valid_from: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            valid_to: NaiveDate::from_ymd_opt(2027, 1, 14).unwrap(),
            recipient_phone: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tier"], "ANNUAL_REMAINDER");

        let back: CertificateRequested = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_dead_letter_topic_naming() {
        assert_eq!(
            topics::dead_letter(topics::CERTIFICATE_REQUESTED),
            "certificate.requested.dlq"
        );
    }
}
