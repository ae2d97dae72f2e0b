use crate::domain::event::{Consumption, Envelope, NotificationSend};
use crate::domain::ports::{Consumer, IdempotencyStoreBox, NotifierBox};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info};

const MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Drains `notification.send` events into the dispatcher port. Dispatch is
/// fire-and-forget from the pipeline's point of view; a failed dispatch is
/// dead-lettered for inspection, not retried here.
pub struct NotificationConsumer {
    notifier: NotifierBox,
    guard: IdempotencyStoreBox,
}

impl NotificationConsumer {
    pub fn new(notifier: NotifierBox, guard: IdempotencyStoreBox) -> Self {
        Self { notifier, guard }
    }

    async fn handle(&self, event: &NotificationSend) -> Result<Consumption> {
        let key = format!("notification:{}", event.event_id);
        if self.guard.is_duplicate(&key).await? {
            info!(event_id = %event.event_id, "duplicate notification delivery, skipping");
            return Ok(Consumption::Ack);
        }

        match self
            .notifier
            .send(
                &event.recipient,
                event.channel,
                event.subject.as_deref(),
                &event.content,
            )
            .await
        {
            Ok(()) => {
                self.guard.record(&key, MARKER_TTL).await?;
                info!(
                    recipient = %event.recipient,
                    channel = %event.channel,
                    "notification dispatched"
                );
                Ok(Consumption::Ack)
            }
            Err(err) => {
                error!(event_id = %event.event_id, %err, "notification dispatch failed");
                Ok(Consumption::DeadLetter)
            }
        }
    }
}

#[async_trait]
impl Consumer for NotificationConsumer {
    async fn consume(&self, envelope: &Envelope) -> Consumption {
        let event: NotificationSend = match serde_json::from_value(envelope.payload.clone()) {
            Ok(event) => event,
            Err(err) => {
                error!(envelope_id = %envelope.id, %err, "malformed notification event");
                return Consumption::DeadLetter;
            }
        };
        match self.handle(&event).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(event_id = %event.event_id, %err, "notification handling failed");
                Consumption::Retry
            }
        }
    }
}
