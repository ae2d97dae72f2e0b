use crate::domain::event::{topics, Consumption, Envelope};
use crate::domain::ports::{Consumer, EventPublisher};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// In-process at-least-once topic bus with dead-letter routing.
///
/// Messages published before a subscriber exists are buffered, so nothing is
/// lost across startup ordering. A consumer's `Retry` re-enqueues the
/// envelope with an incremented delivery count until the budget runs out;
/// exhausted and explicitly dead-lettered envelopes land in the topic's
/// `.dlq` store for inspection instead of silent loss.
#[derive(Clone)]
pub struct TopicBus {
    senders: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
    pending: Arc<RwLock<HashMap<String, Vec<Envelope>>>>,
    dead_letters: Arc<RwLock<HashMap<String, Vec<Envelope>>>>,
    in_flight: Arc<AtomicUsize>,
    max_deliveries: u32,
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELIVERIES)
    }
}

impl TopicBus {
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            senders: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            dead_letters: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_deliveries,
        }
    }

    async fn deliver(&self, envelope: Envelope) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let undelivered = {
            let senders = self.senders.read().await;
            match senders.get(&envelope.topic) {
                // A send error means the subscriber went away; keep the
                // message for the next one.
                Some(sender) => sender.send(envelope).err().map(|err| err.0),
                None => Some(envelope),
            }
        };
        if let Some(envelope) = undelivered {
            self.buffer(envelope).await;
        }
    }

    async fn buffer(&self, envelope: Envelope) {
        let mut pending = self.pending.write().await;
        pending
            .entry(envelope.topic.clone())
            .or_default()
            .push(envelope);
    }

    /// Registers the single consumer channel for a topic, draining any
    /// messages published before it existed.
    async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut senders = self.senders.write().await;
            senders.insert(topic.to_string(), tx.clone());
        }
        let mut pending = self.pending.write().await;
        if let Some(buffered) = pending.remove(topic) {
            for envelope in buffered {
                let _ = tx.send(envelope);
            }
        }
        rx
    }

    /// Spawns the consumption loop for one topic.
    pub fn run(&self, topic: &str, consumer: Arc<dyn Consumer>) -> JoinHandle<()> {
        let bus = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut rx = bus.subscribe(&topic).await;
            info!(topic = %topic, "consumer loop started");
            while let Some(envelope) = rx.recv().await {
                let outcome = consumer.consume(&envelope).await;
                match outcome {
                    Consumption::Ack => {}
                    Consumption::Retry if envelope.deliveries < bus.max_deliveries => {
                        warn!(
                            topic = %topic,
                            envelope_id = %envelope.id,
                            deliveries = envelope.deliveries,
                            "redelivering"
                        );
                        let mut retry = envelope.clone();
                        retry.deliveries += 1;
                        bus.deliver(retry).await;
                    }
                    Consumption::Retry | Consumption::DeadLetter => {
                        bus.dead_letter(envelope.clone()).await;
                    }
                }
                bus.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
    }

    async fn dead_letter(&self, envelope: Envelope) {
        warn!(
            topic = %envelope.topic,
            envelope_id = %envelope.id,
            deliveries = envelope.deliveries,
            "routing to dead-letter store"
        );
        let mut dead = self.dead_letters.write().await;
        dead.entry(topics::dead_letter(&envelope.topic))
            .or_default()
            .push(envelope);
    }

    /// Dead-lettered envelopes for a topic, oldest first.
    pub async fn dead_letters(&self, topic: &str) -> Vec<Envelope> {
        let dead = self.dead_letters.read().await;
        dead.get(&topics::dead_letter(topic))
            .cloned()
            .unwrap_or_default()
    }

    /// Waits until every published envelope has reached a terminal outcome
    /// (acked or dead-lettered). Test and shutdown helper.
    pub async fn drained(&self) {
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EventPublisher for TopicBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.deliver(Envelope::new(topic, payload)).await;
        Ok(())
    }
}
