use crate::domain::event::NotificationChannel;
use crate::domain::money::Amount;
use crate::domain::ports::{CertificateAuthority, Notifier, PaymentGateway, PushResponse};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Deterministic gateway stand-in: accepts every push and hands out
/// sequential correlation ids. Used by the replay driver and tests.
#[derive(Default, Clone)]
pub struct SimulatedGateway {
    counter: Arc<AtomicU64>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn initiate_push(
        &self,
        phone_ref: &str,
        amount: Amount,
        account_ref: &str,
    ) -> Result<PushResponse> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!(phone_ref, %amount, account_ref, "simulated push accepted");
        Ok(PushResponse {
            code: "0".to_string(),
            description: "Success. Request accepted for processing".to_string(),
            correlation_id: Some(format!("ws_CO_{n:08}")),
        })
    }
}

/// Certificate authority stand-in. Issues synthetic references, or fails
/// every call when built with `failing()`.
#[derive(Default, Clone)]
pub struct SimulatedAuthority {
    fail: bool,
}

impl SimulatedAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl CertificateAuthority for SimulatedAuthority {
    async fn issue(&self, registration_number: &str, policy_number: &str) -> Result<String> {
        if self.fail {
            return Err(PipelineError::Storage(
                "certificate authority timed out".to_string(),
            ));
        }
        info!(registration_number, policy_number, "simulated authority call");
        let suffix = Uuid::new_v4().simple().to_string();
        Ok(format!("CERT-{}", suffix[..8].to_uppercase()))
    }
}

/// Dispatcher stand-in that only logs. Fire-and-forget, like the real one.
#[derive(Default, Clone)]
pub struct LoggingNotifier;

impl LoggingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(
        &self,
        recipient: &str,
        channel: NotificationChannel,
        subject: Option<&str>,
        content: &str,
    ) -> Result<()> {
        info!(recipient, %channel, ?subject, content, "notification dispatched");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_simulated_gateway_hands_out_unique_correlation_ids() {
        let gateway = SimulatedGateway::new();
        let amount = Amount::new(dec!(3500)).unwrap();
        let a = gateway
            .initiate_push("254700000001", amount, "APP-1")
            .await
            .unwrap();
        let b = gateway
            .initiate_push("254700000001", amount, "APP-1")
            .await
            .unwrap();
        assert!(a.accepted());
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[tokio::test]
    async fn test_failing_authority_errors() {
        let authority = SimulatedAuthority::failing();
        assert!(authority.issue("KDA 123A", "POL/2026/0001").await.is_err());
    }
}
