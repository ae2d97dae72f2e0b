use bima::application::issuance::CertificateIssuanceConsumer;
use bima::application::notifications::NotificationConsumer;
use bima::application::payments::PaymentService;
use bima::domain::event::topics;
use bima::domain::money::Amount;
use bima::domain::payment::ProviderCallback;
use bima::domain::policy::PolicySnapshot;
use bima::domain::ports::{CertificateStore, PolicyStore};
use bima::infrastructure::bus::TopicBus;
use bima::infrastructure::in_memory::{
    InMemoryCallbackLog, InMemoryCertificateStore, InMemoryIdempotencyStore, InMemoryIntentStore,
    InMemoryPolicyStore,
};
use bima::infrastructure::stub::{LoggingNotifier, SimulatedAuthority, SimulatedGateway};
use bima::interfaces::json::scenario::{Outcome, ScenarioReader};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario file: policies to seed and payment attempts to replay
    scenario: PathBuf,

    /// Fail every certificate-authority call (exercises dead-lettering)
    #[arg(long)]
    fail_authority: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let policies = InMemoryPolicyStore::new();
    let intents = InMemoryIntentStore::new();
    let certificates = InMemoryCertificateStore::new();
    let guard = InMemoryIdempotencyStore::new();
    let bus = TopicBus::default();

    let service = PaymentService::new(
        Box::new(policies.clone()),
        Box::new(intents.clone()),
        Box::new(certificates.clone()),
        Box::new(guard.clone()),
        Box::new(SimulatedGateway::new()),
        Box::new(bus.clone()),
        Box::new(InMemoryCallbackLog::new()),
    );

    let authority = if cli.fail_authority {
        SimulatedAuthority::failing()
    } else {
        SimulatedAuthority::new()
    };
    bus.run(
        topics::CERTIFICATE_REQUESTED,
        Arc::new(CertificateIssuanceConsumer::new(
            Box::new(certificates.clone()),
            Box::new(guard.clone()),
            Box::new(authority),
            Box::new(bus.clone()),
        )),
    );
    bus.run(
        topics::NOTIFICATION_SEND,
        Arc::new(NotificationConsumer::new(
            Box::new(LoggingNotifier::new()),
            Box::new(guard.clone()),
        )),
    );

    let file = File::open(&cli.scenario).into_diagnostic()?;
    let scenario = ScenarioReader::new(file).read().into_diagnostic()?;

    for entry in &scenario.policies {
        let premium = Amount::new(entry.total_premium).into_diagnostic()?;
        policies
            .insert(PolicySnapshot::new(
                entry.policy_ref.as_str(),
                entry.policy_number.as_str(),
                entry.registration_number.as_str(),
                premium,
                entry.start_date,
                entry.expiry_date,
            ))
            .await
            .into_diagnostic()?;
    }

    let mut receipt_seq = 0u64;
    for entry in &scenario.payments {
        let amount = match Amount::new(entry.amount) {
            Ok(amount) => amount,
            Err(err) => {
                eprintln!("Skipping payment for {}: {err}", entry.policy_ref);
                continue;
            }
        };
        let intent = match service
            .initiate(&entry.policy_ref, amount, &entry.phone_ref)
            .await
        {
            Ok(intent) => intent,
            Err(err) => {
                eprintln!("Payment rejected for {}: {err}", entry.policy_ref);
                continue;
            }
        };

        let callback = match entry.outcome {
            Outcome::Success => {
                receipt_seq += 1;
                ProviderCallback {
                    correlation_id: intent.provider_correlation_id.clone(),
                    result_code: 0,
                    result_desc: "The service request is processed successfully.".to_string(),
                    receipt_id: Some(
                        entry
                            .receipt
                            .clone()
                            .unwrap_or_else(|| format!("RCT{receipt_seq:07}")),
                    ),
                }
            }
            Outcome::Failed => ProviderCallback {
                correlation_id: intent.provider_correlation_id.clone(),
                result_code: 1032,
                result_desc: "Request cancelled by user.".to_string(),
                receipt_id: None,
            },
        };

        if let Err(err) = service.reconcile(callback).await {
            eprintln!(
                "Reconciliation stopped for {}: {err}",
                intent.provider_correlation_id
            );
        }
    }

    bus.drained().await;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for entry in &scenario.policies {
        let Some(policy) = policies.get(&entry.policy_ref).await.into_diagnostic()? else {
            continue;
        };
        let certs = certificates
            .for_policy(&entry.policy_ref)
            .await
            .into_diagnostic()?;
        let summary = if certs.is_empty() {
            "-".to_string()
        } else {
            certs
                .iter()
                .map(|c| format!("{}:{}", c.tier, c.status))
                .collect::<Vec<_>>()
                .join("|")
        };
        writeln!(out, "{},{},{}", policy.policy_ref, policy.balance, summary).into_diagnostic()?;
    }

    for topic in [topics::CERTIFICATE_REQUESTED, topics::NOTIFICATION_SEND] {
        let dead = bus.dead_letters(topic).await;
        if !dead.is_empty() {
            writeln!(out, "dead-letter,{topic},{}", dead.len()).into_diagnostic()?;
        }
    }

    Ok(())
}
