use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

use crate::error::Result;

/// A replay scenario for the CLI driver: the policies to seed and the
/// payment attempts to push through the pipeline, in order.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub policies: Vec<PolicyEntry>,
    pub payments: Vec<PaymentEntry>,
}

#[derive(Debug, Deserialize)]
pub struct PolicyEntry {
    pub policy_ref: String,
    pub policy_number: String,
    pub registration_number: String,
    pub total_premium: Decimal,
    pub start_date: NaiveDate,
    pub expiry_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct PaymentEntry {
    pub policy_ref: String,
    pub amount: Decimal,
    pub phone_ref: String,
    /// What the provider will report back for this attempt.
    #[serde(default)]
    pub outcome: Outcome,
    /// Forced settlement receipt; lets a scenario replay one real-world
    /// receipt against two attempts.
    #[serde(default)]
    pub receipt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Success,
    Failed,
}

/// Reads a scenario from any `Read` source (file, stdin).
pub struct ScenarioReader<R: Read> {
    source: R,
}

impl<R: Read> ScenarioReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    pub fn read(self) -> Result<Scenario> {
        Ok(serde_json::from_reader(self.source)?)
    }
}
