use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Crate-wide error taxonomy.
///
/// Rejected-at-entry variants (`PolicyAlreadySettled`, `InsufficientFirstPayment`,
/// `GatewayRejected`) are surfaced synchronously to the initiating caller before
/// any state is mutated. Terminal-reconciliation variants (`IntentNotFound`,
/// `ReceiptConflict`) mark callbacks that can never be resolved by retrying.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("policy not found: {0}")]
    PolicyNotFound(String),
    #[error("no payment intent matches correlation id: {0}")]
    IntentNotFound(String),
    #[error("policy {0} is already fully paid")]
    PolicyAlreadySettled(String),
    #[error("first payment must be at least {required} (got {offered})")]
    InsufficientFirstPayment { required: Decimal, offered: Decimal },
    #[error("payment gateway rejected the push: [{code}] {description}")]
    GatewayRejected { code: String, description: String },
    #[error("receipt {0} is already settled against another intent")]
    ReceiptConflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
