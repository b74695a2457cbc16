//! Payment processor contract
//!
//! The ledger only ever needs three processor calls. [`crate::client::StripeClient`]
//! implements them against Stripe; tests use a scripted fake.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;

/// Processor-side status of a payment intent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    Unknown(String),
}

impl ProcessorIntentStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "requires_payment_method" => Self::RequiresPaymentMethod,
            "requires_confirmation" => Self::RequiresConfirmation,
            "requires_action" => Self::RequiresAction,
            "processing" => Self::Processing,
            "requires_capture" => Self::RequiresCapture,
            "canceled" => Self::Canceled,
            "succeeded" => Self::Succeeded,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::Processing => "processing",
            Self::RequiresCapture => "requires_capture",
            Self::Canceled => "canceled",
            Self::Succeeded => "succeeded",
            Self::Unknown(s) => s,
        }
    }
}

impl std::fmt::Display for ProcessorIntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the processor reports about one intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorIntent {
    pub id: String,
    pub status: ProcessorIntentStatus,
    pub amount_cents: i64,
}

/// Parameters for a new booking charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIntentRequest {
    pub amount_cents: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
    /// Replays with the same key return the original intent
    pub idempotency_key: String,
    pub customer_id: Option<String>,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn retrieve_payment_intent(&self, payment_intent_id: &str)
        -> BillingResult<ProcessorIntent>;

    /// Fails with `ResourceMissing` or `UnexpectedState` codes when the intent
    /// is gone or already terminal
    async fn cancel_payment_intent(&self, payment_intent_id: &str)
        -> BillingResult<ProcessorIntent>;

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> BillingResult<ProcessorIntent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(
            ProcessorIntentStatus::parse("succeeded"),
            ProcessorIntentStatus::Succeeded
        );
        assert_eq!(
            ProcessorIntentStatus::parse("requires_action").as_str(),
            "requires_action"
        );
        let unknown = ProcessorIntentStatus::parse("on_hold");
        assert_eq!(unknown, ProcessorIntentStatus::Unknown("on_hold".into()));
        assert_eq!(unknown.to_string(), "on_hold");
    }
}
