//! Billing error types

use thiserror::Error;

use crate::model::RosterVersion;

/// Error codes reported by the payment processor that the ledger special-cases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorErrorCode {
    /// The payment intent does not exist at the processor
    ResourceMissing,
    /// The intent is already in a state that forbids the requested action
    UnexpectedState,
    /// Any other processor failure (network, auth, rate limit...)
    Other(String),
}

impl std::fmt::Display for ProcessorErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorErrorCode::ResourceMissing => write!(f, "resource_missing"),
            ProcessorErrorCode::UnexpectedState => write!(f, "payment_intent_unexpected_state"),
            ProcessorErrorCode::Other(code) => write!(f, "{}", code),
        }
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not enough guest passes: {available} available, {requested} requested")]
    InsufficientPasses { available: u32, requested: u32 },

    #[error("Roster was modified by someone else (current version {current_version})")]
    RosterConflict { current_version: RosterVersion },

    #[error("Payment processor error ({code}): {message}")]
    ExternalProcessor {
        code: ProcessorErrorCode,
        message: String,
    },

    #[error("Transaction failed: {0}")]
    TransactionFailure(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),
}

impl BillingError {
    /// Stable machine-readable code for callers shaping responses
    pub fn error_code(&self) -> &'static str {
        match self {
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::InvalidInput(_) => "INVALID_INPUT",
            BillingError::InsufficientPasses { .. } => "INSUFFICIENT_PASSES",
            BillingError::RosterConflict { .. } => "ROSTER_CONFLICT",
            BillingError::ExternalProcessor { .. } => "EXTERNAL_PROCESSOR_ERROR",
            BillingError::TransactionFailure(_) => "TRANSACTION_FAILURE",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Config(_) => "CONFIGURATION_ERROR",
            BillingError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            BillingError::WebhookEventNotSupported(_) => "WEBHOOK_EVENT_NOT_SUPPORTED",
        }
    }

    /// Processor error code, if this error came from the processor
    pub fn processor_code(&self) -> Option<&ProcessorErrorCode> {
        match self {
            BillingError::ExternalProcessor { code, .. } => Some(code),
            _ => None,
        }
    }

    pub(crate) fn processor(code: ProcessorErrorCode, message: impl Into<String>) -> Self {
        BillingError::ExternalProcessor {
            code,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        let code = match &e {
            stripe::StripeError::Stripe(request_error) => match request_error.code {
                Some(stripe::ErrorCode::ResourceMissing) => ProcessorErrorCode::ResourceMissing,
                Some(stripe::ErrorCode::PaymentIntentUnexpectedState) => {
                    ProcessorErrorCode::UnexpectedState
                }
                _ => ProcessorErrorCode::Other(format!("http_{}", request_error.http_status)),
            },
            stripe::StripeError::Timeout => ProcessorErrorCode::Other("timeout".to_string()),
            _ => ProcessorErrorCode::Other("client_error".to_string()),
        };

        BillingError::processor(code, e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let conflict = BillingError::RosterConflict {
            current_version: RosterVersion::new(4),
        };
        assert_eq!(conflict.error_code(), "ROSTER_CONFLICT");
        assert!(conflict.to_string().contains("current version 4"));

        let passes = BillingError::InsufficientPasses {
            available: 1,
            requested: 2,
        };
        assert_eq!(passes.error_code(), "INSUFFICIENT_PASSES");
        assert!(passes.to_string().contains("1 available"));
    }

    #[test]
    fn test_processor_code_display() {
        assert_eq!(
            ProcessorErrorCode::ResourceMissing.to_string(),
            "resource_missing"
        );
        assert_eq!(
            ProcessorErrorCode::UnexpectedState.to_string(),
            "payment_intent_unexpected_state"
        );

        let err = BillingError::processor(ProcessorErrorCode::ResourceMissing, "No such intent");
        assert_eq!(
            err.processor_code(),
            Some(&ProcessorErrorCode::ResourceMissing)
        );
        assert_eq!(BillingError::NotFound("x".into()).processor_code(), None);
    }

    #[test]
    fn test_stripe_timeout_maps_to_processor_error() {
        let err: BillingError = stripe::StripeError::Timeout.into();
        assert_eq!(err.error_code(), "EXTERNAL_PROCESSOR_ERROR");
        assert_eq!(
            err.processor_code(),
            Some(&ProcessorErrorCode::Other("timeout".into()))
        );
    }
}
