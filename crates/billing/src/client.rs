//! Stripe client wrapper

use async_trait::async_trait;
use stripe::{
    CancelPaymentIntent, CreatePaymentIntent, Currency, CustomerId, PaymentIntent,
    PaymentIntentId, RequestStrategy,
};

use crate::error::{BillingError, BillingResult};
use crate::processor::{
    CreateIntentRequest, PaymentProcessor, ProcessorIntent, ProcessorIntentStatus,
};

/// Stripe credentials
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Load config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_else(|_| {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook verification will fail");
            String::new()
        });

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Thin wrapper over `stripe::Client` plus its config
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

fn parse_intent_id(payment_intent_id: &str) -> BillingResult<PaymentIntentId> {
    payment_intent_id.parse().map_err(|e| {
        BillingError::InvalidInput(format!(
            "Invalid payment intent ID '{}': {}",
            payment_intent_id, e
        ))
    })
}

fn to_processor_intent(intent: &PaymentIntent) -> ProcessorIntent {
    ProcessorIntent {
        id: intent.id.to_string(),
        status: ProcessorIntentStatus::parse(intent.status.as_str()),
        amount_cents: intent.amount,
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<ProcessorIntent> {
        let id = parse_intent_id(payment_intent_id)?;
        let intent = PaymentIntent::retrieve(&self.inner, &id, &[]).await?;
        Ok(to_processor_intent(&intent))
    }

    async fn cancel_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<ProcessorIntent> {
        let id = parse_intent_id(payment_intent_id)?;
        let intent = PaymentIntent::cancel(&self.inner, &id, CancelPaymentIntent::default()).await?;

        tracing::info!(
            payment_intent_id = %payment_intent_id,
            status = %intent.status.as_str(),
            "Cancelled payment intent at Stripe"
        );

        Ok(to_processor_intent(&intent))
    }

    async fn create_payment_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> BillingResult<ProcessorIntent> {
        let customer: Option<CustomerId> = match &request.customer_id {
            Some(id) => Some(id.parse().map_err(|e| {
                BillingError::InvalidInput(format!("Invalid customer ID '{}': {}", id, e))
            })?),
            None => None,
        };

        let mut params = CreatePaymentIntent::new(request.amount_cents, Currency::USD);
        params.description = Some(request.description.as_str());
        params.metadata = Some(request.metadata.clone());
        params.customer = customer;

        let client = self
            .inner
            .clone()
            .with_strategy(RequestStrategy::Idempotent(request.idempotency_key.clone()));
        let intent = PaymentIntent::create(&client, params).await?;

        tracing::info!(
            payment_intent_id = %intent.id,
            amount_cents = request.amount_cents,
            "Created payment intent"
        );

        Ok(to_processor_intent(&intent))
    }
}
