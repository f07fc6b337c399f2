// Checkout session construction: onboarding gate, fee breakdown, and the
// provider request that enforces the split atomically.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

use crate::stripe::errors::StripeApiError;
use crate::stripe::fees::{compute_breakdown, FeeError, PaymentBreakdown};
use crate::stripe::onboarding::{OnboardingResolver, OnboardingStatus};
use crate::stripe::rest::ProviderApi;
use crate::stripe::types::{CheckoutSessionRequest, LineItem};

const SERVICE_FEE_LABEL: &str = "Service fee";

// Literal placeholder the provider substitutes with the real session id on
// redirect.
const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

#[derive(Debug, Clone)]
pub struct CheckoutParams {
    pub task_id: String,
    pub task_title: String,
    pub task_price_minor: i64,
    pub payer_id: String,
    pub payee_id: String,
    pub payee_account_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub payer_email: Option<String>,
    /// Falls back to the configured default currency when absent.
    pub currency: Option<String>,
    /// Distinguishes deliberate new payment attempts from network retries.
    /// The idempotency key sent to the provider is derived from this plus the
    /// task and payee ids, so a blind retry cannot double-create a session.
    pub attempt_nonce: String,
}

/// One created, provider-hosted payment transaction. Immutable once built;
/// the amounts always equal the breakdown used to build it.
#[derive(Debug, Clone)]
pub struct CreatedCheckout {
    pub session_id: String,
    pub checkout_url: String,
    pub breakdown: PaymentBreakdown,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    InvalidAmount(#[from] FeeError),
    #[error("payee account is not fully onboarded to receive funds")]
    PayeeNotOnboarded { status: OnboardingStatus },
    #[error("provider call failed: {0}")]
    Api(#[from] StripeApiError),
    #[error("provider returned a session without a checkout URL")]
    MissingCheckoutUrl,
}

pub struct CheckoutBuilder {
    api: Arc<dyn ProviderApi>,
    resolver: OnboardingResolver,
    default_currency: String,
}

impl CheckoutBuilder {
    pub fn new(api: Arc<dyn ProviderApi>, default_currency: impl Into<String>) -> Self {
        Self {
            resolver: OnboardingResolver::new(Arc::clone(&api)),
            api,
            default_currency: default_currency.into(),
        }
    }

    /// Creates exactly one remote session per call.
    #[instrument(skip(self, params), fields(task_id = %params.task_id, payee_id = %params.payee_id))]
    pub async fn build(&self, params: CheckoutParams) -> Result<CreatedCheckout, CheckoutError> {
        // Gate on payout eligibility before any money moves. The snapshot
        // rides in the error so callers can name the missing requirement.
        let status = self.resolver.resolve(&params.payee_account_id).await?;
        if !status.is_fully_onboarded() {
            return Err(CheckoutError::PayeeNotOnboarded { status });
        }

        let currency = params.currency.as_deref().unwrap_or(&self.default_currency);
        let breakdown = compute_breakdown(params.task_price_minor, currency)?;

        let mut metadata = breakdown.metadata();
        metadata.insert("task_id".to_string(), params.task_id.clone());
        metadata.insert("payer_id".to_string(), params.payer_id.clone());
        metadata.insert("payee_id".to_string(), params.payee_id.clone());

        let request = CheckoutSessionRequest {
            currency: breakdown.currency.clone(),
            line_items: vec![
                LineItem {
                    name: params.task_title.clone(),
                    unit_amount_minor: breakdown.task_price_minor,
                    quantity: 1,
                },
                LineItem {
                    name: SERVICE_FEE_LABEL.to_string(),
                    unit_amount_minor: breakdown.payer_fee_minor,
                    quantity: 1,
                },
            ],
            destination_account: params.payee_account_id.clone(),
            application_fee_minor: breakdown.platform_fee_minor,
            success_url: compose_success_url(&params.success_url),
            cancel_url: params.cancel_url.clone(),
            customer_email: params.payer_email.clone(),
            metadata,
        };

        let key = idempotency_key(&params.task_id, &params.payee_id, &params.attempt_nonce);
        let session = self.api.create_checkout_session(&request, Some(&key)).await?;
        let checkout_url = session.url.clone().ok_or(CheckoutError::MissingCheckoutUrl)?;

        info!(
            session_id = %session.id,
            total_charge_minor = breakdown.total_charge_minor,
            platform_fee_minor = breakdown.platform_fee_minor,
            "created checkout session"
        );

        Ok(CreatedCheckout {
            session_id: session.id,
            checkout_url,
            breakdown,
        })
    }
}

/// Appends the session-id placeholder with `&` when the success URL already
/// has a query string, `?` otherwise.
fn compose_success_url(success_url: &str) -> String {
    let sep = if success_url.contains('?') { '&' } else { '?' };
    format!("{}{}session_id={}", success_url, sep, SESSION_ID_PLACEHOLDER)
}

fn idempotency_key(task_id: &str, payee_id: &str, attempt_nonce: &str) -> String {
    format!("checkout_{}_{}_{}", task_id, payee_id, attempt_nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripe::rest::mock::MockProvider;
    use crate::stripe::types::{Account, AccountRequirements};

    fn payee_account(details: bool, charges: bool, payouts: bool) -> Account {
        Account {
            id: "acct_helper".to_string(),
            details_submitted: details,
            charges_enabled: charges,
            payouts_enabled: payouts,
            requirements: Some(AccountRequirements {
                currently_due: vec!["external_account".to_string()],
                ..Default::default()
            }),
            country: None,
            metadata: None,
        }
    }

    fn params() -> CheckoutParams {
        CheckoutParams {
            task_id: "task-1".to_string(),
            task_title: "Assemble flat-pack wardrobe".to_string(),
            task_price_minor: 10_000,
            payer_id: "user-4".to_string(),
            payee_id: "helper-9".to_string(),
            payee_account_id: "acct_helper".to_string(),
            success_url: "https://example.com/tasks/1/paid".to_string(),
            cancel_url: "https://example.com/tasks/1".to_string(),
            payer_email: Some("payer@example.com".to_string()),
            currency: None,
            attempt_nonce: "a1".to_string(),
        }
    }

    fn builder(mock: &Arc<MockProvider>) -> CheckoutBuilder {
        let api: Arc<dyn ProviderApi> = mock.clone();
        CheckoutBuilder::new(api, "eur")
    }

    #[tokio::test]
    async fn rejects_when_any_capability_is_missing() {
        for (details, charges, payouts) in [
            (false, true, true),
            (true, false, true),
            (true, true, false),
        ] {
            let mock = Arc::new(MockProvider::with_account(payee_account(
                details, charges, payouts,
            )));
            let err = builder(&mock).build(params()).await.unwrap_err();
            match err {
                CheckoutError::PayeeNotOnboarded { status } => {
                    assert!(!status.is_fully_onboarded());
                    assert_eq!(status.next_requirement(), Some("external_account"));
                }
                other => panic!("expected PayeeNotOnboarded, got {:?}", other),
            }
            // The gate fails before any session is created
            assert_eq!(mock.create_session_count(), 0);
        }
    }

    #[tokio::test]
    async fn session_amounts_equal_the_breakdown() {
        let mock = Arc::new(MockProvider::with_account(payee_account(true, true, true)));
        let created = builder(&mock).build(params()).await.unwrap();

        assert_eq!(created.session_id, "cs_test_123");
        assert_eq!(created.breakdown.total_charge_minor, 10_200);

        let (request, key) = mock.last_session_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.line_items.len(), 2);
        assert_eq!(request.line_items[0].unit_amount_minor, 10_000);
        assert_eq!(request.line_items[1].unit_amount_minor, 200);
        assert_eq!(request.line_items[1].name, SERVICE_FEE_LABEL);
        assert_eq!(request.application_fee_minor, 1_200);
        assert_eq!(request.destination_account, "acct_helper");
        assert_eq!(key.as_deref(), Some("checkout_task-1_helper-9_a1"));
    }

    #[tokio::test]
    async fn metadata_correlates_task_and_parties() {
        let mock = Arc::new(MockProvider::with_account(payee_account(true, true, true)));
        builder(&mock).build(params()).await.unwrap();

        let (request, _) = mock.last_session_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.metadata.get("task_id").unwrap(), "task-1");
        assert_eq!(request.metadata.get("payer_id").unwrap(), "user-4");
        assert_eq!(request.metadata.get("payee_id").unwrap(), "helper-9");
        assert_eq!(request.metadata.get("platform_fee_minor").unwrap(), "1200");
        assert_eq!(request.metadata.get("payee_receives_minor").unwrap(), "9000");
    }

    #[tokio::test]
    async fn invalid_amount_never_reaches_the_provider() {
        let mock = Arc::new(MockProvider::with_account(payee_account(true, true, true)));
        let mut p = params();
        p.task_price_minor = -50;

        let err = builder(&mock).build(p).await.unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidAmount(FeeError::InvalidAmount)));
        assert_eq!(mock.create_session_count(), 0);
    }

    #[tokio::test]
    async fn currency_falls_back_to_default() {
        let mock = Arc::new(MockProvider::with_account(payee_account(true, true, true)));
        let created = builder(&mock).build(params()).await.unwrap();
        assert_eq!(created.breakdown.currency, "eur");

        let mut p = params();
        p.currency = Some("USD".to_string());
        let created = builder(&mock).build(p).await.unwrap();
        assert_eq!(created.breakdown.currency, "usd");
    }

    #[test]
    fn success_url_composition() {
        assert_eq!(
            compose_success_url("https://x/y"),
            "https://x/y?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            compose_success_url("https://x/y?a=1"),
            "https://x/y?a=1&session_id={CHECKOUT_SESSION_ID}"
        );
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        assert_eq!(
            idempotency_key("task-1", "helper-9", "a1"),
            idempotency_key("task-1", "helper-9", "a1")
        );
        assert_ne!(
            idempotency_key("task-1", "helper-9", "a1"),
            idempotency_key("task-1", "helper-9", "a2")
        );
    }
}
