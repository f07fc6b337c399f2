// Payment provider module

pub mod checkout;
pub mod errors;
pub mod fees;
pub mod ledger;
pub mod metrics;
pub mod onboarding;
pub mod rest;
pub mod settlement_state;
pub mod types;
pub mod webhook;

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::settings::StripeSettings;
use self::checkout::CheckoutBuilder;
use self::ledger::EventLedger;
use self::onboarding::OnboardingResolver;
use self::rest::{ProviderApi, StripeRestClient};
use self::settlement_state::SettlementState;
use self::webhook::WebhookProcessor;

/// Single handle to the payment provider. Constructed once at startup and
/// shared by cloning; there is no per-call mutable state, so concurrent use
/// needs no further coordination.
#[derive(Clone)]
pub struct StripeProvider {
    cfg: StripeSettings,
    api: Arc<dyn ProviderApi>,
    state: Arc<SettlementState>,
    ledger: EventLedger,
}

impl StripeProvider {
    // Build reqwest client with rustls and timeout from cfg.
    pub fn new(cfg: StripeSettings, ledger: EventLedger) -> Result<Self, errors::StripeApiError> {
        let timeout = Duration::from_millis(if cfg.timeout_ms > 0 { cfg.timeout_ms } else { 15_000 });
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| errors::StripeApiError::Http(e.to_string()))?;

        let rest = StripeRestClient::new(http, cfg.secret_key.clone()).with_version(
            if cfg.stripe_version.is_empty() {
                None
            } else {
                Some(cfg.stripe_version.clone())
            },
        );

        let state = Arc::new(SettlementState::new().with_ttl(cfg.state_ttl));

        Ok(Self {
            cfg,
            api: Arc::new(rest),
            state,
            ledger,
        })
    }

    pub fn api(&self) -> Arc<dyn ProviderApi> {
        Arc::clone(&self.api)
    }

    pub fn checkout_builder(&self) -> CheckoutBuilder {
        CheckoutBuilder::new(self.api(), self.cfg.default_currency.clone())
    }

    pub fn onboarding(&self) -> OnboardingResolver {
        OnboardingResolver::new(self.api())
    }

    pub fn webhook_processor(&self) -> WebhookProcessor {
        WebhookProcessor::new(self.api(), self.ledger.clone(), Arc::clone(&self.state))
    }

    pub fn settlement_state(&self) -> Arc<SettlementState> {
        Arc::clone(&self.state)
    }

    pub fn webhook_secret(&self) -> &str {
        &self.cfg.webhook_secret
    }

    pub fn webhook_tolerance_seconds(&self) -> i64 {
        self.cfg.webhook_tolerance_seconds
    }
}
