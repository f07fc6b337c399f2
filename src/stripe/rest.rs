// Provider REST client
// One explicit forwarding method per remote operation the settlement core
// performs, with idempotency header propagation and bounded retries for
// transient failures.

use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use tracing::{info, instrument, warn};

use crate::stripe::errors::{is_transient, StripeApiError, StripeErrorEnvelope};
use crate::stripe::types::{
    ensure_minor_units, Account, AccountLink, CheckoutSession, CheckoutSessionRequest, LoginLink,
    StripeEvent,
};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// The operations this core calls against the payment provider. A closed,
/// explicit surface so the remote dependency can be mocked in tests.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn create_account(
        &self,
        country: &str,
        payout_interval: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Account, StripeApiError>;

    async fn retrieve_account(&self, account_id: &str) -> Result<Account, StripeApiError>;

    async fn update_account_metadata(
        &self,
        account_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Account, StripeApiError>;

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, StripeApiError>;

    async fn create_login_link(&self, account_id: &str) -> Result<LoginLink, StripeApiError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
        idempotency_key: Option<&str>,
    ) -> Result<CheckoutSession, StripeApiError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, StripeApiError>;

    async fn retrieve_event(&self, event_id: &str) -> Result<StripeEvent, StripeApiError>;
}

#[derive(Clone)]
pub struct StripeRestClient {
    pub(crate) http: Client,
    pub(crate) api_key: String,
    pub(crate) stripe_version: Option<String>,
    // Retry knobs with safe defaults
    pub(crate) max_retries: u32,
    pub(crate) base_delay_ms: u64,
    pub(crate) max_delay_ms: u64,
}

impl StripeRestClient {
    pub fn new(http: Client, api_key: String) -> Self {
        Self {
            http,
            api_key,
            stripe_version: None,
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }

    pub fn with_version(mut self, ver: impl Into<Option<String>>) -> Self {
        self.stripe_version = ver.into();
        self
    }

    #[allow(dead_code)]
    pub fn with_retry(mut self, max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.base_delay_ms = base_delay_ms.max(1);
        self.max_delay_ms = if max_delay_ms == 0 { self.base_delay_ms } else { max_delay_ms };
        if self.max_delay_ms < self.base_delay_ms {
            self.max_delay_ms = self.base_delay_ms;
        }
        self
    }

    fn apply_common_headers(
        &self,
        req: reqwest::RequestBuilder,
        idempotency_key: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = req.bearer_auth(&self.api_key);
        if let Some(k) = idempotency_key {
            req = req.header("Idempotency-Key", k);
        }
        if let Some(v) = &self.stripe_version {
            if !v.is_empty() {
                req = req.header("Stripe-Version", v);
            }
        }
        req
    }

    fn map_error(status: StatusCode, body: &str) -> StripeApiError {
        if let Ok(env) = serde_json::from_str::<StripeErrorEnvelope>(body) {
            env.to_api_error_with_status(Some(status.as_u16()))
        } else {
            StripeApiError::Http(format!("status={} body={}", status.as_u16(), body))
        }
    }

    async fn with_retries<F, Fut, T>(
        &self,
        desc: &str,
        max_retries: u32,
        mut op: F,
    ) -> Result<T, StripeApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StripeApiError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let (http_status, err_type) = match &e {
                        StripeApiError::Stripe { status, type_, .. } => (*status, Some(type_)),
                        StripeApiError::Http(_) => (Some(503), None),
                        StripeApiError::Transient(_) => (Some(503), None),
                        _ => (None, None),
                    };
                    let retryable = is_transient(http_status, err_type);
                    if !retryable || attempt >= max_retries {
                        return Err(e);
                    }

                    // Exponential backoff with full jitter
                    let exp = self
                        .base_delay_ms
                        .saturating_mul(1u64 << attempt.min(20));
                    let cap = exp.min(self.max_delay_ms.max(self.base_delay_ms));
                    let mut rng = SmallRng::from_entropy();
                    let delay_ms = if cap > self.base_delay_ms {
                        rng.gen_range(self.base_delay_ms..=cap)
                    } else {
                        self.base_delay_ms
                    };

                    warn!(
                        target: "stripe",
                        desc = %desc,
                        attempt = attempt + 1,
                        max_retries = max_retries,
                        http_status = ?http_status,
                        error_type = ?err_type,
                        next_delay_ms = delay_ms,
                        "retrying transient provider error"
                    );

                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    // POST application/x-www-form-urlencoded, retried on transient failures
    async fn post_form<T: DeserializeOwned>(
        &self,
        desc: &str,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
        max_retries: u32,
    ) -> Result<T, StripeApiError> {
        info!(
            target: "stripe",
            method = "POST",
            path = %path,
            idempotency_key = idempotency_key.unwrap_or(""),
            "stripe request"
        );

        let req_builder = || {
            let url = format!("{}{}", STRIPE_API_BASE, path);
            let req = self.http.post(url).form(form);
            let req = self.apply_common_headers(req, idempotency_key);
            async move {
                let resp = req.send().await.map_err(|e| StripeApiError::Http(e.to_string()))?;
                let status = resp.status();
                let text = resp.text().await.map_err(|e| StripeApiError::Decode(e.to_string()))?;
                if status.is_success() {
                    serde_json::from_str::<T>(&text).map_err(|e| StripeApiError::Decode(e.to_string()))
                } else {
                    Err(Self::map_error(status, &text))
                }
            }
        };
        self.with_retries(desc, max_retries, req_builder).await
    }

    // GET, kept lightweight: single retry only
    async fn get_json<T: DeserializeOwned>(&self, desc: &str, path: &str) -> Result<T, StripeApiError> {
        info!(target: "stripe", method = "GET", path = %path, "stripe request");

        let req_builder = || {
            let url = format!("{}{}", STRIPE_API_BASE, path);
            let req = self.http.get(url);
            let req = self.apply_common_headers(req, None);
            async move {
                let resp = req.send().await.map_err(|e| StripeApiError::Http(e.to_string()))?;
                let status = resp.status();
                let text = resp.text().await.map_err(|e| StripeApiError::Decode(e.to_string()))?;
                if status.is_success() {
                    serde_json::from_str::<T>(&text).map_err(|e| StripeApiError::Decode(e.to_string()))
                } else {
                    Err(Self::map_error(status, &text))
                }
            }
        };
        self.with_retries(desc, 1, req_builder).await
    }
}

#[async_trait]
impl ProviderApi for StripeRestClient {
    // POST /v1/accounts
    #[instrument(skip(self, metadata), fields(country = %country))]
    async fn create_account(
        &self,
        country: &str,
        payout_interval: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Account, StripeApiError> {
        let mut form: Vec<(String, String)> = vec![
            ("type".into(), "express".into()),
            ("country".into(), country.to_ascii_uppercase()),
            ("capabilities[card_payments][requested]".into(), "true".into()),
            ("capabilities[transfers][requested]".into(), "true".into()),
            (
                "settings[payouts][schedule][interval]".into(),
                payout_interval.to_string(),
            ),
        ];
        for (k, v) in metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
        }

        self.post_form("create_account", "/v1/accounts", &form, None, self.max_retries)
            .await
    }

    // GET /v1/accounts/{id}
    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn retrieve_account(&self, account_id: &str) -> Result<Account, StripeApiError> {
        self.get_json("retrieve_account", &format!("/v1/accounts/{}", account_id))
            .await
    }

    // POST /v1/accounts/{id}
    #[instrument(skip(self, metadata), fields(account_id = %account_id))]
    async fn update_account_metadata(
        &self,
        account_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Account, StripeApiError> {
        let form: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("metadata[{}]", k), v.clone()))
            .collect();

        self.post_form(
            "update_account_metadata",
            &format!("/v1/accounts/{}", account_id),
            &form,
            None,
            self.max_retries,
        )
        .await
    }

    // POST /v1/account_links
    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> Result<AccountLink, StripeApiError> {
        let form: Vec<(String, String)> = vec![
            ("account".into(), account_id.to_string()),
            ("refresh_url".into(), refresh_url.to_string()),
            ("return_url".into(), return_url.to_string()),
            ("type".into(), "account_onboarding".into()),
        ];

        self.post_form(
            "create_account_link",
            "/v1/account_links",
            &form,
            None,
            self.max_retries,
        )
        .await
    }

    // POST /v1/accounts/{id}/login_links
    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn create_login_link(&self, account_id: &str) -> Result<LoginLink, StripeApiError> {
        let form: Vec<(String, String)> = Vec::new();
        self.post_form(
            "create_login_link",
            &format!("/v1/accounts/{}/login_links", account_id),
            &form,
            None,
            self.max_retries,
        )
        .await
    }

    // POST /v1/checkout/sessions
    // Two priced line items plus the destination-transfer and platform-fee
    // instructions, so the provider enforces the split atomically.
    #[instrument(skip(self, request), fields(destination = %request.destination_account, idempotency_key = ?idempotency_key))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
        idempotency_key: Option<&str>,
    ) -> Result<CheckoutSession, StripeApiError> {
        ensure_minor_units(request.application_fee_minor, &request.currency)
            .map_err(|_| StripeApiError::Precondition("non-negative minor units and a valid currency required"))?;

        let mut form: Vec<(String, String)> = vec![("mode".into(), "payment".into())];

        for (i, item) in request.line_items.iter().enumerate() {
            ensure_minor_units(item.unit_amount_minor, &request.currency)
                .map_err(|_| StripeApiError::Precondition("line item amounts must be non-negative minor units"))?;
            form.push((
                format!("line_items[{}][price_data][currency]", i),
                request.currency.to_ascii_lowercase(),
            ));
            form.push((
                format!("line_items[{}][price_data][product_data][name]", i),
                item.name.clone(),
            ));
            form.push((
                format!("line_items[{}][price_data][unit_amount]", i),
                item.unit_amount_minor.to_string(),
            ));
            form.push((format!("line_items[{}][quantity]", i), item.quantity.to_string()));
        }

        form.push((
            "payment_intent_data[transfer_data][destination]".into(),
            request.destination_account.clone(),
        ));
        form.push((
            "payment_intent_data[application_fee_amount]".into(),
            request.application_fee_minor.to_string(),
        ));

        // Correlation metadata on both the session and its payment intent, so
        // webhook handlers can reconstruct intent without a second lookup.
        for (k, v) in &request.metadata {
            form.push((format!("metadata[{}]", k), v.clone()));
            form.push((format!("payment_intent_data[metadata][{}]", k), v.clone()));
        }

        form.push(("success_url".into(), request.success_url.clone()));
        form.push(("cancel_url".into(), request.cancel_url.clone()));
        if let Some(email) = &request.customer_email {
            form.push(("customer_email".into(), email.clone()));
        }

        self.post_form(
            "create_checkout_session",
            "/v1/checkout/sessions",
            &form,
            idempotency_key,
            self.max_retries,
        )
        .await
    }

    // GET /v1/checkout/sessions/{id}
    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, StripeApiError> {
        self.get_json(
            "retrieve_checkout_session",
            &format!("/v1/checkout/sessions/{}", session_id),
        )
        .await
    }

    // GET /v1/events/{id}
    #[instrument(skip(self), fields(event_id = %event_id))]
    async fn retrieve_event(&self, event_id: &str) -> Result<StripeEvent, StripeApiError> {
        self.get_json("retrieve_event", &format!("/v1/events/{}", event_id))
            .await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Hand-rolled ProviderApi mock shared by the orchestration tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MockProvider {
        pub account: Mutex<Option<Account>>,
        pub event: Mutex<Option<StripeEvent>>,
        pub retrieve_account_calls: AtomicUsize,
        pub create_session_calls: AtomicUsize,
        pub retrieve_event_calls: AtomicUsize,
        pub last_session_request: Mutex<Option<(CheckoutSessionRequest, Option<String>)>>,
    }

    impl MockProvider {
        pub fn with_account(account: Account) -> Self {
            let mock = Self::default();
            *mock.account.lock().unwrap() = Some(account);
            mock
        }

        pub fn retrieve_event_count(&self) -> usize {
            self.retrieve_event_calls.load(Ordering::SeqCst)
        }

        pub fn create_session_count(&self) -> usize {
            self.create_session_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderApi for MockProvider {
        async fn create_account(
            &self,
            country: &str,
            _payout_interval: &str,
            metadata: &HashMap<String, String>,
        ) -> Result<Account, StripeApiError> {
            Ok(Account {
                id: "acct_new".to_string(),
                details_submitted: false,
                charges_enabled: false,
                payouts_enabled: false,
                requirements: None,
                country: Some(country.to_string()),
                metadata: Some(metadata.clone()),
            })
        }

        async fn retrieve_account(&self, account_id: &str) -> Result<Account, StripeApiError> {
            self.retrieve_account_calls.fetch_add(1, Ordering::SeqCst);
            self.account
                .lock()
                .unwrap()
                .clone()
                .filter(|a| a.id == account_id)
                .ok_or(StripeApiError::Precondition("no such account"))
        }

        async fn update_account_metadata(
            &self,
            account_id: &str,
            metadata: &HashMap<String, String>,
        ) -> Result<Account, StripeApiError> {
            let mut account = self
                .account
                .lock()
                .unwrap()
                .clone()
                .filter(|a| a.id == account_id)
                .ok_or(StripeApiError::Precondition("no such account"))?;
            account.metadata = Some(metadata.clone());
            Ok(account)
        }

        async fn create_account_link(
            &self,
            account_id: &str,
            _refresh_url: &str,
            _return_url: &str,
        ) -> Result<AccountLink, StripeApiError> {
            Ok(AccountLink {
                url: format!("https://connect.stripe.com/setup/{}", account_id),
                expires_at: None,
            })
        }

        async fn create_login_link(&self, account_id: &str) -> Result<LoginLink, StripeApiError> {
            Ok(LoginLink {
                url: format!("https://connect.stripe.com/express/{}", account_id),
            })
        }

        async fn create_checkout_session(
            &self,
            request: &CheckoutSessionRequest,
            idempotency_key: Option<&str>,
        ) -> Result<CheckoutSession, StripeApiError> {
            self.create_session_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_session_request.lock().unwrap() =
                Some((request.clone(), idempotency_key.map(String::from)));
            Ok(CheckoutSession {
                id: "cs_test_123".to_string(),
                url: Some("https://checkout.stripe.com/c/pay/cs_test_123".to_string()),
                status: Some("open".to_string()),
                payment_status: Some("unpaid".to_string()),
                payment_intent: None,
                amount_total: Some(
                    request.line_items.iter().map(|i| i.unit_amount_minor).sum(),
                ),
                currency: Some(request.currency.clone()),
                metadata: Some(request.metadata.clone()),
            })
        }

        async fn retrieve_checkout_session(
            &self,
            session_id: &str,
        ) -> Result<CheckoutSession, StripeApiError> {
            Ok(CheckoutSession {
                id: session_id.to_string(),
                url: None,
                status: Some("complete".to_string()),
                payment_status: Some("paid".to_string()),
                payment_intent: None,
                amount_total: None,
                currency: None,
                metadata: None,
            })
        }

        async fn retrieve_event(&self, event_id: &str) -> Result<StripeEvent, StripeApiError> {
            self.retrieve_event_calls.fetch_add(1, Ordering::SeqCst);
            self.event
                .lock()
                .unwrap()
                .clone()
                .filter(|e| e.id == event_id)
                .ok_or(StripeApiError::Precondition("no such event"))
        }
    }
}
