// Webhook processing: signature verification against the raw body, thin-event
// refetch of the canonical object, durable dedupe, and per-event-type
// handlers.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, instrument, warn};

use crate::settlement_counter_inc;
use crate::stripe::errors::WebhookError;
use crate::stripe::ledger::{EventLedger, EventRecord};
use crate::stripe::onboarding::OnboardingStatus;
use crate::stripe::rest::ProviderApi;
use crate::stripe::settlement_state::{SettlementState, SettlementStatus};
use crate::stripe::types::{
    Account, Capability, CheckoutSession, PaymentIntent, Payout, StripeEvent, Transfer,
};

/// Result of handling one verified, deduplicated delivery.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub success: bool,
    pub event_id: String,
    pub event_type: String,
    pub message: Option<String>,
}

impl HandlerOutcome {
    fn ok(event_id: &str, event_type: &str, message: Option<String>) -> Self {
        Self {
            success: true,
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            message,
        }
    }

    fn soft_failure(event_id: &str, event_type: &str, message: String) -> Self {
        Self {
            success: false,
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            message: Some(message),
        }
    }
}

/// Verify the provider webhook signature using HMAC SHA-256
pub fn verify_signature(
    payload: &[u8],
    headers: &http::HeaderMap,
    webhook_secret: &str,
    tolerance_seconds: i64,
) -> Result<(), WebhookError> {
    if webhook_secret.is_empty() {
        return Err(WebhookError::MissingSecret);
    }

    // Extract Stripe-Signature header
    let signature_header = headers
        .get("stripe-signature")
        .or_else(|| headers.get("Stripe-Signature"))
        .ok_or(WebhookError::MissingSignature)?
        .to_str()
        .map_err(|e| WebhookError::InvalidSignature(format!("Invalid header encoding: {}", e)))?;

    // Parse signature header: t=timestamp,v1=signature[,v1=signature2,...]
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() != 2 {
            continue;
        }
        match kv[0] {
            "t" => {
                timestamp = kv[1].parse().ok();
            }
            "v1" => {
                signatures.push(kv[1]);
            }
            _ => {} // Ignore unknown fields
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        WebhookError::InvalidSignature("Missing timestamp in signature header".to_string())
    })?;

    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature(
            "No v1 signature found".to_string(),
        ));
    }

    // Check timestamp tolerance
    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| WebhookError::InvalidSignature(format!("System time error: {}", e)))?
        .as_secs() as i64;

    let time_diff = (current_time - timestamp).abs();
    if time_diff > tolerance_seconds {
        return Err(WebhookError::TimestampTolerance(format!(
            "Timestamp {} differs from current time {} by {} seconds (tolerance: {})",
            timestamp, current_time, time_diff, tolerance_seconds
        )));
    }

    // Construct signed payload: timestamp.payload
    let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));

    // Compute expected signature using HMAC-SHA256
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(format!("HMAC init error: {}", e)))?;
    mac.update(signed_payload.as_bytes());
    let expected_signature = hex::encode(mac.finalize().into_bytes());

    // Compare with provided signatures (constant-time comparison)
    let signature_valid = signatures.iter().any(|sig| {
        expected_signature.as_bytes().len() == sig.as_bytes().len()
            && expected_signature
                .as_bytes()
                .iter()
                .zip(sig.as_bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    });

    if !signature_valid {
        return Err(WebhookError::InvalidSignature(
            "Signature mismatch".to_string(),
        ));
    }

    debug!(
        timestamp = timestamp,
        time_diff = time_diff,
        "Webhook signature verified successfully"
    );

    Ok(())
}

// Only the id is trusted from the delivered body; everything else is
// refetched from the provider.
#[derive(Debug, Deserialize)]
struct ThinEvent {
    id: String,
}

pub struct WebhookProcessor {
    api: Arc<dyn ProviderApi>,
    ledger: EventLedger,
    state: Arc<SettlementState>,
}

impl WebhookProcessor {
    pub fn new(api: Arc<dyn ProviderApi>, ledger: EventLedger, state: Arc<SettlementState>) -> Self {
        Self { api, ledger, state }
    }

    /// Process one inbound delivery:
    /// received → signature-verified → event-refetched → deduped → routed →
    /// handled (success | soft-failure).
    ///
    /// Returns `Err` only for pre-verification failures; once the signature
    /// checks out the delivery is acknowledged and any later failure becomes
    /// a soft outcome escalated for manual reconciliation.
    #[instrument(skip_all)]
    pub async fn process(
        &self,
        payload: &[u8],
        headers: &http::HeaderMap,
        webhook_secret: &str,
        tolerance_seconds: i64,
    ) -> Result<HandlerOutcome, WebhookError> {
        verify_signature(payload, headers, webhook_secret, tolerance_seconds)?;
        settlement_counter_inc!("settlement.webhook.received");

        let thin: ThinEvent = match serde_json::from_slice(payload) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "verified webhook payload did not parse; escalating");
                return Ok(HandlerOutcome::soft_failure(
                    "",
                    "unknown",
                    format!("malformed payload: {}", e),
                ));
            }
        };

        // Thin-event pattern: the delivered body is only a pointer, the
        // canonical object comes from the provider API.
        let evt = match self.api.retrieve_event(&thin.id).await {
            Ok(evt) => evt,
            Err(e) => {
                error!(event_id = %thin.id, error = %e, "failed to refetch canonical event; escalating");
                return Ok(HandlerOutcome::soft_failure(
                    &thin.id,
                    "unknown",
                    format!("refetch failed: {}", e),
                ));
            }
        };

        // Claim before handling: redelivery of the same id must be a no-op.
        match self.ledger.try_claim(&evt.id, &evt.event_type) {
            Ok(true) => {}
            Ok(false) => {
                debug!(event_id = %evt.id, "event already processed; acknowledging redelivery");
                settlement_counter_inc!("settlement.webhook.duplicate", "event_type" => &evt.event_type);
                return Ok(HandlerOutcome::ok(
                    &evt.id,
                    &evt.event_type,
                    Some("already processed".to_string()),
                ));
            }
            Err(e) => {
                error!(event_id = %evt.id, error = %e, "dedupe ledger unavailable; escalating");
                return Ok(HandlerOutcome::soft_failure(
                    &evt.id,
                    &evt.event_type,
                    format!("ledger error: {}", e),
                ));
            }
        }

        let outcome = match self.dispatch(&evt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    event_id = %evt.id,
                    event_type = %evt.event_type,
                    error = %e,
                    "handler failed; escalating for manual reconciliation"
                );
                settlement_counter_inc!("settlement.webhook.handler_failed", "event_type" => &evt.event_type);
                HandlerOutcome::soft_failure(&evt.id, &evt.event_type, e.to_string())
            }
        };

        let record = EventRecord {
            event_type: evt.event_type.clone(),
            success: outcome.success,
            message: outcome.message.clone(),
            processed_at: unix_now(),
        };
        if let Err(e) = self.ledger.record_outcome(&evt.id, &record) {
            warn!(event_id = %evt.id, error = %e, "failed to record handler outcome");
        }

        Ok(outcome)
    }

    /// Dispatch a canonical event to its handler by type
    async fn dispatch(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let event_type = evt.event_type.as_str();

        debug!(
            event_id = %evt.id,
            event_type = %event_type,
            "Processing webhook event"
        );

        match event_type {
            "account.updated" => self.handle_account_updated(evt).await,
            "capability.updated" => self.handle_capability_updated(evt).await,
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                self.handle_checkout_settled(evt).await
            }
            "checkout.session.async_payment_failed" => self.handle_checkout_failed(evt).await,
            "payment_intent.succeeded" => self.handle_intent_succeeded(evt).await,
            "payment_intent.payment_failed" => self.handle_intent_failed(evt).await,
            "transfer.created" => self.handle_transfer_created(evt).await,
            "payout.paid" => self.handle_payout_paid(evt).await,
            "payout.failed" => self.handle_payout_failed(evt).await,
            _ => {
                info!(event_type = %event_type, "Acknowledging unhandled event type");
                settlement_counter_inc!("settlement.webhook.ignored", "event_type" => event_type);
                Ok(HandlerOutcome::ok(
                    &evt.id,
                    event_type,
                    Some("unhandled event type".to_string()),
                ))
            }
        }
    }

    /// Capability change on a connected account. The onboarding stage is
    /// re-derived from the snapshot alone; the resolver remains the source of
    /// truth for gating.
    async fn handle_account_updated(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let account: Account = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse Account: {}", e)))?;

        let status = OnboardingStatus::from_account(&account);
        info!(
            account_id = %status.account_id,
            stage = ?status.stage(),
            fully_onboarded = status.is_fully_onboarded(),
            next_requirement = status.next_requirement().unwrap_or("none"),
            "Connected account capabilities changed"
        );
        settlement_counter_inc!("settlement.onboarding.updated");

        Ok(HandlerOutcome::ok(
            &evt.id,
            &evt.event_type,
            Some(format!("account {} stage {:?}", status.account_id, status.stage())),
        ))
    }

    async fn handle_capability_updated(
        &self,
        evt: &StripeEvent,
    ) -> Result<HandlerOutcome, WebhookError> {
        let capability: Capability = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse Capability: {}", e)))?;

        info!(
            capability_id = %capability.id,
            account_id = %capability.account,
            status = %capability.status,
            "Account capability updated"
        );
        settlement_counter_inc!("settlement.onboarding.capability_updated");

        Ok(HandlerOutcome::ok(
            &evt.id,
            &evt.event_type,
            Some(format!("capability {} now {}", capability.id, capability.status)),
        ))
    }

    async fn handle_checkout_settled(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let session: CheckoutSession = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse CheckoutSession: {}", e)))?;

        let amount_minor = session.amount_total.unwrap_or_default();
        let currency = session.currency.clone().unwrap_or_default();
        let task_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("task_id").cloned())
            .unwrap_or_default();

        info!(
            session_id = %session.id,
            task_id = %task_id,
            amount_total = amount_minor,
            currency = %currency,
            "Checkout session settled"
        );

        let receivers = self
            .state
            .publish_status(
                &session.id,
                SettlementStatus::Settled {
                    amount_minor,
                    currency,
                },
                Some("Payment completed successfully".to_string()),
            )
            .await
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to publish status: {}", e)))?;

        if receivers > 0 {
            self.state.mark_completed(&session.id).await;
            settlement_counter_inc!("settlement.checkout.settled", "has_waiter" => "true");
        } else {
            debug!(
                session_id = %session.id,
                "Checkout settled but no waiters registered"
            );
            settlement_counter_inc!("settlement.checkout.settled", "has_waiter" => "false");
        }

        Ok(HandlerOutcome::ok(&evt.id, &evt.event_type, None))
    }

    async fn handle_checkout_failed(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let session: CheckoutSession = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse CheckoutSession: {}", e)))?;

        warn!(
            session_id = %session.id,
            payment_status = %session.payment_status.as_deref().unwrap_or("unknown"),
            "Checkout async payment failed"
        );

        let reason = "Asynchronous payment failed".to_string();
        self.state
            .publish_status(
                &session.id,
                SettlementStatus::Failed { reason: reason.clone() },
                Some(reason),
            )
            .await
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to publish status: {}", e)))?;

        self.state.mark_completed(&session.id).await;
        settlement_counter_inc!("settlement.checkout.failed");

        Ok(HandlerOutcome::ok(&evt.id, &evt.event_type, None))
    }

    async fn handle_intent_succeeded(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let intent: PaymentIntent = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse PaymentIntent: {}", e)))?;

        info!(
            payment_intent_id = %intent.id,
            amount = intent.amount,
            currency = %intent.currency,
            "Payment intent succeeded"
        );

        let receivers = self
            .state
            .publish_status(
                &intent.id,
                SettlementStatus::Settled {
                    amount_minor: intent.amount,
                    currency: intent.currency.clone(),
                },
                Some("Payment completed successfully".to_string()),
            )
            .await
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to publish status: {}", e)))?;

        if receivers > 0 {
            self.state.mark_completed(&intent.id).await;
        }
        settlement_counter_inc!("settlement.payment.succeeded");

        Ok(HandlerOutcome::ok(&evt.id, &evt.event_type, None))
    }

    async fn handle_intent_failed(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let intent: PaymentIntent = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse PaymentIntent: {}", e)))?;

        warn!(
            payment_intent_id = %intent.id,
            status = %intent.status,
            "Payment intent failed"
        );

        let reason = format!("Payment failed with status: {}", intent.status);
        self.state
            .publish_status(
                &intent.id,
                SettlementStatus::Failed { reason: reason.clone() },
                Some(reason),
            )
            .await
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to publish status: {}", e)))?;

        self.state.mark_completed(&intent.id).await;
        settlement_counter_inc!("settlement.payment.failed");

        Ok(HandlerOutcome::ok(&evt.id, &evt.event_type, None))
    }

    async fn handle_transfer_created(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let transfer: Transfer = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse Transfer: {}", e)))?;

        info!(
            transfer_id = %transfer.id,
            amount = transfer.amount,
            currency = %transfer.currency,
            destination = %transfer.destination,
            "Transfer to payee account created"
        );

        self.state
            .publish_status(
                &transfer.id,
                SettlementStatus::Settled {
                    amount_minor: transfer.amount,
                    currency: transfer.currency.clone(),
                },
                Some("Funds routed to payee account".to_string()),
            )
            .await
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to publish status: {}", e)))?;

        settlement_counter_inc!("settlement.transfer.created");

        Ok(HandlerOutcome::ok(&evt.id, &evt.event_type, None))
    }

    async fn handle_payout_paid(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let payout: Payout = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse Payout: {}", e)))?;

        info!(
            payout_id = %payout.id,
            amount = payout.amount,
            currency = %payout.currency,
            "Payout paid"
        );

        self.state
            .publish_status(
                &payout.id,
                SettlementStatus::Settled {
                    amount_minor: payout.amount,
                    currency: payout.currency.clone(),
                },
                Some("Payout completed successfully".to_string()),
            )
            .await
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to publish status: {}", e)))?;

        self.state.mark_completed(&payout.id).await;
        settlement_counter_inc!("settlement.payout.paid");

        Ok(HandlerOutcome::ok(&evt.id, &evt.event_type, None))
    }

    async fn handle_payout_failed(&self, evt: &StripeEvent) -> Result<HandlerOutcome, WebhookError> {
        let payout: Payout = serde_json::from_value(evt.data.object.clone())
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to parse Payout: {}", e)))?;

        warn!(
            payout_id = %payout.id,
            status = %payout.status,
            failure_code = %payout.failure_code.as_deref().unwrap_or("unknown"),
            failure_message = %payout.failure_message.as_deref().unwrap_or("no message"),
            "Payout failed"
        );

        let reason = format!(
            "Payout failed: {} - {}",
            payout.failure_code.as_deref().unwrap_or("unknown"),
            payout.failure_message.as_deref().unwrap_or("no details provided")
        );

        self.state
            .publish_status(
                &payout.id,
                SettlementStatus::Failed { reason: reason.clone() },
                Some(reason),
            )
            .await
            .map_err(|e| WebhookError::ProcessingFailed(format!("Failed to publish status: {}", e)))?;

        self.state.mark_completed(&payout.id).await;
        settlement_counter_inc!("settlement.payout.failed");

        Ok(HandlerOutcome::ok(&evt.id, &evt.event_type, None))
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stripe::rest::mock::MockProvider;
    use crate::stripe::types::StripeEventData;

    fn sign(payload: &[u8], secret: &str) -> http::HeaderMap {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let timestamp = unix_now();
        let signed_payload = format!("{}.{}", timestamp, String::from_utf8_lossy(payload));
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut headers = http::HeaderMap::new();
        headers.insert(
            "stripe-signature",
            format!("t={},v1={}", timestamp, signature).parse().unwrap(),
        );
        headers
    }

    fn checkout_completed_event(event_id: &str, session_id: &str) -> StripeEvent {
        StripeEvent {
            id: event_id.to_string(),
            event_type: "checkout.session.completed".to_string(),
            data: StripeEventData {
                object: serde_json::json!({
                    "id": session_id,
                    "amount_total": 10_200,
                    "currency": "eur",
                    "payment_status": "paid",
                    "metadata": {"task_id": "task-1"}
                }),
                previous_attributes: None,
            },
            created: Some(unix_now()),
            livemode: Some(false),
        }
    }

    fn processor(
        mock: Arc<MockProvider>,
    ) -> (WebhookProcessor, Arc<SettlementState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = EventLedger::open(dir.path().join("ledger.redb")).unwrap();
        let state = Arc::new(SettlementState::new());
        (
            WebhookProcessor::new(mock, ledger, Arc::clone(&state)),
            state,
            dir,
        )
    }

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_verify_signature_valid() {
        let payload = br#"{"id":"evt_test"}"#;
        let headers = sign(payload, SECRET);
        assert!(verify_signature(payload, &headers, SECRET, 300).is_ok());
    }

    #[test]
    fn test_verify_signature_invalid() {
        let payload = br#"{"id":"evt_test"}"#;
        let timestamp = unix_now();
        let wrong = "0000000000000000000000000000000000000000000000000000000000000000";

        let mut headers = http::HeaderMap::new();
        headers.insert(
            "stripe-signature",
            format!("t={},v1={}", timestamp, wrong).parse().unwrap(),
        );

        let result = verify_signature(payload, &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_verify_signature_missing_header() {
        let headers = http::HeaderMap::new();
        let result = verify_signature(b"test", &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::MissingSignature)));
    }

    #[test]
    fn test_verify_signature_missing_secret() {
        let payload = b"test";
        let headers = sign(payload, SECRET);
        let result = verify_signature(payload, &headers, "", 300);
        assert!(matches!(result, Err(WebhookError::MissingSecret)));
    }

    #[test]
    fn test_verify_signature_timestamp_tolerance() {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let payload = b"test";
        let old_timestamp = 1000i64;

        let signed_payload = format!("{}.{}", old_timestamp, String::from_utf8_lossy(payload));
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut headers = http::HeaderMap::new();
        headers.insert(
            "stripe-signature",
            format!("t={},v1={}", old_timestamp, signature).parse().unwrap(),
        );

        let result = verify_signature(payload, &headers, SECRET, 300);
        assert!(matches!(result, Err(WebhookError::TimestampTolerance(_))));
    }

    #[tokio::test]
    async fn invalid_signature_never_reaches_dispatch() {
        let mock = Arc::new(MockProvider::default());
        *mock.event.lock().unwrap() = Some(checkout_completed_event("evt_1", "cs_1"));
        let (processor, _state, _dir) = processor(mock.clone());

        let payload = br#"{"id":"evt_1"}"#;
        let mut headers = http::HeaderMap::new();
        headers.insert("stripe-signature", "t=1,v1=deadbeef".parse().unwrap());

        let result = processor.process(payload, &headers, SECRET, i64::MAX).await;
        assert!(result.is_err());
        // The payload was never trusted: no refetch, no handler
        assert_eq!(mock.retrieve_event_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_applies_side_effect_once() {
        let mock = Arc::new(MockProvider::default());
        *mock.event.lock().unwrap() = Some(checkout_completed_event("evt_1", "cs_1"));
        let (processor, state, _dir) = processor(mock.clone());

        let mut rx = state.register_waiter("cs_1").await.unwrap();

        let payload = br#"{"id":"evt_1"}"#;
        let headers = sign(payload, SECRET);

        let first = processor.process(payload, &headers, SECRET, 300).await.unwrap();
        assert!(first.success);

        let second = processor.process(payload, &headers, SECRET, 300).await.unwrap();
        assert!(second.success);
        assert_eq!(second.message.as_deref(), Some("already processed"));

        // Exactly one settlement update despite two deliveries
        let update = rx.try_recv().unwrap();
        assert_eq!(update.object_id, "cs_1");
        assert_eq!(
            update.status,
            SettlementStatus::Settled {
                amount_minor: 10_200,
                currency: "eur".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unrecognized_event_type_is_acknowledged() {
        let mock = Arc::new(MockProvider::default());
        *mock.event.lock().unwrap() = Some(StripeEvent {
            id: "evt_2".to_string(),
            event_type: "some.future.event".to_string(),
            data: StripeEventData {
                object: serde_json::json!({}),
                previous_attributes: None,
            },
            created: None,
            livemode: None,
        });
        let (processor, _state, _dir) = processor(mock);

        let payload = br#"{"id":"evt_2"}"#;
        let headers = sign(payload, SECRET);

        let outcome = processor.process(payload, &headers, SECRET, 300).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("unhandled event type"));
    }

    #[tokio::test]
    async fn handler_failure_becomes_soft_outcome() {
        let mock = Arc::new(MockProvider::default());
        // Canonical object is missing required fields, so the handler errors
        *mock.event.lock().unwrap() = Some(StripeEvent {
            id: "evt_3".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            data: StripeEventData {
                object: serde_json::json!({"unexpected": true}),
                previous_attributes: None,
            },
            created: None,
            livemode: None,
        });
        let (processor, _state, _dir) = processor(mock);

        let payload = br#"{"id":"evt_3"}"#;
        let headers = sign(payload, SECRET);

        // The delivery is still acknowledged (Ok), but as a soft failure
        let outcome = processor.process(payload, &headers, SECRET, 300).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.event_type, "payment_intent.succeeded");
    }

    #[tokio::test]
    async fn refetch_failure_becomes_soft_outcome() {
        let mock = Arc::new(MockProvider::default()); // no event stored
        let (processor, _state, _dir) = processor(mock.clone());

        let payload = br#"{"id":"evt_unknown"}"#;
        let headers = sign(payload, SECRET);

        let outcome = processor.process(payload, &headers, SECRET, 300).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(mock.retrieve_event_count(), 1);
    }

    #[tokio::test]
    async fn account_updated_derives_stage_from_snapshot() {
        let mock = Arc::new(MockProvider::default());
        *mock.event.lock().unwrap() = Some(StripeEvent {
            id: "evt_4".to_string(),
            event_type: "account.updated".to_string(),
            data: StripeEventData {
                object: serde_json::json!({
                    "id": "acct_1",
                    "details_submitted": true,
                    "charges_enabled": true,
                    "payouts_enabled": false,
                    "requirements": {"currently_due": ["external_account"]}
                }),
                previous_attributes: None,
            },
            created: None,
            livemode: None,
        });
        let (processor, _state, _dir) = processor(mock);

        let payload = br#"{"id":"evt_4"}"#;
        let headers = sign(payload, SECRET);

        let outcome = processor.process(payload, &headers, SECRET, 300).await.unwrap();
        assert!(outcome.success);
        assert_eq!(
            outcome.message.as_deref(),
            Some("account acct_1 stage ChargesEnabled")
        );
    }
}
