use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use marketplace_settlement::settings;
use marketplace_settlement::stripe::ledger::EventLedger;
use marketplace_settlement::stripe::StripeProvider;
use marketplace_settlement::webhook_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // Load configuration from environment
    let cfg = settings::Config::from_env();

    // Required secrets must be present before anything is served
    cfg.validate().context("invalid settlement configuration")?;
    tracing::info!("Starting marketplace settlement core");

    let ledger = EventLedger::open(&cfg.ledger_path)
        .with_context(|| format!("failed to open event ledger at {}", cfg.ledger_path))?;

    // One provider handle per process; everything downstream borrows it
    let provider = StripeProvider::new(cfg.stripe.clone(), ledger)?;

    webhook_server::run_webhook_server(
        cfg.server_port,
        Arc::new(provider.webhook_processor()),
        cfg.stripe.webhook_secret.clone(),
        cfg.stripe.webhook_tolerance_seconds,
    )
    .await
}
