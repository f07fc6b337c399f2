//! Payment settlement core for a local-services marketplace.
//!
//! Computes how a task payment is split between the platform, the payer and
//! the service provider, builds provider-hosted checkout sessions that
//! enforce that split atomically, gates on payee onboarding, and processes
//! asynchronous provider notifications exactly once.

pub mod settings;
pub mod stripe;
pub mod webhook_server;
