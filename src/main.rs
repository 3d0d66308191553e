//! Zentinel SSO service
//!
//! Serves SSO login initiation, the OAuth and SAML callbacks, SP metadata
//! and session lookup over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use zentinel_sso::config::load_providers_file;
use zentinel_sso::provider::RedbProviderStore;
use zentinel_sso::saml::default_verifier;
use zentinel_sso::storage::open_database;
use zentinel_sso::{router, Args, SsoConfig, SsoController, SsoStores};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting Zentinel SSO");

    let config = SsoConfig::from_args(&args)?;

    info!(
        base_url = %config.base_url,
        sp_entity_id = %config.sp_entity_id,
        state_ttl_secs = config.state_ttl_secs,
        clock_skew_secs = config.clock_skew_secs,
        "Configuration loaded"
    );

    let db = open_database(&config.database_path)?;
    info!(path = ?config.database_path, "Database opened");

    if let Some(ref path) = config.providers_file {
        let providers = load_providers_file(path)?;
        let store = RedbProviderStore::new(db.clone())?;
        for provider in &providers {
            store
                .upsert(provider)
                .with_context(|| format!("Failed to store provider {}", provider.id))?;
        }
        info!(path = ?path, count = providers.len(), "Providers loaded");
    }

    let stores = SsoStores::open(db)?;
    let controller = Arc::new(SsoController::new(config.clone(), stores, default_verifier())?);
    let app = router(controller);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(address = %config.listen, "Listening");

    axum::serve(listener, app).await.context("HTTP server failed")?;

    Ok(())
}
