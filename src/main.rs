//! Gavel server binary
//!
//! Loads settings, connects Postgres, migrates the schema, starts the
//! engine and serves the gateway until interrupted.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use gavel::auth::JwtVerifier;
use gavel::gateway;
use gavel::settings::GavelSettings;
use gavel::storage::{PgStore, Store};
use gavel::AuctionEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,gavel=debug")),
        )
        .init();

    let mut settings = load_settings()?;
    if let Ok(url) = std::env::var("GAVEL_DATABASE_URL") {
        settings.database.url = url;
    }
    if let Ok(secret) = std::env::var("GAVEL_JWT_SECRET") {
        settings.auth.jwt_secret = secret;
    }

    let store = Arc::new(PgStore::connect(&settings.database).await?);
    store.migrate().await?;
    let store: Arc<dyn Store> = store;

    let verifier = Arc::new(JwtVerifier::new(&settings.auth, store.clone()));
    let engine = AuctionEngine::start(settings.clone(), store, verifier).await?;

    let app = gateway::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr).await?;
    info!(addr = %settings.server.bind_addr, "gavel listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    engine.shutdown().await;
    Ok(())
}

fn load_settings() -> Result<GavelSettings, Box<dyn std::error::Error>> {
    let path = std::env::var("GAVEL_CONFIG").unwrap_or_else(|_| "gavel.toml".to_string());
    if Path::new(&path).exists() {
        info!(%path, "loading settings");
        Ok(GavelSettings::load(&path)?)
    } else {
        Ok(GavelSettings::default())
    }
}
