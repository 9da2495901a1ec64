//! OpenSASE Storefront - Self-hosted fashion storefront

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opensase_storefront::config::{AppConfig, StorageBackend};
use opensase_storefront::http::{build_router, AppState};
use opensase_storefront::payment::{DisabledGateway, PaymentGateway, SslCommerzGateway};
use opensase_storefront::publisher::EventPublisher;
use opensase_storefront::seed::seed_sample_data;
use opensase_storefront::store::{MemoryStore, PgStore, StorefrontStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn StorefrontStore> = match (config.storage, config.database_url.as_deref()) {
        (StorageBackend::Postgres, Some(url)) => {
            let store = PgStore::connect(url, config.database_max_connections).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Arc::new(store)
        }
        (StorageBackend::Postgres, None) => anyhow::bail!("DATABASE_URL must be set for postgres storage"),
        (StorageBackend::Memory, _) => {
            warn!("using in-memory storage; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let events = EventPublisher::connect(config.nats_url.as_deref()).await;

    if config.seed_sample_data {
        seed_sample_data(store.clone()).await?;
    }

    let gateway: Arc<dyn PaymentGateway> = match &config.gateway {
        Some(g) => Arc::new(SslCommerzGateway::new(&g.store_id, &g.store_password, g.sandbox)?),
        None => {
            warn!("SSLCommerz credentials missing; payments are disabled");
            Arc::new(DisabledGateway)
        }
    };

    let port = config.port;
    let state = AppState::new(config, store, gateway, events);
    state.orders.clone().spawn_expiry_sweeper();

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("🚀 OpenSASE Storefront listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
