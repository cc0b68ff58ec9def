//! Sehaty Orders - order, payment and inventory service

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sehaty_orders::api::{self, AppState};
use sehaty_orders::config::Config;
use sehaty_orders::domain::events::EventPublisher;
use sehaty_orders::payment::{PaymobClient, SignatureVerifier};
use sehaty_orders::store::{MemoryStore, PgStore};
use sehaty_orders::{OrderService, ServiceSettings};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let gateway = Arc::new(PaymobClient::new(config.gateway.clone())?);
    let signatures = SignatureVerifier::new(config.gateway.hmac_secret.clone());
    let settings = ServiceSettings { deep_link_scheme: config.deep_link_scheme.clone(), callback_url: config.callback_url() };

    let orders = match &config.database_url {
        Some(url) => {
            let db = PgPoolOptions::new().max_connections(10).connect(url).await?;
            sqlx::migrate!("./migrations").run(&db).await?;
            OrderService::new(PgStore::new(db), gateway, signatures, settings)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            OrderService::new(MemoryStore::new(), gateway, signatures, settings)
        }
    };

    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, order events will not be published");
                None
            }
        },
        None => None,
    };
    let orders = orders.with_events(EventPublisher::new(nats));

    let app = api::router(AppState { orders });
    tracing::info!(environment = %config.environment, gateway_mode = ?config.gateway.mode, "Sehaty orders listening on 0.0.0.0:{}", config.port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?, app).await?;
    Ok(())
}
