use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use pettag_backend::{
    AppState,
    config::Config,
    gateway::{
        DisabledMessenger, DisabledPayments, LogMailer, Messenger, PaymentGateway,
        StripeGateway, TwilioMessenger,
    },
    init_router,
    store::{MemoryStore, PgStore, Store},
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const MEMORY_DATABASE_URL: &str = "memory://";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let store: Arc<dyn Store> = if config.database_url == MEMORY_DATABASE_URL {
        warn!("using the in-memory store, data is lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::connect(&config.database_url, config.database_max_connections).await?)
    };

    let payments: Arc<dyn PaymentGateway> = match StripeGateway::from_config(&config) {
        Some(gateway) => Arc::new(gateway),
        None => {
            warn!("STRIPE_SECRET_KEY not set, payments are disabled");
            Arc::new(DisabledPayments)
        }
    };
    let messenger: Arc<dyn Messenger> = match TwilioMessenger::from_config(&config) {
        Some(messenger) => Arc::new(messenger),
        None => {
            warn!("Twilio credentials not set, SMS is disabled");
            Arc::new(DisabledMessenger)
        }
    };

    let port = config.server_port;
    let app_state = AppState {
        store,
        payments,
        messenger,
        mailer: Arc::new(LogMailer),
        config,
    };

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;
    let app = init_router(app_state);

    info!("Listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
