use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use course_market as api;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::MigratorTrait;
use tokio::{signal, sync::mpsc};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let mut options = ConnectOptions::new(cfg.database_url.clone());
    options
        .max_connections(10)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Arc::new(
        Database::connect(options)
            .await
            .context("failed to connect to database")?,
    );
    if cfg.auto_migrate {
        api::migrator::Migrator::up(&*db, None)
            .await
            .map_err(|e| {
                error!("Failed running migrations: {}", e);
                e
            })?;
    }

    // Init cache
    let backend = api::cache::CacheFactory::create_cache(cfg.cache.backend, &cfg.redis_url).await?;
    let cache = api::cache::CacheStore::with_retry_config(
        backend,
        api::middleware_helpers::RetryConfig::fixed(
            cfg.cache.retry_attempts,
            cfg.cache.retry_delay(),
        ),
    );

    // Init events
    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(api::events::EventSender::new(event_tx));
    tokio::spawn(api::events::process_events(
        event_rx,
        vec![Arc::new(api::events::LoggingSubscriber)],
    ));

    // Payment gateway
    let fx_provider = api::services::payments::HttpExchangeRateProvider::new(
        cfg.payment.fx_api_url.clone(),
        cfg.payment.http_timeout(),
    )?;
    let converter = api::services::payments::CurrencyConverter::new(
        Arc::new(fx_provider),
        cfg.payment.local_currency.clone(),
        cfg.payment.settlement_currency.clone(),
        cfg.payment.fx_fallback_rate,
    );
    let gateway = api::services::payments::PayPalGateway::new(
        api::services::payments::PayPalConfig::from_payment_config(&cfg.payment),
        converter,
    )?;
    if cfg.payment.paypal_client_id.is_none() {
        info!("PayPal credentials not configured; checkout will be rejected");
    }

    let services = api::handlers::AppServices::new(
        api::repositories::RepositorySet::sea_orm(db.clone()),
        cache.clone(),
        Arc::new(gateway),
        event_sender.clone(),
        &cfg,
    );

    let app_state = api::AppState {
        db,
        config: cfg.clone(),
        cache,
        event_sender,
        services,
    };

    let cors_layer = if cfg.should_allow_permissive_cors() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    let app = api::build_router(app_state, cors_layer);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid listen address")?;
    info!("course-market listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
