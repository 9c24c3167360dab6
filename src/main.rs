use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use casting_billing::{
    applications::PgProfileDirectory,
    config,
    limits::PgPlanCatalog,
    notifications::{start_notification_worker, LogSink},
    routes::api_routes,
    store::PgStore,
    BillingServices, BillingSettings,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Casting Billing API"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();
    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    let store = Arc::new(PgStore::new(pool.clone(), *config::BILLING_LOCK_TIMEOUT_MS));
    let notifier = start_notification_worker(Arc::new(LogSink), *config::NOTIFICATION_QUEUE_CAPACITY);
    let settings = BillingSettings::from_env();
    let services = BillingServices::new(
        store,
        Arc::new(PgPlanCatalog::new(pool.clone())),
        Arc::new(PgProfileDirectory::new(pool.clone())),
        Arc::new(notifier),
        settings,
    );
    tracing::info!(
        free_tier_quota = settings.free_tier_quota,
        response_cost = settings.response_cost,
        lock_timeout_ms = *config::BILLING_LOCK_TIMEOUT_MS,
        "billing services ready"
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(services));

    let addr: SocketAddr =
        format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT).parse()?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
