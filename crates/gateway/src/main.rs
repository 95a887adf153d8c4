//! SiteBridge API Gateway
//!
//! The HTTP surface of one installation.
//! Handles:
//! - Authentication and authorization
//! - Transfer nonces
//! - Snapshot export and import routing
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use sitebridge_common::{
    auth::{nonce::NonceManager, Authenticator},
    config::{AppConfig, StorageBackend, StorageConfig},
    db::{DbPool, Repository},
    metrics,
    store::{CatalogStore, EntityStore, MemoryInstallation, SchemaProvider},
    transfer::{Installation, ScopePermissions, TransferService},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub transfers: Arc<TransferService>,
    pub authenticator: Arc<Authenticator>,
    /// Set when the PostgreSQL backend is in use
    pub db: Option<DbPool>,
    pub metrics: Option<PrometheusHandle>,
}

impl FromRef<AppState> for Arc<Authenticator> {
    fn from_ref(state: &AppState) -> Self {
        state.authenticator.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;
    config.validate()?;

    // Initialize tracing
    init_tracing(&config);

    info!(
        service = %config.observability.service_name,
        "Starting SiteBridge API Gateway v{}",
        sitebridge_common::VERSION
    );

    let config = Arc::new(config);

    // Initialize metrics
    let metrics_handle = if config.observability.metrics_enabled {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("request_duration_seconds".to_string()),
                metrics::LATENCY_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Full(format!("{}_export_duration_seconds", metrics::METRICS_PREFIX)),
                metrics::TRANSFER_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Full(format!("{}_import_duration_seconds", metrics::METRICS_PREFIX)),
                metrics::TRANSFER_BUCKETS,
            )?
            .install_recorder()?;
        Some(handle)
    } else {
        None
    };
    metrics::register_metrics();

    // Initialize the installation backend
    let (installation, db) = open_installation(&config).await?;

    let nonce_secret = match config.auth.nonce_secret.clone() {
        Some(secret) => secret,
        None => {
            warn!("auth.nonce_secret is not set; issued nonces will not survive a restart");
            Uuid::new_v4().simple().to_string()
        }
    };
    let nonces = NonceManager::new(nonce_secret, config.auth.nonce_lifetime_secs);

    let transfers = TransferService::new(
        installation,
        &config.transfer,
        Arc::new(ScopePermissions),
        Arc::new(nonces),
    )?;

    // Create app state
    let state = AppState {
        config: config.clone(),
        transfers: Arc::new(transfers),
        authenticator: Arc::new(Authenticator::from_config(&config.auth)),
        db,
        metrics: metrics_handle,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wire the configured backend into the transfer engine's collaborators
async fn open_installation(config: &AppConfig) -> anyhow::Result<(Installation, Option<DbPool>)> {
    let site_url = config.site_url()?;

    match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using the in-memory backend; data is lost on shutdown");
            let store = Arc::new(MemoryInstallation::new(site_url));
            Ok((installation(store, &config.storage), None))
        }
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let db = DbPool::new(&config.database).await?;
            if config.database.run_migrations {
                db.migrate().await?;
            }
            let repo = Arc::new(Repository::new(db.clone(), site_url));
            Ok((installation(repo, &config.storage), Some(db)))
        }
    }
}

fn installation<S>(store: Arc<S>, storage: &StorageConfig) -> Installation
where
    S: EntityStore + SchemaProvider + CatalogStore + 'static,
{
    let schema: Option<Arc<dyn SchemaProvider>> = if storage.schema_provider {
        Some(store.clone())
    } else {
        None
    };
    let catalog: Option<Arc<dyn CatalogStore>> = if storage.catalog {
        Some(store.clone())
    } else {
        None
    };

    Installation {
        entities: store,
        schema,
        catalog,
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let max_upload = state.config.server.max_upload_bytes;
    let timeout = TimeoutLayer::new(state.config.request_timeout());

    // API routes
    let api_routes = Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Transfer endpoints
        .route("/transfers/entities", get(handlers::transfers::list_entities))
        .route("/transfers/nonce", post(handlers::transfers::issue_nonce))
        .route("/transfers/export/{id}", get(handlers::transfers::export))
        .layer(timeout.clone())

        // Imports run to completion, so no request timeout here
        .route(
            "/transfers/import",
            post(handlers::transfers::import).layer(DefaultBodyLimit::max(max_upload)),
        )
        .route_layer(from_fn(middleware::metrics::track_metrics));

    // Compose the app
    Router::new()
        .route("/metrics", get(handlers::health::metrics))
        .layer(timeout)
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
