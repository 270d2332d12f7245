//! services/api/src/bin/api.rs

use api_lib::{
    adapters::DbAdapter,
    config::Config,
    error::ApiError,
    web::{rest::ApiDoc, router, AppState},
};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, Method,
};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use study_state_core::{InMemoryStore, Janitor, StudyState, StudyStore, SystemClock};
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to the Durable Store ---
    let store: Arc<dyn StudyStore> = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(config.db_max_connections)
                .connect(database_url)
                .await?;
            let db_adapter = DbAdapter::new(db_pool);
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(db_adapter)
        }
        None => {
            warn!("DATABASE_URL is not set; study state will not survive a restart");
            Arc::new(InMemoryStore::new())
        }
    };

    // --- 3. Build the Study State & Start the Janitor ---
    let state_config = config.state_config();
    let janitor_interval = state_config.janitor_interval;
    let study = Arc::new(StudyState::new(store, Arc::new(SystemClock), state_config));
    let janitor = Janitor::start(study.clone(), janitor_interval);

    // --- 4. Create the Web Router ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT, HeaderName::from_static("x-user-id")]);

    let api_router = router(Arc::new(AppState::new(study.clone()))).layer(cors);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let stop = CancellationToken::new();
    let server_stop = stop.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_stop.cancelled().await })
            .await
    });

    // --- 6. Shut Down: requests, then the janitor, then pending writes ---
    let grace = config.shutdown_grace();
    let served = tokio::select! {
        joined = &mut server => server_outcome(joined),
        _ = shutdown_signal() => {
            stop.cancel();
            match tokio::time::timeout(grace, &mut server).await {
                Ok(joined) => server_outcome(joined),
                Err(_) => {
                    warn!("In-flight requests did not finish within {:?}; aborting them", grace);
                    server.abort();
                    Ok(())
                }
            }
        }
    };

    janitor.shutdown().await;
    if study.drain(grace).await {
        info!("All pending writes flushed.");
    }
    info!(
        failed_writes = study.mirror().failure_count(),
        "Server stopped."
    );
    served
}

fn server_outcome(joined: Result<std::io::Result<()>, JoinError>) -> Result<(), ApiError> {
    match joined {
        Ok(result) => Ok(result?),
        Err(e) => Err(ApiError::Internal(format!("Server task failed: {}", e))),
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, shutting down...");
}
