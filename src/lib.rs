pub mod api;
pub mod app_state;
pub mod assets;
pub mod config;
pub mod error;
pub mod fitter;
pub mod inference;
pub mod media;
pub mod staging;

use anyhow::Context as _;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

//
// Re-export
//
pub use api::{HealthResponse, ProcessResponse, health, log_request_errors, process_media};
pub use app_state::AppState;
pub use assets::{AssetClient, AssetLease};
pub use config::Config;
pub use error::{ErrorBody, RelayError};
pub use fitter::{FitResult, FitSettings, ImageEncoding, MediaFitter};
pub use inference::{InferenceClient, InferenceParams, InferenceRequest};
pub use media::{MediaKind, MediaType};
pub use staging::StagedFile;

pub fn router(state: AppState) -> Router {
    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/process", post(process_media))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(state.config.max_file_size))
        .layer(axum::middleware::from_fn(log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(config).await?;
    let staging_dir = state.staging_dir().to_path_buf();

    let addr = format!("0.0.0.0:{}", state.config.listen_on_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    staging::remove_staging_dir(&staging_dir).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                error!(%error, "Failed to listen for SIGTERM");
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
