use crate::assets::AssetClient;
use crate::config::Config;
use crate::fitter::MediaFitter;
use crate::inference::InferenceClient;
use crate::staging::init_staging_dir;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Read-only state shared by all requests
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub fitter: MediaFitter,
    pub assets: AssetClient,
    pub inference: InferenceClient,

    pub staging_dir: PathBuf,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let api_key = config.api_key().unwrap_or_default().to_string();

        let staging_dir = config.staging_dir();
        init_staging_dir(&staging_dir)
            .await
            .with_context(|| format!("Failed to create staging dir {}", staging_dir.display()))?;

        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        let assets = AssetClient::new(
            http.clone(),
            &config.assets_api_url,
            &api_key,
            config.request_timeout(),
            config.stream_timeout(),
        );
        let inference = InferenceClient::new(
            http,
            &config.vila_api_url,
            api_key,
            config.inference_params(),
            config.request_timeout(),
        );

        info!(?staging_dir, model = %config.model, "App state initialized");
        Ok(Self {
            fitter: MediaFitter::new(config.fit_settings()),
            assets,
            inference,
            staging_dir,
            config: Arc::new(config),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging_dir.as_path()
    }
}
