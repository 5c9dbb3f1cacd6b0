use tracing_subscriber::EnvFilter;
use vila_relay::Config;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env must be in place before clap reads the environment
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Ok(path) = dotenv {
        tracing::info!(?path, "Loaded environment file");
    }

    // Load configuration from CLI, environment and/or config file
    let config = Config::load()?;
    vila_relay::run(config).await
}
