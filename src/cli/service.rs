use crate::conf;
use crate::service::Controller;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub async fn start(config_path: &Option<String>) -> Result<()> {
    let config = conf::parse(config_path)?;
    init_tracing(&config.general.log_level);

    let controller = Controller::dev(config)?;

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt; shutting down");
        shutdown.cancel();
    });

    controller.start(token).await
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over the configured level when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
