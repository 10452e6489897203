use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crd_swagger::config::Config;
use crd_swagger::Generator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags();
    let default_level = if config.quiet { "warn" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    Generator::new(config).run(&token).await?;
    Ok(())
}
