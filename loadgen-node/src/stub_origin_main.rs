use anyhow::{Context, Result};
use loadgen_node::{StubConfig, StubOrigin};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadgen_node=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let config = StubConfig::from_env().context("Invalid stub configuration")?;
    let origin = StubOrigin::bind(config.clone())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping stub origin");
            signal.cancel();
        }
    });

    origin.serve(shutdown).await;
    Ok(())
}
