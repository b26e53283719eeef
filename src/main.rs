use sipagent::config::Config;
use sipagent::domain::call::CallUpdate;
use sipagent::infrastructure::protocols::sip::UserAgent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting sipagent {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    info!(
        "Account {} on {}",
        config.account.username,
        config.server_endpoint()
    );

    let (call_tx, mut call_rx) = mpsc::unbounded_channel::<CallUpdate>();
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<bool>();

    let agent = UserAgent::builder(config)
        .call_handler(Arc::new(call_tx))
        .registration_handler(Arc::new(status_tx))
        .build()
        .await?;
    info!("Listening on {}", agent.local_addr());

    let registration = agent.start().await?;
    info!("Registered until {}", registration.expires_at());

    loop {
        tokio::select! {
            Some(update) = call_rx.recv() => {
                info!("Call {}: {}", update.call_id, update.status);
            }
            Some(registered) = status_rx.recv() => {
                if !registered {
                    warn!("Registration lost");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    agent.stop().await?;
    Ok(())
}
