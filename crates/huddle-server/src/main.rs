mod api;
mod config;
mod error;
mod rate_limit;
mod rooms;
mod uploads;
mod ws;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::rate_limit::ApiRateLimiter;
use crate::rooms::RoomRegistry;
use crate::uploads::UploadStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,huddle_server=debug")),
        )
        .init();

    info!(
        "Starting Huddle meeting server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let uploads = Arc::new(
        UploadStore::new(config.upload_dir.clone(), config.max_upload_size).await?,
    );

    let (registry, mut evictions) = RoomRegistry::new();

    // Participants whose outbound queue overflowed during fan-out get
    // detached here, off the broadcast path.
    {
        let registry = registry.clone();
        let uploads = uploads.clone();
        tokio::spawn(async move {
            while let Some(eviction) = evictions.recv().await {
                warn!(
                    room = %eviction.room,
                    peer = %eviction.connection,
                    "Evicting unresponsive participant"
                );
                registry.leave(&eviction.room, eviction.connection).await;
                uploads.abort_all_for(eviction.connection).await;
            }
        });
    }

    let rate_limiter = ApiRateLimiter::default();

    // Rate limiter cleanup every 5 min, evict buckets idle >10 min
    {
        let limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                limiter
                    .evict_idle(std::time::Duration::from_secs(600))
                    .await;
            }
        });
    }

    let http_addr = config.http_addr;
    let app_state = AppState {
        registry,
        uploads,
        rate_limiter,
        config: Arc::new(config),
    };

    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
