mod config;
mod connection;
mod http;
mod listener;
mod race;
mod relay;
mod sniff;
mod socks;
#[cfg(test)]
mod testutil;
mod upstream;

use crate::config::{Cli, ProxyConfig};
use crate::listener::Listener;
use crate::race::Racer;
use crate::upstream::UpstreamDialer;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(&args)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={}",
            env!("CARGO_CRATE_NAME"),
            config.log_level.as_str()
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();
    let dialer = UpstreamDialer::new(config.connect_timeout);

    for listener_config in &config.listeners {
        let racer = Racer::new(
            listener_config.socks.clone(),
            config.race_timeout,
            dialer,
            tracker.clone(),
        );
        let listener = Listener::bind(&listener_config.listen, racer)
            .await
            .wrap_err_with(|| format!("Failed to listen on {}", listener_config.listen))?;

        info!("SOCKS5 proxy listening on {}", listener.local_addr());
        for upstream in &listener_config.socks {
            info!("  upstream: {}", upstream);
        }
        tracker.spawn(listener.serve(tracker.clone(), shutdown.clone()));
    }
    info!(
        "race timeout {}s, connect timeout {}s",
        config.race_timeout.as_secs(),
        config.connect_timeout.as_secs()
    );

    shutdown_signal().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    tracker.close();

    for i in 1..=SHUTDOWN_GRACE_SECS {
        if tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .is_ok()
        {
            info!("All connections closed gracefully");
            return Ok(());
        }

        if i % 5 == 0 {
            info!(
                "Still waiting for {} tasks... ({}/{}s)",
                tracker.len(),
                i,
                SHUTDOWN_GRACE_SECS
            );
        }
    }

    warn!("Forced shutdown with {} tasks still active", tracker.len());
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.wrap_err("Failed to install CTRL+C handler")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .wrap_err("Failed to install CTRL+C handler")?;

    Ok(())
}
