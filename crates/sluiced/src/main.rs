//! sluiced: UDP forwarding proxy daemon.
//!
//! Usage: `sluiced [CONFIG]`. Every `[[proxy]]` in the config becomes one
//! listener with its own task. Ctrl-C stops them all.

use std::path::PathBuf;

use anyhow::{Context, Result};

use sluice_core::config::SluiceConfig;

mod runtime;
mod socket;

use runtime::ProxyRuntime;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    let (path, config) = SluiceConfig::locate(std::env::args().nth(1).map(PathBuf::from))
        .context("failed to load config")?;

    // Every endpoint is resolved before any socket is opened.
    let instances = config.resolve().context("invalid configuration")?;
    tracing::info!(
        config = %path.display(),
        instances = instances.len(),
        reaper_interval_secs = config.runtime.reaper_interval_secs,
        "sluiced starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn proxies ────────────────────────────────────────────────────────

    let mut tasks = Vec::new();
    for instance in instances {
        let name = instance.name.clone();
        match ProxyRuntime::bind(instance, &config.runtime, shutdown_tx.subscribe()) {
            Ok(proxy) => tasks.push((name, tokio::spawn(proxy.run()))),
            Err(e) => tracing::error!(instance = %name, error = %format!("{e:#}"), "proxy failed to start"),
        }
    }
    if tasks.is_empty() {
        anyhow::bail!("no proxy instance could be started");
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => tracing::debug!(instance = %name, "proxy stopped"),
            Ok(Err(e)) => tracing::error!(instance = %name, error = %format!("{e:#}"), "proxy exited"),
            Err(e) => tracing::error!(instance = %name, error = %e, "proxy task panicked"),
        }
    }

    tracing::info!("shutting down");
    Ok(())
}
