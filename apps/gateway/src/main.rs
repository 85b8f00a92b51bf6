mod admission;
mod chain_info;
mod config;
mod error;
mod http;
mod metrics;
mod multipart;
mod payment;
mod pricing;
mod services;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("gateway starting");
    tracing::info!(
        listen = %cfg.server.listen_addr,
        gateway = %cfg.server.gateway_fqdn,
        facilitators = cfg.payment.facilitators.len(),
        free_upload_limit_bytes = cfg.upload.free_upload_limit_bytes,
        "config loaded"
    );

    let telemetry = metrics::Telemetry::new();
    let services = Arc::new(services::Services::new(cfg.clone(), telemetry).await?);

    let shutdown = CancellationToken::new();

    let mut join_set: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    {
        let shutdown = shutdown.clone();
        let services = services.clone();
        let listen_addr = cfg.server.listen_addr.clone();
        join_set.spawn(async move {
            let listener = tokio::net::TcpListener::bind(&listen_addr)
                .await
                .with_context(|| format!("bind {listen_addr}"))?;
            tracing::info!(addr = %listen_addr, "listening");
            axum::serve(listener, http::router(services))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .context("serve http")?;
            Ok(())
        });
    }

    tracing::info!("gateway started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("gateway task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("gateway task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("gateway task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("gateway task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("gateway task failed"));
        }
    }

    fatal.map_or(Ok(()), Err)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
