mod chain;
mod config;
mod metrics;
mod runner;
mod stages;

use anyhow::{Context, Result};
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("pipeline starting");
    tracing::info!(
        chain_mode = ?cfg.chain.mode,
        chain_url = %cfg.chain.url,
        tick_secs = cfg.jobs.tick_interval.as_secs(),
        cleanup_cron = %cfg.retention.cleanup_cron,
        "config loaded"
    );

    let telemetry = metrics::Telemetry::new();
    let shutdown = CancellationToken::new();

    let mut join_set: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    {
        let shutdown = shutdown.clone();
        let telemetry = telemetry.clone();
        let cfg = cfg.clone();
        join_set.spawn(async move {
            let worker = runner::Worker::new(cfg, telemetry).await?;
            worker.run(shutdown).await
        });
    }
    {
        let shutdown = shutdown.clone();
        let telemetry = telemetry.clone();
        let addr = cfg.metrics_listen_addr.clone();
        join_set.spawn(async move {
            let app = axum::Router::new().route(
                "/bundler_metrics",
                get(move || {
                    let telemetry = telemetry.clone();
                    async move { telemetry.encode() }
                }),
            );
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("bind {addr}"))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .context("serve metrics")?;
            Ok(())
        });
    }

    tracing::info!("pipeline started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("pipeline task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("pipeline task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("pipeline task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("pipeline task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("pipeline task failed"));
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
