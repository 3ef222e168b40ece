//! anomalywatch -- statistical anomaly detection for home-automation entities.
//!
//! This crate provides the core library: entity classification, sample
//! collection, baseline modeling, anomaly evaluation, tiered scheduling,
//! operator feedback and log-summary reports.

pub mod api;
pub mod baseline;
pub mod collector;
pub mod config;
pub mod detect;
pub mod entity;
pub mod feedback;
pub mod replay;
pub mod reports;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{Config, NotifyConfig, ReportsConfig};
use crate::detect::Engine;
use crate::reports::{HttpSummarizer, Summarizer};
use crate::sink::{FanoutSink, FindingSink, LogSink, WebhookSink};
use crate::source::RestStateSource;

/// Assemble the delivery channels named in `[notify]`.
pub fn build_sink(notify: &NotifyConfig) -> Result<Arc<dyn FindingSink>> {
    let mut sinks: Vec<Arc<dyn FindingSink>> = Vec::new();
    if notify.log {
        sinks.push(Arc::new(LogSink));
    }
    if let Some(url) = &notify.webhook_url {
        let webhook = WebhookSink::new(
            url.clone(),
            notify.webhook_headers.clone(),
            notify.min_severity,
            notify.include_degraded,
            notify.timeout,
        )
        .context("failed to build webhook client")?;
        sinks.push(Arc::new(webhook));
    }
    Ok(Arc::new(FanoutSink::new(sinks)))
}

fn build_summarizer(reports: &ReportsConfig) -> Result<Option<Arc<dyn Summarizer>>> {
    if !reports.enabled {
        return Ok(None);
    }
    let api_key = reports.resolved_api_key();
    if api_key.is_none() {
        warn!(env = %reports.api_key_env, "reports enabled without an API key");
    }
    let summarizer = HttpSummarizer::new(
        &reports.endpoint,
        api_key,
        reports.model.clone(),
        reports.max_tokens,
        reports.temperature,
        reports.timeout,
    )
    .context("failed to build summarizer client")?;
    Ok(Some(Arc::new(summarizer)))
}

/// Open the database and connect the engine to the configured host.
pub async fn open_engine(config: &Config) -> Result<Engine> {
    let db_path = config.storage.db_path.to_string_lossy();
    info!(%db_path, "initializing database");
    let pool = storage::open_pool(&db_path)?;

    let source = RestStateSource::new(
        &config.source.base_url,
        config.source.resolved_token(),
        config.source.timeout,
    )
    .context("failed to build state source client")?;

    let engine = Engine::open(
        config.clone(),
        pool,
        Arc::new(source),
        build_sink(&config.notify)?,
        build_summarizer(&config.reports)?,
    )
    .await
    .context("failed to start detection engine")?;
    Ok(engine)
}

/// Start the anomalywatch daemon: API server and tier scheduler.
pub async fn serve(config: Config) -> Result<()> {
    let engine = open_engine(&config).await?;

    if let Err(e) = engine.sync_configured().await {
        warn!(error = %e, "could not register configured entities yet, will retry on refresh");
    }

    let scheduler = tokio::spawn(scheduler::run_scheduler_loop(engine.clone()));

    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    let app = api::router(api::state::AppState {
        engine: engine.clone(),
    });

    info!(%addr, "anomalywatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let cancel = engine.cancel_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
        .await?;

    engine.shutdown();
    scheduler.await.context("scheduler task panicked")?;
    info!("anomalywatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("shutdown signal received");
}
