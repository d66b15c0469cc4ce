//! SparrowFlix server: wires the catalog, metadata client, Telegram channel,
//! conversation engine and HTTP routes, then runs until shutdown.

use crate::archive::ArchivalForwarder;
use crate::batch::BatchAggregator;
use crate::config::{SparrowConfig, TransportMode};
use crate::conversation::ConversationEngine;
use crate::gateway::Gateway;
use crate::ingest::Ingestor;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use sf_catalog::{CatalogStore, SqliteCatalog};
use sf_channels::{ChannelAdapter, TelegramAdapter, TelegramMode};
use sf_metadata::TmdbClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub started_at: Instant,
    pub catalog: Arc<dyn CatalogStore>,
    pub engine: Arc<ConversationEngine>,
    pub batches: Arc<BatchAggregator>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SparrowConfig::load_with_path(config_path).await?;
    let db_path = cfg.db_path()?;
    let catalog = SqliteCatalog::open(&db_path)?;
    let stats = catalog.stats().await?;
    tracing::info!(
        config_path = %path.display(),
        db_path = %db_path.display(),
        movies = stats.movies,
        tv_shows = stats.tv_shows,
        seasons = stats.seasons,
        episodes_with_files = stats.episodes_with_files,
        archived_files = stats.archived_files,
        "config and catalog ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SparrowConfig::load_with_path(config_path).await?;
    tracing::info!(
        config_path = %path.display(),
        bot_token = %redact(&cfg.telegram.bot_token),
        transport_mode = ?cfg.telegram.mode,
        webhook_url = ?cfg.telegram.webhook_url,
        miniapp_url = ?cfg.miniapp.url,
        storage_channel_id = %cfg.storage.channel_id,
        db_path = %cfg.catalog.db_path,
        metadata_base_url = %cfg.metadata.base_url,
        metadata_language = %cfg.metadata.language,
        batch_quiet_period_ms = cfg.batch.quiet_period_ms,
        batch_staleness_seconds = cfg.batch.staleness_seconds,
        bind_addr = %cfg.server.bind_addr,
        "status ok"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = SparrowConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %cfg_path.display(),
        transport_mode = ?cfg.telegram.mode,
        storage_channel_id = %cfg.storage.channel_id,
        db_path = %cfg.catalog.db_path,
        metadata_language = %cfg.metadata.language,
        metadata_max_results = cfg.metadata.max_results,
        batch_quiet_period_ms = cfg.batch.quiet_period_ms,
        batch_staleness_seconds = cfg.batch.staleness_seconds,
        batch_flush_on_shutdown = cfg.batch.flush_on_shutdown,
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        bind_addr = %addr,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let db_path = cfg.db_path()?;
    let catalog: Arc<dyn CatalogStore> = Arc::new(SqliteCatalog::open(&db_path)?);
    tracing::info!(db_path = %db_path.display(), "catalog opened");

    let metadata = Arc::new(
        TmdbClient::new(&cfg.metadata.api_key)
            .with_base_url(&cfg.metadata.base_url)
            .with_language(&cfg.metadata.language),
    );

    let mode = match cfg.telegram.mode {
        TransportMode::Polling => TelegramMode::Polling,
        TransportMode::Webhook => TelegramMode::Webhook {
            url: cfg.telegram.webhook_url.clone().unwrap_or_default(),
            secret: cfg.telegram.webhook_secret.clone(),
        },
    };
    let telegram = Arc::new(TelegramAdapter::new(&cfg.telegram.bot_token, mode)?);
    let channel: Arc<dyn ChannelAdapter> = telegram.clone();

    let shutdown = CancellationToken::new();
    let forwarder = ArchivalForwarder::new(channel.clone(), cfg.storage.channel_id.clone());
    let ingestor = Arc::new(Ingestor::new(catalog.clone(), forwarder.clone()));
    let batches = BatchAggregator::start(
        cfg.batch.clone(),
        ingestor.clone(),
        channel.clone(),
        shutdown.child_token(),
    )
    .await;
    let engine = Arc::new(
        ConversationEngine::new(
            catalog.clone(),
            metadata,
            ingestor,
            batches.clone(),
            cfg.metadata.max_results,
        )
        .with_miniapp_url(cfg.miniapp.url.clone()),
    );

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    channel.start(inbound_tx).await?;
    let gateway = Arc::new(Gateway::new(
        engine.clone(),
        forwarder,
        channel.clone(),
        inbound_rx,
        shutdown.clone(),
    ));
    let gateway_handle = gateway.start();
    tracing::info!(channel = channel.channel_id(), "gateway started");

    let state = Arc::new(AppState {
        started_at,
        catalog,
        engine,
        batches: batches.clone(),
    });
    let mut app_router = routes::router().layer(Extension(state));
    if cfg.telegram.mode == TransportMode::Webhook {
        app_router = app_router.merge(telegram.webhook_router());
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = app_router
        .layer(GlobalConcurrencyLimitLayer::new(
            cfg.server.http_max_in_flight,
        ))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "sparrowflix serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), gateway_handle).await {
        Ok(Ok(())) => tracing::info!("gateway shutdown completed"),
        Ok(Err(e)) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
        Err(_) => tracing::warn!("timed out waiting for gateway shutdown"),
    }
    batches.shutdown().await;
    tracing::info!("batch aggregator shutdown completed");

    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn redact(secret: &str) -> String {
    match secret.split_once(':') {
        Some((bot_id, _)) => format!("{bot_id}:***"),
        None if secret.is_empty() => String::new(),
        None => "***".to_string(),
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

/// Resolves on ctrl-c, SIGTERM, or a `/stop` that already cancelled the token.
async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(ctrlc_err) = result {
                            tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {
                tracing::warn!("shutdown requested; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {
                tracing::warn!("shutdown requested; beginning graceful shutdown");
            }
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_token_is_redacted_to_bot_id() {
        assert_eq!(redact("123456:AAHsecret"), "123456:***");
        assert_eq!(redact("opaque"), "***");
        assert_eq!(redact(""), "");
    }

    #[test]
    fn request_id_falls_back_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc".parse().expect("header value"));
        assert_eq!(request_id_from_headers(&headers), "abc");
    }
}
