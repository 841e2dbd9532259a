mod catalog;
mod config;
mod error;
mod proxy;
mod relay;
mod resolver;
mod retry;
mod routes;
mod service;
#[cfg(test)]
mod test_support;

use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION, header::RETRY_AFTER};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ServerConfig,
    error::ApiError,
    proxy::ProxySelector,
    resolver::YtDlpResolver,
    routes::{AppState, build_router},
    service::DownloadService,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = ServerConfig::from_env()
        .map_err(|error| ApiError::internal(format!("Invalid configuration: {error}")))?;

    let proxy_selector = match &config.proxy {
        Some(proxy) => Some(
            ProxySelector::new(proxy.provider_url.clone(), proxy.timeout).map_err(|error| {
                ApiError::internal(format!("Could not build proxy provider client: {error}"))
            })?,
        ),
        None => None,
    };
    let resolver = Arc::new(YtDlpResolver::new(config.resolver.clone()).map_err(|error| {
        ApiError::internal(format!("Could not build media client: {error}"))
    })?);
    let shutdown = CancellationToken::new();
    let service = DownloadService::new(resolver, proxy_selector, config.service.clone())
        .with_shutdown(shutdown.clone());

    info!(
        resolver = service.resolver_name(),
        max_retries = config.service.retry.max_retries,
        proxy_provider = config.proxy.is_some(),
        "Download service configured"
    );
    if config.proxy.is_none() {
        warn!("PROXY_PROVIDER_URL is not set. /proxied routes will have no proxy to rotate.");
    }

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(AppState { service }).layer(cors);

    let addr = config.bind_addr.as_str();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Server ready on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    // Without a handler the process still dies on Ctrl+C, just not gracefully.
    if let Err(error) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {error}");
        return std::future::pending().await;
    }
    info!("Shutdown requested, ending open downloads");
    shutdown.cancel();
}

fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION, RETRY_AFTER]);

    if origins.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Accepting requests from any origin.");
        return Ok(layer.allow_origin(Any));
    }

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    });

    Ok(layer.allow_origin(allow_origin))
}

/// Lowercased `scheme://host[:port]`, dropping default ports.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // `Url` already strips the scheme's default port.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}
