use std::sync::Arc;

use axum::response::Response;
use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    catalog::{FormatDescriptor, StreamFilter, build_catalog, choose_best},
    config::{ProxyPolicy, ServiceConfig},
    error::{DOWNLOAD_RETRY_AFTER_SECONDS, ServiceError},
    proxy::{ProxyEndpoint, ProxySelector},
    relay::{RelayScope, relay},
    resolver::{FormatResolver, MediaStream, ResolverError},
    retry::run_with_retry,
};

const MAX_CONTAINER_LEN: usize = 16;

/// Whether a request reaches the platform directly or through a rotating proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Egress {
    Direct,
    Proxied,
}

/// Lists formats and relays downloads for one resolver configuration.
///
/// Every deployment flavour (plain, cookie-authenticated, proxied) is this
/// same service with a different resolver, selector and [`ServiceConfig`].
#[derive(Clone)]
pub struct DownloadService {
    resolver: Arc<dyn FormatResolver>,
    proxy_selector: Option<ProxySelector>,
    config: ServiceConfig,
    download_slots: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl DownloadService {
    pub fn new(
        resolver: Arc<dyn FormatResolver>,
        proxy_selector: Option<ProxySelector>,
        config: ServiceConfig,
    ) -> Self {
        let download_slots = config
            .max_concurrent_downloads
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            resolver,
            proxy_selector,
            config,
            download_slots,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ties retry backoff and open relays to `shutdown`.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn resolver_name(&self) -> &'static str {
        self.resolver.name()
    }

    /// Deduplicated formats for `video`. Resolver failures are not retried.
    pub async fn list_formats(
        &self,
        video: Option<&str>,
        egress: Egress,
    ) -> Result<Vec<FormatDescriptor>, ServiceError> {
        let video = require_video(video)?;
        let proxy = self.resolve_proxy(egress).await?;

        let raw_formats = self
            .resolver
            .fetch_formats(video.as_str(), proxy.as_ref())
            .await
            .map_err(|error| {
                warn!("Error fetching video info for {video}: {error}");
                ServiceError::from(error)
            })?;

        let catalog = build_catalog(&raw_formats);
        info!(
            "Listed {} format(s) out of {} for {video}",
            catalog.len(),
            raw_formats.len()
        );
        Ok(catalog)
    }

    /// Streams the highest quality muxed rendition, retrying resolution.
    pub async fn download_best(
        &self,
        video: Option<&str>,
        egress: Egress,
    ) -> Result<Response, ServiceError> {
        let video = require_video(video)?;
        let permit = self.acquire_slot().await?;
        let proxy = self.resolve_proxy(egress).await?;

        let request_id = Uuid::new_v4();
        let started_at = Utc::now();
        let cancel = self.shutdown.child_token();
        info!(%request_id, "Downloading video: {video}");

        let resolver = self.resolver.as_ref();
        let video_ref = video.as_str();
        let proxy_ref = proxy.as_ref();
        let best = run_with_retry(self.config.retry, &cancel, || async move {
            let formats = resolver.fetch_formats(video_ref, proxy_ref).await?;
            choose_best(&formats, StreamFilter::AudioAndVideo)
                .ok_or(ResolverError::NoMatchingFormat(StreamFilter::AudioAndVideo))
        })
        .await
        .map_err(|error| match error {
            ResolverError::Cancelled => ServiceError::Cancelled,
            other => {
                warn!(%request_id, "Giving up on {video}: {other}");
                ServiceError::DownloadFailed {
                    details: other.to_string(),
                    retry_after_seconds: Some(DOWNLOAD_RETRY_AFTER_SECONDS),
                }
            }
        })?;

        let stream = self
            .open(&best, StreamFilter::AudioAndVideo, proxy_ref)
            .await?;
        let scope = RelayScope {
            request_id,
            video: video.to_string(),
            started_at,
            cancel,
            permit,
        };
        relay(stream, &best.container, scope).await
    }

    /// Streams exactly the serialized `format`, without re-resolving it.
    pub async fn download_specific(
        &self,
        video: Option<&str>,
        format: Option<&str>,
        egress: Egress,
    ) -> Result<Response, ServiceError> {
        let (Some(video), Some(format)) = (video, format) else {
            return Err(ServiceError::BadRequest(
                "URL and format are required".to_string(),
            ));
        };
        let video = require_video(Some(video))?;
        let descriptor = parse_format(format)?;
        let filter = StreamFilter::for_descriptor(&descriptor);

        let permit = self.acquire_slot().await?;
        let proxy = self.resolve_proxy(egress).await?;

        let request_id = Uuid::new_v4();
        let started_at = Utc::now();
        let cancel = self.shutdown.child_token();
        info!(
            %request_id,
            "Downloading video: {video} in format {} {} ({filter})",
            descriptor.quality,
            descriptor.container
        );

        let stream = self.open(&descriptor, filter, proxy.as_ref()).await?;
        let scope = RelayScope {
            request_id,
            video: video.to_string(),
            started_at,
            cancel,
            permit,
        };
        relay(stream, &descriptor.container, scope).await
    }

    async fn open(
        &self,
        format: &FormatDescriptor,
        filter: StreamFilter,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<MediaStream, ServiceError> {
        self.resolver
            .open_stream(format, filter, proxy)
            .await
            .map_err(|error| match error {
                ResolverError::Cancelled => ServiceError::Cancelled,
                other => {
                    warn!("Error downloading video: {other}");
                    ServiceError::download_failed(other.to_string())
                }
            })
    }

    async fn resolve_proxy(&self, egress: Egress) -> Result<Option<ProxyEndpoint>, ServiceError> {
        if egress == Egress::Direct {
            return Ok(None);
        }

        let selected = match &self.proxy_selector {
            Some(selector) => selector.select_proxy().await,
            None => {
                warn!("Proxied route requested but no proxy provider is configured");
                None
            }
        };

        match (selected, self.config.proxy_policy) {
            (Some(proxy), _) => {
                info!("Routing request through proxy {proxy}");
                Ok(Some(proxy))
            }
            (None, ProxyPolicy::Required) => Err(ServiceError::ProxyUnavailable),
            (None, ProxyPolicy::Direct) => {
                warn!("No proxy available, continuing without one");
                Ok(None)
            }
        }
    }

    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>, ServiceError> {
        match &self.download_slots {
            Some(slots) => Arc::clone(slots)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| ServiceError::download_failed("download capacity unavailable")),
            None => Ok(None),
        }
    }
}

fn require_video(video: Option<&str>) -> Result<Url, ServiceError> {
    let raw = video
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServiceError::BadRequest("URL is required".to_string()))?;
    parse_http_url(raw).ok_or_else(|| ServiceError::BadRequest("Invalid URL".to_string()))
}

fn parse_http_url(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

fn parse_format(raw: &str) -> Result<FormatDescriptor, ServiceError> {
    let descriptor: FormatDescriptor = serde_json::from_str(raw)
        .map_err(|error| ServiceError::BadRequest(format!("Invalid format: {error}")))?;

    let container_ok = !descriptor.container.is_empty()
        && descriptor.container.len() <= MAX_CONTAINER_LEN
        && descriptor
            .container
            .chars()
            .all(|character| character.is_ascii_alphanumeric());
    if !container_ok {
        return Err(ServiceError::BadRequest(
            "Invalid format: unsupported container".to_string(),
        ));
    }
    if parse_http_url(&descriptor.source_url).is_none() {
        return Err(ServiceError::BadRequest(
            "Invalid format: missing stream url".to_string(),
        ));
    }

    Ok(descriptor)
}
