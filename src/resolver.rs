use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::{
    StatusCode,
    header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT},
};
use serde::Deserialize;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use crate::{
    catalog::{FormatDescriptor, RawFormat, StreamFilter},
    proxy::ProxyEndpoint,
    retry::Cancelled,
};

pub type MediaStream = BoxStream<'static, Result<Bytes, ResolverError>>;

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("{0}")]
    Tool(String),

    #[error("could not parse video metadata: {0}")]
    Parse(String),

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream responded with status {0}")]
    Status(StatusCode),

    #[error("No such format found: {0}")]
    NoMatchingFormat(StreamFilter),

    #[error("request cancelled")]
    Cancelled,
}

impl From<Cancelled> for ResolverError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Capability that knows how to read a video platform.
#[async_trait]
pub trait FormatResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lists every rendition the platform offers for `video`.
    async fn fetch_formats(
        &self,
        video: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Vec<RawFormat>, ResolverError>;

    /// Opens a lazy byte stream for exactly `format`.
    async fn open_stream(
        &self,
        format: &FormatDescriptor,
        filter: StreamFilter,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<MediaStream, ResolverError>;
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub yt_dlp_bin: String,
    pub metadata_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub cookie: Option<String>,
    pub cookies_file: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            yt_dlp_bin: "yt-dlp".to_string(),
            metadata_timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(15),
            user_agent: None,
            cookie: None,
            cookies_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    url: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    tbr: Option<f32>,
    abr: Option<f32>,
}

/// Resolves metadata with `yt-dlp` and fetches media bytes with `reqwest`.
pub struct YtDlpResolver {
    config: ResolverConfig,
    direct_client: reqwest::Client,
}

impl YtDlpResolver {
    pub fn new(config: ResolverConfig) -> Result<Self, ResolverError> {
        let direct_client = media_client(&config, None)?;
        Ok(Self {
            config,
            direct_client,
        })
    }

    fn metadata_args(&self, video: &str, proxy: Option<&ProxyEndpoint>) -> Vec<String> {
        let mut args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        if let Some(proxy) = proxy {
            args.push("--proxy".to_string());
            args.push(proxy.url());
        }
        if let Some(user_agent) = &self.config.user_agent {
            args.push("--user-agent".to_string());
            args.push(user_agent.clone());
        }
        if let Some(cookie) = &self.config.cookie {
            args.push("--add-header".to_string());
            args.push(format!("Cookie:{cookie}"));
        }
        if let Some(path) = &self.config.cookies_file {
            args.push("--cookies".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        args.push(video.to_string());
        args
    }

    async fn run_yt_dlp(&self, args: Vec<String>) -> Result<Vec<u8>, ResolverError> {
        let command_future = Command::new(&self.config.yt_dlp_bin)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.config.metadata_timeout, command_future)
            .await
            .map_err(|_| ResolverError::Tool("video metadata lookup timed out".to_string()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ResolverError::Tool(format!(
                        "{} is not installed; install it and restart the server",
                        self.config.yt_dlp_bin
                    ))
                } else {
                    ResolverError::Tool(format!(
                        "could not run {}: {error}",
                        self.config.yt_dlp_bin
                    ))
                }
            })?;

        if !output.status.success() {
            return Err(ResolverError::Tool(run_error_message(&output.stderr)));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl FormatResolver for YtDlpResolver {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch_formats(
        &self,
        video: &str,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Vec<RawFormat>, ResolverError> {
        let stdout = self.run_yt_dlp(self.metadata_args(video, proxy)).await?;
        raw_formats_from_json(&stdout)
    }

    async fn open_stream(
        &self,
        format: &FormatDescriptor,
        filter: StreamFilter,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<MediaStream, ResolverError> {
        if !filter.matches(format.has_audio, true) {
            return Err(ResolverError::NoMatchingFormat(filter));
        }

        let client = match proxy {
            Some(proxy) => media_client(&self.config, Some(proxy))?,
            None => self.direct_client.clone(),
        };

        debug!(
            "Opening {} stream ({} {}) via {}",
            filter,
            format.quality,
            format.container,
            proxy.map_or_else(|| "direct".to_string(), ToString::to_string)
        );

        let response = client.get(&format.source_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResolverError::Status(status));
        }

        Ok(response.bytes_stream().map_err(ResolverError::from).boxed())
    }
}

/// Client for media fetches carrying the configured session headers.
fn media_client(
    config: &ResolverConfig,
    proxy: Option<&ProxyEndpoint>,
) -> Result<reqwest::Client, ResolverError> {
    let mut headers = HeaderMap::new();
    if let Some(user_agent) = &config.user_agent {
        let value = HeaderValue::from_str(user_agent)
            .map_err(|_| ResolverError::Tool("invalid user-agent value".to_string()))?;
        headers.insert(USER_AGENT, value);
    }
    if let Some(cookie) = &config.cookie {
        let value = HeaderValue::from_str(cookie)
            .map_err(|_| ResolverError::Tool("invalid cookie value".to_string()))?;
        headers.insert(COOKIE, value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(config.connect_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.url())?);
    }
    Ok(builder.build()?)
}

fn raw_formats_from_json(stdout: &[u8]) -> Result<Vec<RawFormat>, ResolverError> {
    let info: YtDlpVideoInfo =
        serde_json::from_slice(stdout).map_err(|error| ResolverError::Parse(error.to_string()))?;

    Ok(info
        .formats
        .into_iter()
        .filter_map(|item| {
            let url = item.url?;
            let has_video = matches!(item.vcodec.as_deref(), Some(value) if value != "none");
            let has_audio = matches!(item.acodec.as_deref(), Some(value) if value != "none");
            let quality_label = item.height.filter(|_| has_video).map(|height| {
                match item.fps.map(|fps| fps.round() as u32) {
                    Some(fps) if fps > 30 => format!("{height}p{fps}"),
                    _ => format!("{height}p"),
                }
            });
            let audio_bitrate = item
                .abr
                .filter(|_| has_audio)
                .map(|abr| abr.round() as u32)
                .filter(|abr| *abr > 0);

            Some(RawFormat {
                quality_label,
                container: item.ext.unwrap_or_else(|| "mp4".to_string()),
                audio_bitrate,
                has_audio,
                has_video,
                height: item.height,
                bitrate: item.tbr.map(|tbr| (tbr * 1000.0).round() as u64),
                url,
            })
        })
        .collect())
}

fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("video metadata lookup failed")
        .trim_start_matches("ERROR: ")
        .to_string()
}
