use std::sync::{
    Mutex,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use axum::{Router, routing::get};
use bytes::Bytes;
use futures::{StreamExt, stream};
use reqwest::StatusCode;
use tokio::{net::TcpListener, sync::oneshot, time::Duration};
use url::Url;

use crate::{
    catalog::{FormatDescriptor, RawFormat, StreamFilter},
    proxy::ProxyEndpoint,
    resolver::{FormatResolver, MediaStream, ResolverError},
};

#[derive(Debug, Clone)]
pub struct OpenCall {
    pub format: FormatDescriptor,
    pub filter: StreamFilter,
    pub proxy: Option<ProxyEndpoint>,
}

/// Fires when the stream holding it is dropped.
struct DropSignal(Option<oneshot::Sender<()>>);

impl Drop for DropSignal {
    fn drop(&mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(());
        }
    }
}

pub struct FakeResolver {
    pub formats: Vec<RawFormat>,
    pub fetch_calls: AtomicU32,
    fetch_failures: AtomicU32,
    fail_open: bool,
    endless: Mutex<Option<oneshot::Sender<()>>>,
    opened: Mutex<Vec<OpenCall>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self {
            formats: sample_formats(),
            fetch_calls: AtomicU32::new(0),
            fetch_failures: AtomicU32::new(0),
            fail_open: false,
            endless: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Fails the next `count` metadata lookups; `u32::MAX` fails forever.
    pub fn failing_fetches(self, count: u32) -> Self {
        self.fetch_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Serves a never-ending stream and reports when it gets dropped.
    pub fn endless(self) -> (Self, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        *self.endless.lock().unwrap() = Some(sender);
        (self, receiver)
    }

    pub fn open_calls(&self) -> Vec<OpenCall> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl FormatResolver for FakeResolver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn fetch_formats(
        &self,
        _video: &str,
        _proxy: Option<&ProxyEndpoint>,
    ) -> Result<Vec<RawFormat>, ResolverError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fetch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fetch_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(ResolverError::Tool(
                "fake upstream rejected the request".to_string(),
            ));
        }
        Ok(self.formats.clone())
    }

    async fn open_stream(
        &self,
        format: &FormatDescriptor,
        filter: StreamFilter,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<MediaStream, ResolverError> {
        self.opened.lock().unwrap().push(OpenCall {
            format: format.clone(),
            filter,
            proxy: proxy.cloned(),
        });

        if self.fail_open {
            return Err(ResolverError::Status(StatusCode::FORBIDDEN));
        }

        let endless = self.endless.lock().unwrap().take();
        if let Some(sender) = endless {
            let signal = DropSignal(Some(sender));
            let chunks = stream::unfold(signal, |signal| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Some((Ok(Bytes::from(vec![0u8; 16 * 1024])), signal))
            });
            return Ok(chunks.boxed());
        }

        Ok(stream::iter(vec![
            Ok(Bytes::from_static(b"fake-")),
            Ok(Bytes::from_static(b"media-")),
            Ok(Bytes::from_static(b"bytes")),
        ])
        .boxed())
    }
}

fn raw(
    quality: Option<&str>,
    container: &str,
    audio: Option<u32>,
    has_audio: bool,
    id: &str,
) -> RawFormat {
    RawFormat {
        quality_label: quality.map(ToString::to_string),
        container: container.to_string(),
        audio_bitrate: audio,
        has_audio,
        has_video: quality.is_some(),
        height: quality.and_then(|q| q.trim_end_matches('p').parse().ok()),
        bitrate: None,
        url: format!("https://media.example/{id}"),
    }
}

pub fn sample_formats() -> Vec<RawFormat> {
    vec![
        raw(Some("360p"), "mp4", Some(96), true, "18"),
        raw(Some("720p"), "mp4", Some(128), true, "22"),
        raw(Some("720p"), "mp4", Some(192), true, "22b"),
        raw(Some("1080p"), "webm", None, false, "248"),
        raw(None, "m4a", Some(128), true, "140"),
    ]
}

/// Serves `body` as a proxy list on a random local port.
pub async fn spawn_proxy_provider(body: &'static str) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().route("/list", get(move || async move { body }));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/list")).unwrap()
}
