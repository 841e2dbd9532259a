use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    resolver::{MediaStream, ResolverError},
};

/// Per-download state that must live exactly as long as the response body.
pub struct RelayScope {
    pub request_id: Uuid,
    pub video: String,
    pub started_at: DateTime<Utc>,
    /// Cancelled on server shutdown; an in-flight body then ends early.
    pub cancel: CancellationToken,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Pipes `stream` into an attachment response named `video.<container>`.
///
/// The first chunk is awaited before any header is committed, so an upstream
/// that fails immediately still gets a structured 500. Errors after that point
/// can only end the body early.
pub async fn relay(
    mut stream: MediaStream,
    container: &str,
    scope: RelayScope,
) -> Result<Response, ServiceError> {
    let first = match stream.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(error)) => {
            error!(
                request_id = %scope.request_id,
                "Error downloading video {}: {error}", scope.video
            );
            return Err(ServiceError::download_failed(error.to_string()));
        }
        None => None,
    };

    let headers = attachment_headers(container)?;
    let body = RelayBody {
        first,
        inner: stream,
        shutdown: Box::pin(scope.cancel.clone().cancelled_owned()),
        scope,
        bytes_sent: 0,
        finished: false,
    };

    Ok((headers, Body::from_stream(body)).into_response())
}

fn attachment_headers(container: &str) -> Result<HeaderMap, ServiceError> {
    let extension = sanitize_extension(container);
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"video.{extension}\""))
            .map_err(|_| ServiceError::download_failed("could not build download header"))?,
    );
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&format!("video/{extension}"))
            .map_err(|_| ServiceError::download_failed("could not build content type"))?,
    );
    Ok(headers)
}

fn sanitize_extension(container: &str) -> String {
    let cleaned: String = container
        .trim()
        .chars()
        .filter(|character| character.is_ascii_alphanumeric())
        .map(|character| character.to_ascii_lowercase())
        .collect();
    if cleaned.is_empty() {
        "mp4".to_string()
    } else {
        cleaned
    }
}

struct RelayBody {
    first: Option<Bytes>,
    inner: MediaStream,
    shutdown: Pin<Box<WaitForCancellationFutureOwned>>,
    scope: RelayScope,
    bytes_sent: u64,
    finished: bool,
}

impl Stream for RelayBody {
    type Item = Result<Bytes, ResolverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.finished {
            return Poll::Ready(None);
        }
        if this.shutdown.as_mut().poll(cx).is_ready() {
            this.finished = true;
            warn!(
                request_id = %this.scope.request_id,
                bytes_sent = this.bytes_sent,
                "Server shutting down, closing download of {}",
                this.scope.video
            );
            return Poll::Ready(Some(Err(ResolverError::Cancelled)));
        }
        if let Some(chunk) = this.first.take() {
            this.bytes_sent = this.bytes_sent.saturating_add(chunk.len() as u64);
            return Poll::Ready(Some(Ok(chunk)));
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes_sent = this.bytes_sent.saturating_add(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.finished = true;
                error!(
                    request_id = %this.scope.request_id,
                    bytes_sent = this.bytes_sent,
                    "Stream for {} failed after headers were sent, closing connection: {error}",
                    this.scope.video
                );
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.scope.permit.take();
                let elapsed_ms = (Utc::now() - this.scope.started_at).num_milliseconds();
                info!(
                    request_id = %this.scope.request_id,
                    bytes_sent = this.bytes_sent,
                    elapsed_ms,
                    "Downloaded video: {}",
                    this.scope.video
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                request_id = %self.scope.request_id,
                bytes_sent = self.bytes_sent,
                "Client went away while downloading {}, aborting upstream transfer",
                self.scope.video
            );
        }
    }
}
