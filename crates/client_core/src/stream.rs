//! Server-push event stream for a single generation run.
//!
//! The consumer forwards decoded [`AgentUpdate`]s into a caller-supplied sink
//! in transport order. It never buffers, reorders, deduplicates or reconnects;
//! a dropped connection simply ends delivery and closes the sink.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::StreamExt;
use reqwest::{header::ACCEPT, Client};
use shared::{domain::RequestId, protocol::AgentUpdate};
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, info, warn};
use url::Url;

use crate::{command_client::parse_base_url, config::ClientSettings};

pub type UpdateSink = mpsc::UnboundedSender<AgentUpdate>;

pub trait StreamConsumer: Send + Sync {
    /// Starts delivering updates for `request_id` into `sink`.
    ///
    /// Opening never fails up front; connection problems end delivery, which
    /// the receiver observes as a closed channel.
    fn open(&self, request_id: RequestId, sink: UpdateSink) -> StreamHandle;
}

/// Cancellation handle for one open stream. Clones share the same state.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    request_id: RequestId,
    closed: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl StreamHandle {
    /// Handle with no background task, for consumers that deliver inline.
    pub fn detached(request_id: RequestId) -> Self {
        Self::from_parts(request_id, Arc::new(AtomicBool::new(false)), None)
    }

    fn from_parts(
        request_id: RequestId,
        closed: Arc<AtomicBool>,
        task: Option<AbortHandle>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                request_id,
                closed,
                task,
            }),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Idempotent; safe on a stream whose connection already dropped.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = &self.inner.task {
            task.abort();
        }
        debug!(request_id = self.inner.request_id.0, "stream: closed");
    }
}

/// Incremental `text/event-stream` decoder yielding the data of each event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                self.data_lines.push(data.to_string());
            }
        }

        events
    }
}

pub struct SseStreamConsumer {
    http: Client,
    base_url: Url,
}

impl SseStreamConsumer {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self::with_http_client(Client::new(), parse_base_url(base_url)?))
    }

    pub fn from_settings(settings: &ClientSettings) -> anyhow::Result<Self> {
        Ok(Self::with_http_client(
            settings.build_http_client()?,
            parse_base_url(&settings.api_base_url)?,
        ))
    }

    pub fn with_http_client(http: Client, base_url: Url) -> Self {
        Self { http, base_url }
    }
}

impl StreamConsumer for SseStreamConsumer {
    fn open(&self, request_id: RequestId, sink: UpdateSink) -> StreamHandle {
        let closed = Arc::new(AtomicBool::new(false));
        let url = match self.base_url.join(&format!("stream/{request_id}")) {
            Ok(url) => url,
            Err(err) => {
                warn!(request_id = request_id.0, error = %err, "stream: invalid stream url");
                return StreamHandle::from_parts(request_id, closed, None);
            }
        };

        let task = tokio::spawn(read_event_stream(
            self.http.clone(),
            url,
            request_id,
            sink,
            Arc::clone(&closed),
        ));
        StreamHandle::from_parts(request_id, closed, Some(task.abort_handle()))
    }
}

async fn read_event_stream(
    http: Client,
    url: Url,
    request_id: RequestId,
    sink: UpdateSink,
    closed: Arc<AtomicBool>,
) {
    let response = match http
        .get(url.clone())
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
        .and_then(|res| res.error_for_status())
    {
        Ok(response) => response,
        Err(err) => {
            warn!(request_id = request_id.0, %url, error = %err, "stream: connect failed");
            return;
        }
    };
    info!(request_id = request_id.0, "stream: connected");

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(request_id = request_id.0, error = %err, "stream: receive failed");
                return;
            }
        };

        for data in decoder.feed(&chunk) {
            let update = match serde_json::from_str::<AgentUpdate>(&data) {
                Ok(update) => update,
                Err(err) => {
                    warn!(
                        request_id = request_id.0,
                        error = %err,
                        "stream: skipping undecodable event"
                    );
                    continue;
                }
            };
            if closed.load(Ordering::SeqCst) || sink.send(update).is_err() {
                return;
            }
        }
    }

    debug!(request_id = request_id.0, "stream: server closed connection");
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
