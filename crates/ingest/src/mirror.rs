use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode, Url};
use spanproxy_core::{Result, SpanProxyError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const MAX_LOGGED_RESPONSE_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub downstream_url: String,
    pub buffer_size: usize,
    pub max_concurrency: usize,
    pub timeout: Duration,
}

impl MirrorConfig {
    pub fn new(downstream_url: impl Into<String>) -> Self {
        Self {
            downstream_url: downstream_url.into(),
            buffer_size: 4096,
            max_concurrency: 100,
            timeout: Duration::from_secs(10),
        }
    }
}

/// A request body to copy downstream, as received.
#[derive(Debug, Clone)]
pub struct MirrorPayload {
    pub content_type: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error("mirror queue full")]
    Full,
    #[error("mirror stopped")]
    Stopped,
}

/// Fire-and-forget copy of raw span payloads to a secondary collector.
#[derive(Clone)]
pub struct Mirror {
    tx: mpsc::Sender<MirrorPayload>,
}

impl Mirror {
    /// Spawns the delivery task. Queued payloads drain and the task ends once
    /// every clone of the returned `Mirror` is dropped.
    pub fn start(cfg: MirrorConfig) -> Result<(Self, JoinHandle<()>)> {
        let url = Url::parse(&cfg.downstream_url).map_err(|e| {
            SpanProxyError::Config(format!("invalid downstream url {}: {e}", cfg.downstream_url))
        })?;
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| SpanProxyError::Mirror(format!("failed to build http client: {e}")))?;

        let (tx, rx) = mpsc::channel(cfg.buffer_size.max(1));
        let concurrency = cfg.max_concurrency.max(1);
        let handle = tokio::spawn(async move {
            ReceiverStream::new(rx)
                .for_each_concurrent(concurrency, |payload| {
                    let client = client.clone();
                    let url = url.clone();
                    async move { deliver(&client, url, payload).await }
                })
                .await;
            debug!("mirror task finished");
        });
        Ok((Self { tx }, handle))
    }

    /// Queues a payload without waiting.
    pub fn send(&self, payload: MirrorPayload) -> std::result::Result<(), MirrorError> {
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => MirrorError::Full,
            TrySendError::Closed(_) => MirrorError::Stopped,
        })
    }
}

async fn deliver(client: &Client, url: Url, payload: MirrorPayload) {
    let result = client
        .post(url)
        .header(CONTENT_TYPE, payload.content_type)
        .body(payload.body)
        .send()
        .await;
    let resp = match result {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "error sending payload downstream");
            return;
        }
    };
    if resp.status() == StatusCode::ACCEPTED {
        return;
    }
    let status = resp.status();
    let shown = response_excerpt(resp, MAX_LOGGED_RESPONSE_BYTES).await;
    warn!(
        status = %status,
        response = %String::from_utf8_lossy(&shown),
        "error response sending payload downstream"
    );
}

/// Reads at most `limit` bytes of a response body; the rest is never pulled
/// off the connection.
async fn response_excerpt(mut resp: Response, limit: usize) -> Bytes {
    let mut excerpt = BytesMut::new();
    while excerpt.len() < limit {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - excerpt.len());
                excerpt.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "error reading downstream response");
                break;
            }
        }
    }
    excerpt.freeze()
}
