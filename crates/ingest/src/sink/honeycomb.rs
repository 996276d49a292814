use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{Map, Value};
use spanproxy_core::model::NormalizedSpan;
use spanproxy_core::sample::TraceSampler;
use spanproxy_core::{Result, SpanProxyError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Sink;

/// Tag naming the dataset a span's event goes to.
pub const DATASET_TAG: &str = "honeycomb.dataset";
/// Tag carrying a per-span sample rate.
pub const SAMPLE_RATE_TAG: &str = "honeycomb.samplerate";

const SEND_ATTEMPTS: u64 = 3;

#[derive(Debug, Clone)]
pub struct HoneycombConfig {
    pub api_host: String,
    pub write_key: String,
    pub dataset: String,
    pub sample_rate: u32,
    pub drop_fields: Vec<String>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for HoneycombConfig {
    fn default() -> Self {
        Self {
            api_host: "https://api.honeycomb.io/".to_string(),
            write_key: String::new(),
            dataset: String::new(),
            sample_rate: 1,
            drop_fields: Vec::new(),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
            channel_capacity: 10_000,
        }
    }
}

/// One analytics event, as posted in a batch body.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    #[serde(skip)]
    pub dataset: String,
    pub time: DateTime<Utc>,
    pub samplerate: u32,
    pub data: Map<String, Value>,
}

/// Turns spans into events and ships them to the Honeycomb batch API from a
/// background task.
pub struct HoneycombSink {
    tx: mpsc::Sender<Event>,
    dataset: String,
    sample_rate: u32,
    drop_fields: HashSet<String>,
}

impl HoneycombSink {
    /// Spawns the delivery task. It flushes what is buffered and exits once
    /// the sink is dropped.
    pub fn start(cfg: HoneycombConfig) -> Result<(Self, JoinHandle<()>)> {
        if cfg.write_key.is_empty() || cfg.dataset.is_empty() {
            return Err(SpanProxyError::InvalidArgument(
                "honeycomb sink needs a write key and a dataset".to_string(),
            ));
        }
        let api_host = Url::parse(&cfg.api_host)
            .map_err(|e| SpanProxyError::Config(format!("invalid api host {}: {e}", cfg.api_host)))?;
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| SpanProxyError::Sink(format!("failed to build http client: {e}")))?;

        let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let delivery = Delivery {
            client,
            api_host,
            write_key: cfg.write_key,
        };
        let handle = tokio::spawn(run_batcher(
            delivery,
            rx,
            cfg.batch_size.max(1),
            cfg.flush_interval,
        ));

        let sink = Self {
            tx,
            dataset: cfg.dataset,
            sample_rate: cfg.sample_rate.max(1),
            drop_fields: cfg.drop_fields.into_iter().collect(),
        };
        Ok((sink, handle))
    }

    /// Builds the event for one span, or `None` when the span's trace is
    /// sampled out.
    ///
    /// A non-empty string `honeycomb.dataset` tag picks the dataset. A
    /// `honeycomb.samplerate` tag holding a positive integer, or a string
    /// that parses as one, picks the rate; any other value means 1.
    pub fn event_for(&self, span: &NormalizedSpan) -> Option<Event> {
        let dataset = match span
            .tag(DATASET_TAG)
            .and_then(|v| v.as_str())
            .filter(|d| !d.is_empty())
        {
            Some(dataset) => dataset.to_string(),
            None => self.dataset.clone(),
        };
        let sample_rate = match span.tag(SAMPLE_RATE_TAG) {
            Some(v) => v
                .as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
                .filter(|rate| *rate > 0)
                .and_then(|rate| u32::try_from(rate).ok())
                .unwrap_or(1),
            None => self.sample_rate,
        };
        if !TraceSampler::new(sample_rate).should_keep(span.trace_id_numeric) {
            return None;
        }

        let mut data = Map::new();
        data.insert("traceId".into(), span.trace_id.clone().into());
        data.insert("name".into(), span.name.clone().into());
        data.insert("id".into(), span.span_id.clone().into());
        if span.has_parent() {
            data.insert("parentId".into(), span.parent_span_id.clone().into());
        }
        if !span.service_name.is_empty() {
            data.insert("serviceName".into(), span.service_name.clone().into());
        }
        if !span.host_ipv4.is_empty() {
            data.insert("hostIPv4".into(), span.host_ipv4.clone().into());
        }
        if span.port != 0 {
            data.insert("port".into(), span.port.into());
        }
        if span.debug {
            data.insert("debug".into(), true.into());
        }
        data.insert("durationMs".into(), Value::from(span.duration_ms));
        for (key, value) in &span.tags {
            data.insert(key.clone(), value.to_json());
        }
        data.remove(DATASET_TAG);
        data.remove(SAMPLE_RATE_TAG);
        data.retain(|key, _| !self.drop_fields.contains(key));

        Some(Event {
            dataset,
            time: span.timestamp,
            samplerate: sample_rate,
            data,
        })
    }
}

impl Sink for HoneycombSink {
    fn name(&self) -> &'static str {
        "honeycomb"
    }

    fn send(&self, spans: &[NormalizedSpan]) -> Result<()> {
        let mut dropped = 0usize;
        for event in spans.iter().filter_map(|span| self.event_for(span)) {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => {
                    return Err(SpanProxyError::Sink("honeycomb delivery task stopped".into()));
                }
            }
        }
        if dropped > 0 {
            warn!(dropped, "honeycomb queue full; dropped events");
        }
        Ok(())
    }
}

struct Delivery {
    client: Client,
    api_host: Url,
    write_key: String,
}

impl Delivery {
    fn batch_url(&self, dataset: &str) -> Option<Url> {
        let mut url = self.api_host.clone();
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(["1", "batch", dataset]);
        Some(url)
    }

    async fn flush(&self, buffer: &mut Vec<Event>) {
        let mut by_dataset: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for event in buffer.drain(..) {
            by_dataset.entry(event.dataset.clone()).or_default().push(event);
        }
        for (dataset, events) in by_dataset {
            self.post_batch(&dataset, &events).await;
        }
    }

    async fn post_batch(&self, dataset: &str, events: &[Event]) {
        let Some(url) = self.batch_url(dataset) else {
            warn!(dataset, "cannot build batch url; dropping events");
            return;
        };
        let body = match serde_json::to_vec(events) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, dataset, "failed to encode event batch");
                return;
            }
        };

        for attempt in 0..SEND_ATTEMPTS {
            let result = self
                .client
                .post(url.clone())
                .header("content-type", "application/json")
                .header("x-honeycomb-team", self.write_key.as_str())
                .body(body.clone())
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(dataset, count = events.len(), "sent event batch");
                    return;
                }
                Ok(resp) => debug!(dataset, status = %resp.status(), attempt, "event batch rejected"),
                Err(e) => debug!(dataset, error = %e, attempt, "event batch send failed"),
            }
            tokio::time::sleep(Duration::from_millis(30 * (attempt + 1))).await;
        }
        warn!(dataset, count = events.len(), "event batch failed after retries");
    }
}

async fn run_batcher(
    delivery: Delivery,
    mut rx: mpsc::Receiver<Event>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let start = tokio::time::Instant::now() + flush_interval;
    let mut ticker = tokio::time::interval_at(start, flush_interval);
    let mut buffer = Vec::new();
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        delivery.flush(&mut buffer).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    delivery.flush(&mut buffer).await;
                }
            }
        }
    }
    if !buffer.is_empty() {
        delivery.flush(&mut buffer).await;
    }
    debug!("honeycomb delivery task finished");
}
