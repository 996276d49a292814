use std::collections::BTreeMap;

use serde::Deserialize;
use spanproxy_core::ids::{normalize_parent_id, numeric_trace_id};
use spanproxy_core::model::{NormalizedSpan, TagValue};
use spanproxy_core::time::{duration_ms_from_micros, timestamp_from_micros};
use spanproxy_core::{Result, SpanProxyError};

use super::endpoint::{Endpoint, EndpointFold, JsonEndpoint};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonV1Span {
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    annotations: Option<Vec<Option<JsonV1Annotation>>>,
    #[serde(default)]
    binary_annotations: Option<Vec<Option<JsonV1BinaryAnnotation>>>,
    #[serde(default)]
    debug: Option<bool>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    duration: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct JsonV1Annotation {
    #[serde(default)]
    value: Option<String>,
    #[serde(default, alias = "host")]
    endpoint: Option<JsonEndpoint>,
}

#[derive(Debug, Deserialize)]
struct JsonV1BinaryAnnotation {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default, alias = "host")]
    endpoint: Option<JsonEndpoint>,
}

/// Decodes a JSON array of Zipkin v1 spans.
///
/// Binary annotation values are sent as text by conforming clients, so string
/// values go through [`TagValue::infer`]. Values some clients send already
/// typed are kept as they are.
pub fn decode_json_v1(bytes: &[u8]) -> Result<Vec<NormalizedSpan>> {
    let spans: Vec<JsonV1Span> =
        serde_json::from_slice(bytes).map_err(|e| SpanProxyError::decode("json v1", e))?;
    Ok(spans.into_iter().map(normalize).collect())
}

fn normalize(span: JsonV1Span) -> NormalizedSpan {
    let mut tags = BTreeMap::new();
    let mut fold = EndpointFold::default();
    for ba in span.binary_annotations.into_iter().flatten().flatten() {
        let key = ba.key.unwrap_or_default();
        fold.offer(&key, ba.endpoint.map(Endpoint::from));
        match TagValue::infer_json(ba.value) {
            Some(value) => {
                tags.insert(key, value);
            }
            None => tracing::trace!(key = %key, "skipping null binary annotation value"),
        }
    }
    for a in span.annotations.into_iter().flatten().flatten() {
        fold.offer(a.value.as_deref().unwrap_or_default(), a.endpoint.map(Endpoint::from));
    }

    let trace_id = span.trace_id.unwrap_or_default();
    let mut out = NormalizedSpan {
        trace_id_numeric: numeric_trace_id(&trace_id),
        trace_id,
        span_id: span.id.unwrap_or_default(),
        parent_span_id: normalize_parent_id(span.parent_id.as_deref().unwrap_or_default()),
        name: span.name.unwrap_or_default(),
        service_name: String::new(),
        host_ipv4: String::new(),
        port: 0,
        debug: span.debug.unwrap_or_default(),
        duration_ms: duration_ms_from_micros(span.duration),
        timestamp: timestamp_from_micros(span.timestamp),
        tags,
    };
    fold.apply_to(&mut out);
    out
}
