use std::collections::BTreeMap;

use serde::Deserialize;
use spanproxy_core::ids::{normalize_parent_id, numeric_trace_id};
use spanproxy_core::model::{NormalizedSpan, TagValue};
use spanproxy_core::time::{duration_ms_from_micros, timestamp_from_micros};
use spanproxy_core::{Result, SpanProxyError};

use super::endpoint::{Endpoint, JsonEndpoint};

// `remoteEndpoint` describes the other side of the call and is not read.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonV2Span {
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    local_endpoint: Option<JsonEndpoint>,
    #[serde(default)]
    tags: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    debug: Option<bool>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    duration: Option<i64>,
}

/// Decodes a JSON array of Zipkin v2 spans. Tag values arrive typed and are
/// copied without inference.
pub fn decode_json_v2(bytes: &[u8]) -> Result<Vec<NormalizedSpan>> {
    let spans: Vec<JsonV2Span> =
        serde_json::from_slice(bytes).map_err(|e| SpanProxyError::decode("json v2", e))?;
    Ok(spans.into_iter().map(normalize).collect())
}

fn normalize(span: JsonV2Span) -> NormalizedSpan {
    let mut tags: BTreeMap<String, TagValue> = span
        .tags
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| TagValue::from_json(v).map(|v| (k, v)))
        .collect();
    tags.insert("kind".to_string(), TagValue::String(span.kind.unwrap_or_default()));

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
    let local = span.local_endpoint.map(Endpoint::from).unwrap_or_default();
    if !local.is_empty() {
        local.apply_to(&mut out);
    }
    out
}
