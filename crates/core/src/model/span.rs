use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::tag::TagValue;

/// A span in the single shape every wire format decodes into.
///
/// Endpoint attributes describe the service that produced the span and stay
/// at their zero values when no endpoint could be attributed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NormalizedSpan {
    pub trace_id: String,
    /// Sampling key only; derived from `trace_id`, 0 when it does not parse.
    #[serde(skip)]
    pub trace_id_numeric: i64,
    pub span_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent_span_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host_ipv4: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, TagValue>,
}

impl NormalizedSpan {
    pub fn has_parent(&self) -> bool {
        !self.parent_span_id.is_empty()
    }

    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}
