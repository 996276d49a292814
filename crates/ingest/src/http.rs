use std::io::{self, Read};
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Router, body::Bytes};
use flate2::read::GzDecoder;
use spanproxy_core::config::Config;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Level, debug, info, warn};

use crate::mirror::{Mirror, MirrorPayload};
use crate::sink::Sink;
use crate::zipkin::{ApiVersion, decoder_for};

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
    pub max_inflated_bytes: u64,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_body_bytes: 16 * 1024 * 1024,
            max_inflated_bytes: 64 * 1024 * 1024,
        }
    }
}

impl From<&Config> for HttpOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            allowed_origins: cfg.allowed_origins.clone(),
            max_body_bytes: cfg.max_body_bytes,
            max_inflated_bytes: cfg.max_inflated_bytes,
        }
    }
}

#[derive(Clone)]
pub struct IngestState {
    pub sink: Arc<dyn Sink>,
    pub mirror: Option<Mirror>,
    pub max_inflated_bytes: u64,
}

pub fn router(sink: Arc<dyn Sink>, mirror: Option<Mirror>, opts: HttpOptions) -> Router {
    let state = IngestState {
        sink,
        mirror,
        max_inflated_bytes: opts.max_inflated_bytes,
    };
    Router::new()
        .route("/api/v1/spans", post(spans_v1))
        .route("/api/v2/spans", post(spans_v2))
        .layer(DefaultBodyLimit::max(opts.max_body_bytes))
        .layer(cors_layer(&opts.allowed_origins))
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(state)
}

/// Browsers only see `Access-Control-Allow-Origin` for configured origins;
/// with none configured, cross-origin requests fail their preflight.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter(|o| !o.is_empty()).filter_map(|o| {
            HeaderValue::from_str(o)
                .map_err(|_| warn!(origin = %o, "ignored invalid allowed origin"))
                .ok()
        }))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([HeaderName::from_static("x-requested-with"), CONTENT_TYPE])
}

async fn spans_v1(State(state): State<IngestState>, headers: HeaderMap, body: Bytes) -> Response {
    handle_spans(&state, ApiVersion::V1, &headers, body)
}

async fn spans_v2(State(state): State<IngestState>, headers: HeaderMap, body: Bytes) -> Response {
    handle_spans(&state, ApiVersion::V2, &headers, body)
}

fn handle_spans(
    state: &IngestState,
    version: ApiVersion,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let body = if is_gzip(headers) {
        match inflate(&body, state.max_inflated_bytes) {
            Ok(inflated) => Bytes::from(inflated),
            Err(e) => {
                info!(error = %e, "error ungzipping span data");
                return reject("error ungzipping span data");
            }
        }
    } else {
        body
    };

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if let Some(mirror) = &state.mirror {
        let payload = MirrorPayload {
            content_type: content_type.to_string(),
            body: body.clone(),
        };
        if let Err(e) = mirror.send(payload) {
            warn!(error = %e, "error mirroring span data");
        }
    }

    let Some(decode) = decoder_for(content_type, version) else {
        info!(content_type, "unknown content type");
        return reject("unknown content type");
    };
    let spans = match decode(&body) {
        Ok(spans) => spans,
        Err(e) => {
            info!(error = %e, content_type, "error unmarshaling spans");
            return reject("error unmarshaling span data");
        }
    };

    debug!(count = spans.len(), ?version, "zipkin spans accepted");
    if let Err(e) = state.sink.send(&spans) {
        warn!(error = %e, "error forwarding spans");
    }
    StatusCode::ACCEPTED.into_response()
}

fn reject(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

fn inflate(body: &[u8], limit: u64) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(body)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("inflated body exceeds {limit} bytes"),
        ));
    }
    Ok(out)
}
