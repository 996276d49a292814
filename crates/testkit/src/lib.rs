use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use thrift::protocol::{
    TBinaryOutputProtocol, TFieldIdentifier, TListIdentifier, TOutputProtocol, TStructIdentifier,
    TType,
};

pub const TRACE_ID: i64 = 0x3505_65b6_a90d_4c8c;
pub const POODLE_IPV4: i32 = 176_280_431;
pub const RETRIEVER_IPV4: i32 = 176_280_520;

pub const ANNOTATION_BOOL: i32 = 0;
pub const ANNOTATION_BYTES: i32 = 1;
pub const ANNOTATION_I16: i32 = 2;
pub const ANNOTATION_I32: i32 = 3;
pub const ANNOTATION_I64: i32 = 4;
pub const ANNOTATION_DOUBLE: i32 = 5;
pub const ANNOTATION_STRING: i32 = 6;

#[derive(Debug, Clone, Default)]
pub struct ThriftEndpoint {
    pub ipv4: i32,
    pub port: i16,
    pub service_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ThriftAnnotation {
    pub timestamp: i64,
    pub value: String,
    pub host: Option<ThriftEndpoint>,
}

#[derive(Debug, Clone, Default)]
pub struct ThriftBinaryAnnotation {
    pub key: String,
    pub value: Vec<u8>,
    pub annotation_type: i32,
    pub host: Option<ThriftEndpoint>,
}

#[derive(Debug, Clone, Default)]
pub struct ThriftSpan {
    pub trace_id: i64,
    pub name: String,
    pub id: i64,
    pub parent_id: Option<i64>,
    pub annotations: Vec<ThriftAnnotation>,
    pub binary_annotations: Vec<ThriftBinaryAnnotation>,
    pub debug: Option<bool>,
    pub timestamp: Option<i64>,
    pub duration: Option<i64>,
    pub trace_id_high: Option<i64>,
}

pub fn poodle() -> ThriftEndpoint {
    ThriftEndpoint {
        ipv4: POODLE_IPV4,
        port: 0,
        service_name: "poodle".to_string(),
    }
}

pub fn retriever() -> ThriftEndpoint {
    ThriftEndpoint {
        ipv4: RETRIEVER_IPV4,
        port: 9000,
        service_name: "retriever".to_string(),
    }
}

pub fn string_annotation(key: &str, value: &str, host: Option<ThriftEndpoint>) -> ThriftBinaryAnnotation {
    ThriftBinaryAnnotation {
        key: key.to_string(),
        value: value.as_bytes().to_vec(),
        annotation_type: ANNOTATION_STRING,
        host,
    }
}

pub fn typed_annotation(key: &str, annotation_type: i32, value: Vec<u8>) -> ThriftBinaryAnnotation {
    ThriftBinaryAnnotation {
        key: key.to_string(),
        value,
        annotation_type,
        host: None,
    }
}

pub fn annotation(value: &str, timestamp: i64, host: Option<ThriftEndpoint>) -> ThriftAnnotation {
    ThriftAnnotation {
        timestamp,
        value: value.to_string(),
        host,
    }
}

/// The four spans of one captured `executeQuery` trace.
pub fn sample_thrift_spans() -> Vec<ThriftSpan> {
    let lc = || string_annotation("lc", "poodle", Some(poodle()));
    vec![
        ThriftSpan {
            trace_id: TRACE_ID,
            name: "/api.RetrieverService/Fetch".to_string(),
            id: 0x3ba1_d9a5_451f_81c4,
            parent_id: Some(TRACE_ID),
            annotations: vec![
                annotation("cs", 1_506_629_717_286_440, Some(poodle())),
                annotation("cr", 1_506_629_717_288_595, Some(poodle())),
            ],
            binary_annotations: vec![
                string_annotation("component", "gRPC", Some(poodle())),
                ThriftBinaryAnnotation {
                    key: "sa".to_string(),
                    value: vec![1],
                    annotation_type: ANNOTATION_BOOL,
                    host: Some(retriever()),
                },
            ],
            timestamp: Some(1_506_629_717_286_440),
            duration: Some(2155),
            ..ThriftSpan::default()
        },
        ThriftSpan {
            trace_id: TRACE_ID,
            name: "persist".to_string(),
            id: 0x3447_2e70_cb66_9b31,
            parent_id: Some(TRACE_ID),
            binary_annotations: vec![
                lc(),
                ThriftBinaryAnnotation {
                    key: "responseLength".to_string(),
                    value: 136_i64.to_be_bytes().to_vec(),
                    annotation_type: ANNOTATION_I64,
                    host: Some(poodle()),
                },
            ],
            timestamp: Some(1_506_629_717_288_651),
            duration: Some(192),
            ..ThriftSpan::default()
        },
        ThriftSpan {
            trace_id: TRACE_ID,
            name: "markAsDone".to_string(),
            id: 0x2eb1_b700_9815_c803,
            parent_id: Some(TRACE_ID),
            binary_annotations: vec![lc()],
            timestamp: Some(1_506_629_717_288_847),
            duration: Some(5134),
            ..ThriftSpan::default()
        },
        ThriftSpan {
            trace_id: TRACE_ID,
            name: "executeQuery".to_string(),
            id: TRACE_ID,
            parent_id: Some(0),
            binary_annotations: vec![
                lc(),
                string_annotation("dataset_id", "90", Some(poodle())),
                string_annotation("hidden_reason", "0", Some(poodle())),
                string_annotation("hostname", "sea-of-dreams", Some(poodle())),
                string_annotation("jaeger.version", "Go-2.8.0", Some(poodle())),
                string_annotation("query_hash", "fca2835dced5d6fafb4eb9dd", Some(poodle())),
                string_annotation("query_run_pk", "7AREu8scycJ", Some(poodle())),
                string_annotation("sampler.param", "true", Some(poodle())),
                string_annotation("sampler.type", "const", Some(poodle())),
                string_annotation("team_id", "12", Some(poodle())),
                string_annotation("user_id", "15", Some(poodle())),
            ],
            timestamp: Some(1_506_629_717_284_010),
            duration: Some(9980),
            ..ThriftSpan::default()
        },
    ]
}

pub fn sample_thrift_payload() -> Vec<u8> {
    encode_thrift_spans(&sample_thrift_spans())
}

/// Encodes spans as a binary-protocol `list<zipkincore.Span>`.
pub fn encode_thrift_spans(spans: &[ThriftSpan]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut out = TBinaryOutputProtocol::new(&mut buf, true);
        write_span_list(&mut out, spans).expect("encode thrift spans");
    }
    buf
}

fn write_span_list(out: &mut dyn TOutputProtocol, spans: &[ThriftSpan]) -> thrift::Result<()> {
    out.write_list_begin(&TListIdentifier::new(TType::Struct, spans.len() as i32))?;
    for span in spans {
        write_span(out, span)?;
    }
    out.write_list_end()?;
    out.flush()
}

fn write_span(out: &mut dyn TOutputProtocol, span: &ThriftSpan) -> thrift::Result<()> {
    out.write_struct_begin(&TStructIdentifier::new("Span"))?;

    out.write_field_begin(&TFieldIdentifier::new("trace_id", TType::I64, 1))?;
    out.write_i64(span.trace_id)?;
    out.write_field_end()?;

    out.write_field_begin(&TFieldIdentifier::new("name", TType::String, 3))?;
    out.write_string(&span.name)?;
    out.write_field_end()?;

    out.write_field_begin(&TFieldIdentifier::new("id", TType::I64, 4))?;
    out.write_i64(span.id)?;
    out.write_field_end()?;

    if let Some(parent_id) = span.parent_id {
        out.write_field_begin(&TFieldIdentifier::new("parent_id", TType::I64, 5))?;
        out.write_i64(parent_id)?;
        out.write_field_end()?;
    }

    out.write_field_begin(&TFieldIdentifier::new("annotations", TType::List, 6))?;
    out.write_list_begin(&TListIdentifier::new(
        TType::Struct,
        span.annotations.len() as i32,
    ))?;
    for a in &span.annotations {
        out.write_struct_begin(&TStructIdentifier::new("Annotation"))?;
        out.write_field_begin(&TFieldIdentifier::new("timestamp", TType::I64, 1))?;
        out.write_i64(a.timestamp)?;
        out.write_field_end()?;
        out.write_field_begin(&TFieldIdentifier::new("value", TType::String, 2))?;
        out.write_string(&a.value)?;
        out.write_field_end()?;
        if let Some(host) = &a.host {
            write_endpoint_field(out, 3, host)?;
        }
        out.write_field_stop()?;
        out.write_struct_end()?;
    }
    out.write_list_end()?;
    out.write_field_end()?;

    out.write_field_begin(&TFieldIdentifier::new(
        "binary_annotations",
        TType::List,
        8,
    ))?;
    out.write_list_begin(&TListIdentifier::new(
        TType::Struct,
        span.binary_annotations.len() as i32,
    ))?;
    for ba in &span.binary_annotations {
        out.write_struct_begin(&TStructIdentifier::new("BinaryAnnotation"))?;
        out.write_field_begin(&TFieldIdentifier::new("key", TType::String, 1))?;
        out.write_string(&ba.key)?;
        out.write_field_end()?;
        out.write_field_begin(&TFieldIdentifier::new("value", TType::String, 2))?;
        out.write_bytes(&ba.value)?;
        out.write_field_end()?;
        out.write_field_begin(&TFieldIdentifier::new("annotation_type", TType::I32, 3))?;
        out.write_i32(ba.annotation_type)?;
        out.write_field_end()?;
        if let Some(host) = &ba.host {
            write_endpoint_field(out, 4, host)?;
        }
        out.write_field_stop()?;
        out.write_struct_end()?;
    }
    out.write_list_end()?;
    out.write_field_end()?;

    if let Some(debug) = span.debug {
        out.write_field_begin(&TFieldIdentifier::new("debug", TType::Bool, 9))?;
        out.write_bool(debug)?;
        out.write_field_end()?;
    }
    if let Some(timestamp) = span.timestamp {
        out.write_field_begin(&TFieldIdentifier::new("timestamp", TType::I64, 10))?;
        out.write_i64(timestamp)?;
        out.write_field_end()?;
    }
    if let Some(duration) = span.duration {
        out.write_field_begin(&TFieldIdentifier::new("duration", TType::I64, 11))?;
        out.write_i64(duration)?;
        out.write_field_end()?;
    }
    if let Some(high) = span.trace_id_high {
        out.write_field_begin(&TFieldIdentifier::new("trace_id_high", TType::I64, 12))?;
        out.write_i64(high)?;
        out.write_field_end()?;
    }

    out.write_field_stop()?;
    out.write_struct_end()
}

fn write_endpoint_field(
    out: &mut dyn TOutputProtocol,
    id: i16,
    endpoint: &ThriftEndpoint,
) -> thrift::Result<()> {
    out.write_field_begin(&TFieldIdentifier::new("host", TType::Struct, id))?;
    out.write_struct_begin(&TStructIdentifier::new("Endpoint"))?;
    out.write_field_begin(&TFieldIdentifier::new("ipv4", TType::I32, 1))?;
    out.write_i32(endpoint.ipv4)?;
    out.write_field_end()?;
    out.write_field_begin(&TFieldIdentifier::new("port", TType::I16, 2))?;
    out.write_i16(endpoint.port)?;
    out.write_field_end()?;
    out.write_field_begin(&TFieldIdentifier::new("service_name", TType::String, 3))?;
    out.write_string(&endpoint.service_name)?;
    out.write_field_end()?;
    out.write_field_stop()?;
    out.write_struct_end()?;
    out.write_field_end()
}

/// A Zipkin v1 JSON span whose binary annotations all carry the same endpoint.
pub fn json_v1_span(name: &str, binary_annotations: &[(&str, &str)]) -> serde_json::Value {
    let endpoint = serde_json::json!({
        "ipv4": "10.129.211.111",
        "serviceName": "poodle",
    });
    serde_json::json!({
        "traceId": "350565b6a90d4c8c",
        "name": name,
        "id": "34472e70cb669b31",
        "parentId": "",
        "binaryAnnotations": binary_annotations
            .iter()
            .map(|(k, v)| serde_json::json!({"key": k, "value": v, "endpoint": endpoint}))
            .collect::<Vec<_>>(),
        "timestamp": 1_506_629_747_288_651_i64,
        "duration": 192,
    })
}

pub fn sample_json_v1_payload() -> Vec<u8> {
    let spans = serde_json::json!([json_v1_span(
        "persist",
        &[("lc", "poodle"), ("responseLength", "136")]
    )]);
    serde_json::to_vec(&spans).expect("encode json v1 spans")
}

pub fn sample_json_v2_payload() -> Vec<u8> {
    let spans = serde_json::json!([{
        "traceId": "350565b6a90d4c8c",
        "name": "get /api",
        "id": "3ba1d9a5451f81c4",
        "parentId": "350565b6a90d4c8c",
        "kind": "SERVER",
        "localEndpoint": {"serviceName": "frontend", "ipv4": "10.129.211.111", "port": 8080},
        "remoteEndpoint": {"ipv4": "10.129.211.200", "port": 51234},
        "tags": {"http.method": "GET", "http.status_code": 200, "error": false},
        "timestamp": 1_506_629_717_286_440_i64,
        "duration": 2155,
    }]);
    serde_json::to_vec(&spans).expect("encode json v2 spans")
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Clone)]
struct CaptureState {
    status: StatusCode,
    response: Bytes,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

/// An HTTP server that records every request and answers with a fixed status.
pub struct CaptureServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl CaptureServer {
    pub async fn start(status: StatusCode) -> Self {
        Self::start_with_body(status, Vec::new()).await
    }

    /// Like [`CaptureServer::start`], answering every request with `body`.
    pub async fn start_with_body(status: StatusCode, body: Vec<u8>) -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = CaptureState {
            status,
            response: Bytes::from(body),
            requests: requests.clone(),
        };
        let router = Router::new().fallback(capture).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Polls until at least `count` requests arrived or `timeout` passed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<CapturedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let requests = self.requests();
            if requests.len() >= count || tokio::time::Instant::now() >= deadline {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn capture(
    State(state): State<CaptureState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Bytes) {
    let headers = headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_ascii_lowercase(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    state.requests.lock().unwrap().push(CapturedRequest {
        path: uri.path().to_string(),
        headers,
        body: body.to_vec(),
    });
    (state.status, state.response)
}
