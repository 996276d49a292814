use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::Ipv4Addr;

use ::thrift::protocol::{TBinaryInputProtocol, TInputProtocol, TType};
use ::thrift::{ProtocolError, ProtocolErrorKind};
use spanproxy_core::ids::{id_to_hex, normalize_parent_id, trace_id_to_hex};
use spanproxy_core::model::{NormalizedSpan, TagValue};
use spanproxy_core::time::{duration_ms_from_micros, timestamp_from_micros};
use spanproxy_core::{Result, SpanProxyError};
use tracing::debug;

use super::endpoint::{Endpoint, EndpointFold};

const ANNOTATION_BOOL: i32 = 0;
const ANNOTATION_BYTES: i32 = 1;
const ANNOTATION_I16: i32 = 2;
const ANNOTATION_I32: i32 = 3;
const ANNOTATION_I64: i32 = 4;
const ANNOTATION_DOUBLE: i32 = 5;
const ANNOTATION_STRING: i32 = 6;

const MAX_SKIP_DEPTH: u8 = 64;

/// Decodes a binary-protocol `list<zipkincore.Span>`.
pub fn decode_thrift(bytes: &[u8]) -> Result<Vec<NormalizedSpan>> {
    let spans = SpanReader::new(bytes)
        .read_spans()
        .map_err(|e| SpanProxyError::decode("thrift", e))?;
    Ok(spans.into_iter().map(normalize).collect())
}

#[derive(Debug, Default)]
struct ThriftEndpoint {
    ipv4: i32,
    port: i16,
    service_name: String,
}

impl From<ThriftEndpoint> for Endpoint {
    fn from(value: ThriftEndpoint) -> Self {
        Self {
            ipv4: Ipv4Addr::from(value.ipv4 as u32).to_string(),
            port: value.port as u16,
            service_name: value.service_name,
        }
    }
}

#[derive(Debug, Default)]
struct ThriftAnnotation {
    value: String,
    host: Option<ThriftEndpoint>,
}

#[derive(Debug, Default)]
struct ThriftBinaryAnnotation {
    key: String,
    value: Vec<u8>,
    annotation_type: i32,
    host: Option<ThriftEndpoint>,
}

#[derive(Debug, Default)]
struct ThriftSpan {
    trace_id: i64,
    name: String,
    id: i64,
    parent_id: Option<i64>,
    annotations: Vec<ThriftAnnotation>,
    binary_annotations: Vec<ThriftBinaryAnnotation>,
    debug: bool,
    timestamp: Option<i64>,
    duration: Option<i64>,
    trace_id_high: Option<i64>,
}

fn normalize(span: ThriftSpan) -> NormalizedSpan {
    let mut tags = BTreeMap::new();
    let mut fold = EndpointFold::default();
    for ba in span.binary_annotations {
        fold.offer(&ba.key, ba.host.map(Endpoint::from));
        let value = binary_annotation_value(&ba.key, ba.annotation_type, ba.value);
        tags.insert(ba.key, value);
    }
    for a in span.annotations {
        fold.offer(&a.value, a.host.map(Endpoint::from));
    }

    let mut out = NormalizedSpan {
        trace_id: trace_id_to_hex(span.trace_id_high, span.trace_id),
        trace_id_numeric: span.trace_id,
        span_id: id_to_hex(span.id),
        parent_span_id: span
            .parent_id
            .map(|id| normalize_parent_id(&id_to_hex(id)))
            .unwrap_or_default(),
        name: span.name,
        service_name: String::new(),
        host_ipv4: String::new(),
        port: 0,
        debug: span.debug,
        duration_ms: duration_ms_from_micros(span.duration),
        timestamp: timestamp_from_micros(span.timestamp),
        tags,
    };
    fold.apply_to(&mut out);
    out
}

fn binary_annotation_value(key: &str, annotation_type: i32, value: Vec<u8>) -> TagValue {
    let decoded = match annotation_type {
        ANNOTATION_BOOL => Some(TagValue::Bool(value.first().is_some_and(|b| *b != 0))),
        ANNOTATION_BYTES => return TagValue::Bytes(value),
        ANNOTATION_I16 => be_prefix::<2>(&value).map(|b| TagValue::Int(i16::from_be_bytes(b).into())),
        ANNOTATION_I32 => be_prefix::<4>(&value).map(|b| TagValue::Int(i32::from_be_bytes(b).into())),
        ANNOTATION_I64 => be_prefix::<8>(&value).map(|b| TagValue::Int(i64::from_be_bytes(b))),
        ANNOTATION_DOUBLE => be_prefix::<8>(&value).map(|b| TagValue::Float(f64::from_be_bytes(b))),
        ANNOTATION_STRING => Some(TagValue::infer(&String::from_utf8_lossy(&value))),
        other => {
            debug!(key, annotation_type = other, "unknown binary annotation type; keeping raw bytes");
            None
        }
    };
    decoded.unwrap_or_else(|| {
        if matches!(
            annotation_type,
            ANNOTATION_I16 | ANNOTATION_I32 | ANNOTATION_I64 | ANNOTATION_DOUBLE
        ) {
            debug!(key, len = value.len(), "numeric binary annotation too short; keeping raw bytes");
        }
        TagValue::Bytes(value)
    })
}

fn be_prefix<const N: usize>(value: &[u8]) -> Option<[u8; N]> {
    value.get(..N)?.try_into().ok()
}

fn invalid_data(message: impl Into<String>) -> ::thrift::Error {
    ::thrift::Error::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidData, message))
}

/// Reads Zipkin structs off the binary protocol.
///
/// Strings and binaries are length-checked against the input before anything
/// is allocated for them.
struct SpanReader<'a> {
    input: TBinaryInputProtocol<Cursor<&'a [u8]>>,
    input_len: usize,
}

impl<'a> SpanReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            input: TBinaryInputProtocol::new(Cursor::new(bytes), false),
            input_len: bytes.len(),
        }
    }

    fn read_spans(&mut self) -> ::thrift::Result<Vec<ThriftSpan>> {
        self.read_list(Self::read_span)
    }

    // The list header's size is only a hint: malformed input can claim far
    // more elements than it holds, so nothing is preallocated from it.
    fn read_list<T>(
        &mut self,
        read_item: fn(&mut Self) -> ::thrift::Result<T>,
    ) -> ::thrift::Result<Vec<T>> {
        let list = self.input.read_list_begin()?;
        if list.size > 0 && list.element_type != TType::Struct {
            return Err(invalid_data(format!(
                "expected a list of structs, found {:?} elements",
                list.element_type
            )));
        }
        let mut items = Vec::new();
        for _ in 0..list.size.max(0) {
            items.push(read_item(self)?);
        }
        self.input.read_list_end()?;
        Ok(items)
    }

    /// Walks one struct, handing every field to `read_field`. Fields it does
    /// not consume are skipped.
    fn read_struct<F>(&mut self, mut read_field: F) -> ::thrift::Result<()>
    where
        F: FnMut(&mut Self, i16, TType) -> ::thrift::Result<bool>,
    {
        self.input.read_struct_begin()?;
        loop {
            let field = self.input.read_field_begin()?;
            if field.field_type == TType::Stop {
                break;
            }
            let consumed = match field.id {
                Some(id) => read_field(self, id, field.field_type)?,
                None => false,
            };
            if !consumed {
                self.skip(field.field_type, 0)?;
            }
            self.input.read_field_end()?;
        }
        self.input.read_struct_end()
    }

    fn read_span(&mut self) -> ::thrift::Result<ThriftSpan> {
        let mut span = ThriftSpan::default();
        self.read_struct(|r, id, field_type| {
            match (id, field_type) {
                (1, TType::I64) => span.trace_id = r.input.read_i64()?,
                (3, TType::String) => span.name = r.read_string()?,
                (4, TType::I64) => span.id = r.input.read_i64()?,
                (5, TType::I64) => span.parent_id = Some(r.input.read_i64()?),
                (6, TType::List) => span.annotations = r.read_list(Self::read_annotation)?,
                (8, TType::List) => {
                    span.binary_annotations = r.read_list(Self::read_binary_annotation)?
                }
                (9, TType::Bool) => span.debug = r.input.read_bool()?,
                (10, TType::I64) => span.timestamp = Some(r.input.read_i64()?),
                (11, TType::I64) => span.duration = Some(r.input.read_i64()?),
                (12, TType::I64) => span.trace_id_high = Some(r.input.read_i64()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(span)
    }

    fn read_annotation(&mut self) -> ::thrift::Result<ThriftAnnotation> {
        let mut annotation = ThriftAnnotation::default();
        self.read_struct(|r, id, field_type| {
            match (id, field_type) {
                (2, TType::String) => annotation.value = r.read_string()?,
                (3, TType::Struct) => annotation.host = Some(r.read_endpoint()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(annotation)
    }

    fn read_binary_annotation(&mut self) -> ::thrift::Result<ThriftBinaryAnnotation> {
        let mut ba = ThriftBinaryAnnotation::default();
        self.read_struct(|r, id, field_type| {
            match (id, field_type) {
                (1, TType::String) => ba.key = r.read_string()?,
                (2, TType::String) => ba.value = r.read_binary()?,
                (3, TType::I32) => ba.annotation_type = r.input.read_i32()?,
                (4, TType::Struct) => ba.host = Some(r.read_endpoint()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(ba)
    }

    fn read_endpoint(&mut self) -> ::thrift::Result<ThriftEndpoint> {
        let mut endpoint = ThriftEndpoint::default();
        self.read_struct(|r, id, field_type| {
            match (id, field_type) {
                (1, TType::I32) => endpoint.ipv4 = r.input.read_i32()?,
                (2, TType::I16) => endpoint.port = r.input.read_i16()?,
                (3, TType::String) => endpoint.service_name = r.read_string()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(endpoint)
    }

    fn read_binary(&mut self) -> ::thrift::Result<Vec<u8>> {
        let len = self.input.read_i32()?;
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.input_len)
            .ok_or_else(|| invalid_data(format!("invalid binary length {len}")))?;
        let mut buf = Vec::with_capacity(len);
        for _ in 0..len {
            buf.push(self.input.read_byte()?);
        }
        Ok(buf)
    }

    fn read_string(&mut self) -> ::thrift::Result<String> {
        let bytes = self.read_binary()?;
        Ok(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }

    fn skip(&mut self, field_type: TType, depth: u8) -> ::thrift::Result<()> {
        if depth >= MAX_SKIP_DEPTH {
            return Err(invalid_data("struct nesting too deep"));
        }
        match field_type {
            TType::Bool => self.input.read_bool().map(drop),
            TType::I08 => self.input.read_i8().map(drop),
            TType::I16 => self.input.read_i16().map(drop),
            TType::I32 => self.input.read_i32().map(drop),
            TType::I64 => self.input.read_i64().map(drop),
            TType::Double => self.input.read_double().map(drop),
            TType::String => self.read_binary().map(drop),
            TType::Struct => {
                self.input.read_struct_begin()?;
                loop {
                    let field = self.input.read_field_begin()?;
                    if field.field_type == TType::Stop {
                        break;
                    }
                    self.skip(field.field_type, depth + 1)?;
                    self.input.read_field_end()?;
                }
                self.input.read_struct_end()
            }
            TType::List => {
                let list = self.input.read_list_begin()?;
                for _ in 0..list.size.max(0) {
                    self.skip(list.element_type, depth + 1)?;
                }
                self.input.read_list_end()
            }
            TType::Set => {
                let set = self.input.read_set_begin()?;
                for _ in 0..set.size.max(0) {
                    self.skip(set.element_type, depth + 1)?;
                }
                self.input.read_set_end()
            }
            TType::Map => {
                let map = self.input.read_map_begin()?;
                if map.size > 0 {
                    let (Some(key_type), Some(value_type)) = (map.key_type, map.value_type) else {
                        return Err(invalid_data("map without element types"));
                    };
                    for _ in 0..map.size {
                        self.skip(key_type, depth + 1)?;
                        self.skip(value_type, depth + 1)?;
                    }
                }
                self.input.read_map_end()
            }
            other => Err(invalid_data(format!("cannot skip field of type {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use testkit::{
        ANNOTATION_DOUBLE as DOUBLE, ANNOTATION_I16 as I16, ANNOTATION_I32 as I32, ThriftSpan as Fixture,
        encode_thrift_spans, poodle, sample_thrift_payload, typed_annotation,
    };

    use super::*;

    fn single(span: Fixture) -> NormalizedSpan {
        let mut spans = decode_thrift(&encode_thrift_spans(&[span])).unwrap();
        assert_eq!(spans.len(), 1);
        spans.remove(0)
    }

    #[test]
    fn decodes_canonical_fixture() {
        let spans = decode_thrift(&sample_thrift_payload()).unwrap();
        let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["/api.RetrieverService/Fetch", "persist", "markAsDone", "executeQuery"]
        );
        for span in &spans {
            assert_eq!(span.trace_id, "350565b6a90d4c8c");
            assert_eq!(span.trace_id_numeric, testkit::TRACE_ID);
            assert_eq!(span.service_name, "poodle");
            assert_eq!(span.host_ipv4, "10.129.211.111");
        }
        assert_eq!(spans[0].parent_span_id, "350565b6a90d4c8c");
        assert_eq!(spans[3].parent_span_id, "");
        assert!(!spans[3].has_parent());
        assert_eq!(spans[3].span_id, "350565b6a90d4c8c");

        let persist = &spans[1];
        assert_eq!(persist.span_id, "34472e70cb669b31");
        assert_eq!(persist.duration_ms, 0.192);
        assert_eq!(
            persist.timestamp.to_rfc3339(),
            "2017-09-28T20:15:17.288651+00:00"
        );
        assert_eq!(persist.tag("responseLength"), Some(&TagValue::Int(136)));
        assert_eq!(persist.tag("lc"), Some(&TagValue::from("poodle")));

        let query = &spans[3];
        assert_eq!(query.duration_ms, 9.98);
        assert_eq!(query.tag("dataset_id"), Some(&TagValue::Int(90)));
        assert_eq!(query.tag("hidden_reason"), Some(&TagValue::Int(0)));
        assert_eq!(query.tag("sampler.param"), Some(&TagValue::Bool(true)));
        assert_eq!(query.tag("jaeger.version"), Some(&TagValue::from("Go-2.8.0")));
        assert_eq!(query.tag("query_run_pk"), Some(&TagValue::from("7AREu8scycJ")));
        assert_eq!(query.tags.len(), 11);
    }

    #[test]
    fn remote_address_is_tagged_but_not_folded() {
        let spans = decode_thrift(&sample_thrift_payload()).unwrap();
        let fetch = &spans[0];
        assert_eq!(fetch.tag("sa"), Some(&TagValue::Bool(true)));
        assert_eq!(fetch.tag("component"), Some(&TagValue::from("gRPC")));
        assert_eq!(fetch.service_name, "poodle");
        assert_eq!(fetch.port, 0);
    }

    #[test]
    fn only_remote_endpoint_leaves_span_endpoint_empty() {
        let span = single(Fixture {
            trace_id: 1,
            id: 2,
            binary_annotations: vec![testkit::ThriftBinaryAnnotation {
                key: "ca".into(),
                value: vec![1],
                annotation_type: testkit::ANNOTATION_BOOL,
                host: Some(testkit::retriever()),
            }],
            ..Fixture::default()
        });
        assert_eq!(span.service_name, "");
        assert_eq!(span.host_ipv4, "");
        assert_eq!(span.port, 0);
        assert_eq!(span.tag("ca"), Some(&TagValue::Bool(true)));
    }

    #[test]
    fn annotation_endpoints_fold_after_binary_annotations() {
        let span = single(Fixture {
            trace_id: 1,
            id: 2,
            annotations: vec![
                testkit::annotation("cs", 10, Some(poodle())),
                testkit::annotation("ws", 11, Some(testkit::retriever())),
            ],
            binary_annotations: vec![testkit::string_annotation("lc", "poodle", Some(poodle()))],
            ..Fixture::default()
        });
        assert_eq!(span.service_name, "retriever");
        assert_eq!(span.host_ipv4, "10.129.211.200");
        assert_eq!(span.port, 9000);
    }

    #[test]
    fn zero_parent_and_missing_fields() {
        let before = Utc::now();
        let span = single(Fixture {
            trace_id: 26,
            id: 27,
            parent_id: Some(0),
            ..Fixture::default()
        });
        let after = Utc::now();
        assert_eq!(span.trace_id, "1a");
        assert_eq!(span.span_id, "1b");
        assert_eq!(span.parent_span_id, "");
        assert_eq!(span.duration_ms, 0.0);
        assert!(span.timestamp >= before && span.timestamp <= after);
        assert!(span.tags.is_empty());
        assert!(!span.debug);
    }

    #[test]
    fn zero_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let span = single(Fixture {
            trace_id: 1,
            id: 1,
            timestamp: Some(0),
            duration: Some(222),
            ..Fixture::default()
        });
        assert!(span.timestamp >= before);
        assert_eq!(span.duration_ms, 0.222);
    }

    #[test]
    fn carries_debug_and_high_trace_id() {
        let span = single(Fixture {
            trace_id: 26,
            trace_id_high: Some(1),
            id: 1,
            debug: Some(true),
            ..Fixture::default()
        });
        assert!(span.debug);
        assert_eq!(span.trace_id, "0000000000000001000000000000001a");
        assert_eq!(span.trace_id_numeric, 26);
    }

    #[test]
    fn decodes_typed_binary_annotations() {
        let span = single(Fixture {
            trace_id: 1,
            id: 1,
            binary_annotations: vec![
                typed_annotation("short", I16, (-2_i16).to_be_bytes().to_vec()),
                typed_annotation("int", I32, 70_000_i32.to_be_bytes().to_vec()),
                typed_annotation("ratio", DOUBLE, 0.25_f64.to_be_bytes().to_vec()),
                typed_annotation("flag", testkit::ANNOTATION_BOOL, vec![0]),
                typed_annotation("raw", testkit::ANNOTATION_BYTES, vec![0xde, 0xad]),
                typed_annotation("truncated", testkit::ANNOTATION_I64, vec![1, 2]),
                typed_annotation("mystery", 42, vec![7]),
                typed_annotation("text", testkit::ANNOTATION_STRING, b"0.192".to_vec()),
            ],
            ..Fixture::default()
        });
        assert_eq!(span.tag("short"), Some(&TagValue::Int(-2)));
        assert_eq!(span.tag("int"), Some(&TagValue::Int(70_000)));
        assert_eq!(span.tag("ratio"), Some(&TagValue::Float(0.25)));
        assert_eq!(span.tag("flag"), Some(&TagValue::Bool(false)));
        assert_eq!(span.tag("raw"), Some(&TagValue::Bytes(vec![0xde, 0xad])));
        assert_eq!(span.tag("truncated"), Some(&TagValue::Bytes(vec![1, 2])));
        assert_eq!(span.tag("mystery"), Some(&TagValue::Bytes(vec![7])));
        assert_eq!(span.tag("text"), Some(&TagValue::Float(0.192)));
    }

    #[test]
    fn truncated_payload_yields_no_spans() {
        let payload = sample_thrift_payload();
        for cut in [1, 5, 40, payload.len() / 2, payload.len() - 1] {
            let err = decode_thrift(&payload[..cut]).unwrap_err();
            assert!(matches!(err, SpanProxyError::Decode(_)), "cut at {cut}");
        }
        assert!(decode_thrift(&[]).is_err());
    }

    #[test]
    fn rejects_non_struct_lists() {
        // list<i32> with one element
        let payload = [0x08, 0, 0, 0, 1, 0, 0, 0, 7];
        assert!(decode_thrift(&payload).is_err());
    }

    #[test]
    fn negative_lengths_do_not_allocate() {
        // one span whose name claims a length of -1
        let payload = [0x0c, 0, 0, 0, 1, 0x0b, 0, 3, 0xff, 0xff, 0xff, 0xff];
        assert!(decode_thrift(&payload).is_err());

        // a name claiming far more bytes than the buffer holds
        let payload = [0x0c, 0, 0, 0, 1, 0x0b, 0, 3, 0x7f, 0xff, 0xff, 0xff, b'a'];
        assert!(decode_thrift(&payload).is_err());
    }

    #[test]
    fn negative_list_size_is_empty() {
        let payload = [0x0c, 0xff, 0xff, 0xff, 0xff];
        assert!(decode_thrift(&payload).unwrap().is_empty());
    }

    #[test]
    fn skips_unknown_fields() {
        // span { 1: trace_id, 2: i32 (unknown), 4: id, 3: name as i32 (wrong type) }
        let mut payload = vec![0x0c, 0, 0, 0, 1];
        payload.extend([0x0a, 0, 1]);
        payload.extend(26_i64.to_be_bytes());
        payload.extend([0x08, 0, 2]);
        payload.extend(5_i32.to_be_bytes());
        payload.extend([0x0a, 0, 4]);
        payload.extend(27_i64.to_be_bytes());
        payload.extend([0x08, 0, 3]);
        payload.extend(9_i32.to_be_bytes());
        payload.push(0x00);

        let spans = decode_thrift(&payload).unwrap();
        assert_eq!(spans[0].trace_id, "1a");
        assert_eq!(spans[0].span_id, "1b");
        assert_eq!(spans[0].name, "");
    }
}
