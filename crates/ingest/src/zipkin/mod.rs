//! Decoders from the Zipkin wire formats into [`NormalizedSpan`].
//!
//! Each decoder takes one complete request body and either returns every span
//! in it or fails as a whole.

pub mod endpoint;
pub mod json_v1;
pub mod json_v2;
pub mod thrift;

use spanproxy_core::Result;
use spanproxy_core::model::NormalizedSpan;

pub use self::json_v1::decode_json_v1;
pub use self::json_v2::decode_json_v2;
pub use self::thrift::decode_thrift;

pub const CONTENT_TYPE_THRIFT: &str = "application/x-thrift";
pub const CONTENT_TYPE_JSON: &str = "application/json";

pub type DecodeFn = fn(&[u8]) -> Result<Vec<NormalizedSpan>>;

/// Zipkin collector API version a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

/// Picks the decoder for a declared content type.
///
/// Parameters such as `charset` are ignored. Thrift is accepted on both API
/// versions; JSON follows the version.
pub fn decoder_for(content_type: &str, version: ApiVersion) -> Option<DecodeFn> {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if media_type.eq_ignore_ascii_case(CONTENT_TYPE_THRIFT) {
        return Some(decode_thrift);
    }
    if media_type.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
        return Some(match version {
            ApiVersion::V1 => decode_json_v1,
            ApiVersion::V2 => decode_json_v2,
        });
    }
    None
}
