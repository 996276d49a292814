use serde::Deserialize;
use spanproxy_core::model::NormalizedSpan;

/// Network identity of the service that recorded a span or tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub ipv4: String,
    pub port: u16,
    pub service_name: String,
}

impl Endpoint {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.port == 0 && self.service_name.is_empty()
    }

    pub fn apply_to(self, span: &mut NormalizedSpan) {
        span.host_ipv4 = self.ipv4;
        span.port = self.port;
        span.service_name = self.service_name;
    }
}

/// Endpoint object as it appears in Zipkin JSON payloads.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonEndpoint {
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub service_name: Option<String>,
}

impl From<JsonEndpoint> for Endpoint {
    fn from(value: JsonEndpoint) -> Self {
        Self {
            ipv4: value.ipv4.unwrap_or_default(),
            port: value
                .port
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or_default(),
            service_name: value.service_name.unwrap_or_default(),
        }
    }
}

/// Keys naming the address of the other side of an RPC: client address,
/// server address, client send and server receive.
pub fn is_remote_designator(key: &str) -> bool {
    matches!(key, "ca" | "sa" | "cs" | "sr")
}

/// Running "last eligible endpoint wins" state for one span.
///
/// Callers offer binary annotations first and then annotations, each in
/// source order.
#[derive(Debug, Default)]
pub struct EndpointFold {
    current: Option<Endpoint>,
}

impl EndpointFold {
    pub fn offer(&mut self, key: &str, endpoint: Option<Endpoint>) {
        if is_remote_designator(key) {
            return;
        }
        if let Some(endpoint) = endpoint {
            self.current = Some(endpoint);
        }
    }

    pub fn apply_to(self, span: &mut NormalizedSpan) {
        if let Some(endpoint) = self.current {
            endpoint.apply_to(span);
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> Option<Endpoint> {
        self.current
    }
}
