use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpanProxyError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("mirror error: {0}")]
    Mirror(String),

    #[error("ingest error: {0}")]
    Ingest(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SpanProxyError {
    pub fn decode(format: &str, err: impl std::fmt::Display) -> Self {
        Self::Decode(format!("{format}: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, SpanProxyError>;
