use std::io::Write;
use std::sync::Mutex;

use spanproxy_core::model::NormalizedSpan;
use spanproxy_core::{Result, SpanProxyError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::error;

use super::Sink;

/// Writes each span as one JSON line.
pub struct StdoutSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    /// Writes synchronously. On a multi-threaded runtime the write is moved
    /// off the async worker with `block_in_place`.
    fn send(&self, spans: &[NormalizedSpan]) -> Result<()> {
        let on_worker = Handle::try_current()
            .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
        if on_worker {
            tokio::task::block_in_place(|| self.write_lines(spans))
        } else {
            self.write_lines(spans)
        }
    }
}

impl StdoutSink {
    fn write_lines(&self, spans: &[NormalizedSpan]) -> Result<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| SpanProxyError::Internal("stdout writer poisoned".into()))?;
        for span in spans {
            let line = match serde_json::to_string(span) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, span_id = %span.span_id, "failed to serialize span");
                    continue;
                }
            };
            writeln!(out, "{line}").map_err(|e| SpanProxyError::Io(e.to_string()))?;
        }
        out.flush().map_err(|e| SpanProxyError::Io(e.to_string()))
    }
}
