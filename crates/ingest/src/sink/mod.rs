pub mod honeycomb;
pub mod stdout;

use spanproxy_core::Result;
use spanproxy_core::model::NormalizedSpan;
use tracing::warn;

pub use honeycomb::{HoneycombConfig, HoneycombSink};
pub use stdout::StdoutSink;

/// Consumer of decoded spans. `send` must not block on delivery.
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    fn send(&self, spans: &[NormalizedSpan]) -> Result<()>;
}

/// Hands every batch to each child sink in turn.
#[derive(Default)]
pub struct CompositeSink {
    sinks: Vec<Box<dyn Sink>>,
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: impl Sink + 'static) {
        self.sinks.push(Box::new(sink));
    }
}

impl Sink for CompositeSink {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn send(&self, spans: &[NormalizedSpan]) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.send(spans) {
                warn!(sink = sink.name(), error = %e, "sink rejected spans");
            }
        }
        Ok(())
    }
}
