/// Deterministic per-trace sampling.
///
/// The decision depends only on the numeric trace id, so every span of a
/// trace is kept or dropped together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSampler {
    rate: u32,
}

impl TraceSampler {
    pub fn new(rate: u32) -> Self {
        Self { rate: rate.max(1) }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn should_keep(&self, trace_id_numeric: i64) -> bool {
        if self.rate <= 1 {
            return true;
        }
        trace_id_numeric.rem_euclid(i64::from(self.rate)) == 0
    }
}

impl Default for TraceSampler {
    fn default() -> Self {
        Self::new(1)
    }
}
