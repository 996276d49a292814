pub mod span;
pub mod tag;

pub use span::NormalizedSpan;
pub use tag::TagValue;
