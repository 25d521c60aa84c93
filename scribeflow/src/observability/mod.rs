//! Observability utilities.

mod logging;
mod spans;

pub use logging::{env_filter, init_tracing, LogFormat, DEFAULT_FILTER};
pub use spans::{run_span, stage_span, SpanTimer, StageSpanAttributes};
