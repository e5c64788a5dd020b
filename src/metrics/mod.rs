//! Performance metrics aggregation.

pub mod perf;

pub use perf::{MeanStdPair, PerfMetrics, RawPerfMetrics};
