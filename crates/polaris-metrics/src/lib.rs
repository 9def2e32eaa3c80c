//! # polaris-metrics
//!
//! Observability for the Polaris ledger.
//!
//! Consensus, acceptance, and snapshotting count their outcomes here:
//! round starts and failures, accepted blocks, tip conflicts, snapshot
//! attempts and I/O failures, plus write-latency histograms.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod histogram;
mod registry;

pub use histogram::Histogram;
pub use registry::{Metrics, MetricsSnapshot};

/// Macro for timing a block of code into a histogram, in milliseconds
#[macro_export]
macro_rules! timed_ms {
    ($metrics:expr, $name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        $metrics.histogram($name, start.elapsed().as_millis() as f64);
        result
    }};
}
