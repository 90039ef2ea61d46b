//! Logging and metrics helpers.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogConfig};
pub use metrics::EvalReport;
