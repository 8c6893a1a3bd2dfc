//! Tracing and metrics shared by the proxy library and binary

pub mod config;
pub mod init;
pub mod metrics;

#[cfg(feature = "tracing-prometheus")]
pub mod prometheus;

pub use config::{InstrumentationConfig, LogFormat};

pub mod prelude {
    pub use crate::tracing::metrics::{Counter, Gauge, Histogram, Metrics};

    // Re-export common tracing macros and types
    pub use tracing::{Instrument, debug, error, info, instrument, trace, warn};
}
