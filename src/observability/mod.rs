//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, stderr)
//!     → metrics.rs (counters, gauges)
//!     → tracing.rs (request spans with correlation IDs)
//!
//! Consumers:
//!     → Log aggregation (stderr of every Frontend and Worker)
//!     → Metrics endpoint (Prometheus scrape, Frontend only)
//! ```

pub mod logging;
pub mod metrics;
pub mod tracing;
