//! Telemetry for the front-end: structured logging through `tracing`.

pub mod logging;

pub use logging::{init_logging, init_test_logging};
