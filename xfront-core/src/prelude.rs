//! # Prelude
//!
//! Commonly used types from the xfront core library.

pub use crate::{
    config::{ConfigLoader, FrontendConfig, LiveConfig, LiveSettings},
    error::{Error, Result},
    ids::{DocumentIdAggregator, DocumentIdGenerator, IdVariables, PreparedStatementRegistry},
    runtime::{Scheduler, SchedulerMonitor, SchedulerOptions, WorkerLifecycle},
};
