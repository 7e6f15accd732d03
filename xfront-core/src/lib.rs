//! # xfront core
//!
//! Foundations shared by the xfront connection front-end:
//!
//! - [`config`]: schema, layered loading, validation and live settings
//! - [`error`]: error type and result alias
//! - [`runtime`]: the dynamic thread-pool [`runtime::Scheduler`]
//! - [`ids`]: document and prepared statement id generators
//! - [`telemetry`]: `tracing` subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xfront_core::{config::ConfigLoader, telemetry};
//!
//! let config = ConfigLoader::new().load()?;
//! telemetry::init_logging(&config.logging)?;
//! # Ok::<(), xfront_core::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod ids;
pub mod prelude;
pub mod runtime;
pub mod telemetry;

pub use crate::{
    config::FrontendConfig,
    error::{Error, Result},
};

/// Crate version, reported in startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
