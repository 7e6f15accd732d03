//! Configuration management for the xfront front-end
//!
//! - schema-driven configuration with validation
//! - layered loading (defaults, TOML file, `XFRONT_*` environment)
//! - live settings with change callbacks
//!
//! # Examples
//!
//! ```rust,no_run
//! use xfront_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load().expect("configuration");
//! println!("listening on {}:{}", config.network.bind_address, config.network.port);
//! ```

pub mod live;
pub mod loader;
pub mod schema;
pub mod validator;

pub use live::{ChangeCallback, LiveConfig, UpdateStats};
pub use loader::{ConfigLoader, DEFAULT_UNIX_SOCKET, UNIX_SOCKET_ENV};
pub use schema::*;
pub use validator::ConfigValidator;

use crate::Result;
use std::path::Path;

/// Load configuration from the default search paths and environment.
///
/// # Errors
/// See [`ConfigLoader::load`].
pub fn load_default() -> Result<FrontendConfig> {
    ConfigLoader::new().load()
}

/// Load configuration from a specific file.
///
/// # Errors
/// See [`ConfigLoader::load_from_file`].
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<FrontendConfig> {
    ConfigLoader::load_from_file(path)
}

/// Validate a configuration object.
///
/// # Errors
/// Returns the first violated rule.
pub fn validate(config: &FrontendConfig) -> Result<()> {
    ConfigValidator::validate(config)
}
