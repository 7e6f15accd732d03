//! # Configuration Validation
//!
//! Field ranges are checked by the `validator` derive on the schema; this
//! module adds the rules that span several fields.

use crate::{
    config::schema::{FrontendConfig, LiveSettings},
    Error, Result,
};
use tracing::{debug, warn};
use validator::Validate;

/// Configuration validator combining field and cross-field rules
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a full configuration.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first violated rule.
    pub fn validate(config: &FrontendConfig) -> Result<()> {
        debug!("Starting configuration validation");

        config.validate().map_err(Error::from)?;

        Self::validate_network(config)?;
        Self::validate_workers(config);

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    /// Validate settings submitted for live reconfiguration.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when a value is out of range.
    pub fn validate_live(settings: &LiveSettings) -> Result<()> {
        settings.validate().map_err(Error::from)
    }

    fn validate_network(config: &FrontendConfig) -> Result<()> {
        let network = &config.network;

        if network.bind_address.trim() != network.bind_address {
            return Err(Error::configuration(format!(
                "bind address '{}' must not contain surrounding whitespace",
                network.bind_address
            )));
        }

        if let Some(socket) = &network.socket {
            if socket.as_os_str().is_empty() {
                return Err(Error::configuration("local socket path must not be empty"));
            }
        }

        if let Some(secondary) = network.secondary_port {
            if secondary != 0 && secondary == network.port {
                return Err(Error::configuration(format!(
                    "secondary port {secondary} collides with the primary port"
                )));
            }
        }

        if network.port != 0 && network.port < 1024 {
            warn!("Using privileged port {} may require special permissions", network.port);
        }

        Ok(())
    }

    fn validate_workers(config: &FrontendConfig) {
        if config.limits.min_worker_threads > config.workers.max_threads {
            warn!(
                "min_worker_threads ({}) exceeds max_threads ({}); the pool floor will be clamped",
                config.limits.min_worker_threads, config.workers.max_threads
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_passes() {
        assert!(ConfigValidator::validate(&FrontendConfig::default()).is_ok());
    }

    #[test]
    fn test_secondary_port_collision() {
        let mut config = FrontendConfig::default();
        config.network.secondary_port = Some(config.network.port);
        assert!(matches!(ConfigValidator::validate(&config), Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_empty_socket_path_rejected() {
        let mut config = FrontendConfig::default();
        config.network.socket = Some(PathBuf::new());
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_whitespace_in_bind_address_rejected() {
        let mut config = FrontendConfig::default();
        config.network.bind_address = " 127.0.0.1".into();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_oversized_floor_is_only_a_warning() {
        let mut config = FrontendConfig::default();
        config.limits.min_worker_threads = 500;
        config.workers.max_threads = 10;
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_live_settings_validation() {
        let mut live = LiveSettings::default();
        assert!(ConfigValidator::validate_live(&live).is_ok());
        live.max_allowed_packet = 1;
        assert!(ConfigValidator::validate_live(&live).is_err());
    }
}
