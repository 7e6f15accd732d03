//! Configuration schema definitions for the xfront front-end.
//!
//! Every section deserializes with defaults, so a partial TOML file only needs
//! to name the values it overrides. Range checks are expressed with
//! `validator` attributes and run at load time; cross-field rules live in
//! [`crate::config::ConfigValidator`].
//!
//! Settings fall in two groups:
//! - startup-only: [`NetworkConfig`] and [`WorkerConfig`], read once when the
//!   listener is created
//! - live: [`LiveSettings`], which can be replaced at runtime through
//!   [`crate::config::LiveConfig`]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FrontendConfig {
    /// Listening sockets (startup only)
    #[validate(nested)]
    pub network: NetworkConfig,

    /// Session worker pool bounds (startup only)
    #[validate(nested)]
    pub workers: WorkerConfig,

    /// Limits and timeouts that can change while running
    #[validate(nested)]
    pub limits: LiveSettings,

    /// Front-end specific TLS material; takes precedence over the server's
    pub tls: TlsSettings,

    /// Id generation
    pub ids: IdConfig,

    /// Log output
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind expression, `host` or `host/namespace`
    ///
    /// # Examples
    /// - `"*"` - all interfaces
    /// - `"127.0.0.1"` - loopback only
    /// - `"eth0/blue"` - interface inside a network namespace
    #[validate(length(min = 1))]
    pub bind_address: String,

    /// TCP port; `0` lets the operating system choose
    pub port: u16,

    /// Local socket path; resolved from `XFRONT_UNIX_PORT` when unset
    pub socket: Option<PathBuf>,

    /// Optional secondary TCP listener
    pub secondary_port: Option<u16>,

    /// How long an address-in-use bind is retried, in seconds
    #[validate(range(max = 120))]
    pub port_open_timeout_secs: u64,

    /// Upper bound applied to the computed accept backlog
    #[validate(range(min = 1, max = 900))]
    pub backlog_bound: u32,

    /// How long startup waits for the database engine to become ready, in milliseconds
    #[validate(range(min = 100, max = 600_000))]
    pub engine_ready_timeout_ms: u64,
}

/// Session worker pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WorkerConfig {
    /// Upper bound on session worker threads
    #[validate(range(min = 1, max = 4096))]
    pub max_threads: u32,

    /// Pending task capacity before `post` starts refusing work
    #[validate(range(min = 1, max = 1_000_000))]
    pub queue_capacity: usize,
}

/// Limits and timeouts that take effect without a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LiveSettings {
    /// Maximum concurrent client connections
    #[validate(range(min = 1, max = 100_000))]
    pub max_connections: u32,

    /// Floor of the session worker pool
    #[validate(range(min = 1, max = 4096))]
    pub min_worker_threads: u32,

    /// Seconds an idle worker above the floor lingers before exiting
    #[validate(range(min = 1, max = 3600))]
    pub idle_worker_thread_timeout_secs: u64,

    /// Seconds an authenticated client may stay silent
    #[validate(range(min = 1, max = 2_147_483))]
    pub interactive_timeout_secs: u64,

    /// Largest accepted message, in bytes
    #[validate(range(min = 512, max = 1_073_741_824))]
    pub max_allowed_packet: u32,

    /// Seconds allowed to complete authentication
    #[validate(range(min = 1, max = 1_000_000_000))]
    pub connect_timeout_secs: u64,
}

/// TLS material as file paths and cipher settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Private key (PEM)
    pub ssl_key: Option<String>,
    /// Certificate chain (PEM)
    pub ssl_cert: Option<String>,
    /// Certificate authority file
    pub ssl_ca: Option<String>,
    /// Certificate authority directory
    pub ssl_capath: Option<String>,
    /// Permitted ciphers
    pub ssl_cipher: Option<String>,
    /// Certificate revocation list file
    pub ssl_crl: Option<String>,
    /// Certificate revocation list directory
    pub ssl_crlpath: Option<String>,
}

/// Id generation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    /// Cluster-unique prefix embedded in every generated document id
    pub document_id_unique_prefix: u16,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `xfront_server=debug`
    #[validate(length(min = 1))]
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "*".to_string(),
            port: 33060,
            socket: None,
            secondary_port: None,
            port_open_timeout_secs: 0,
            backlog_bound: 900,
            engine_ready_timeout_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    /// Address-in-use retry window.
    #[must_use]
    pub const fn port_open_timeout(&self) -> Duration {
        Duration::from_secs(self.port_open_timeout_secs)
    }

    /// Engine readiness deadline.
    #[must_use]
    pub const fn engine_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_ready_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_threads: 100, queue_capacity: 10_000 }
    }
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            min_worker_threads: 2,
            idle_worker_thread_timeout_secs: 60,
            interactive_timeout_secs: 28_800,
            max_allowed_packet: 64 * 1024 * 1024,
            connect_timeout_secs: 30,
        }
    }
}

impl LiveSettings {
    /// Idle worker reclamation delay.
    #[must_use]
    pub const fn idle_worker_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_worker_thread_timeout_secs)
    }

    /// Read timeout applied to authenticated clients.
    #[must_use]
    pub const fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }

    /// Authentication deadline.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl TlsSettings {
    /// Whether any TLS setting has been provided.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        [
            &self.ssl_key,
            &self.ssl_cert,
            &self.ssl_ca,
            &self.ssl_capath,
            &self.ssl_cipher,
            &self.ssl_crl,
            &self.ssl_crlpath,
        ]
        .iter()
        .any(|value| value.as_deref().is_some_and(|v| !v.is_empty()))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FrontendConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.bind_address, "*");
        assert_eq!(config.limits.max_connections, 100);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: FrontendConfig = toml::from_str(
            r#"
            [limits]
            max_connections = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.max_connections, 7);
        assert_eq!(config.limits.min_worker_threads, 2);
        assert_eq!(config.network.port, 33060);
    }

    #[test]
    fn test_range_validation_rejects_zero_connections() {
        let mut config = FrontendConfig::default();
        config.limits.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_settings_configured() {
        let mut tls = TlsSettings::default();
        assert!(!tls.is_configured());

        tls.ssl_cipher = Some(String::new());
        assert!(!tls.is_configured());

        tls.ssl_cert = Some("/etc/certs/server.pem".into());
        assert!(tls.is_configured());
    }

    #[test]
    fn test_log_format_serde() {
        let config: LoggingConfig = toml::from_str("format = \"json\"").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
    }
}
