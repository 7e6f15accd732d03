//! Error types for the xfront core library.

use thiserror::Error;

/// Main error type for xfront operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Malformed bind-address expression
    #[error("Invalid bind address: {message}")]
    BindAddress { message: String },

    /// Socket binding, accept or transport failures
    #[error("Network error: {message}")]
    Network { message: String },

    /// A dependency did not become available before the startup deadline
    #[error("Service not ready: {message}")]
    ServiceNotReady { message: String },

    /// The internal account exists but has no grants; they can be reapplied
    #[error("Missing permissions: {message}")]
    MissingPermissions { message: String },

    /// The internal account carries grants the front-end did not create
    #[error("Bad configuration: {message}")]
    BadConfiguration { message: String },

    /// TLS material could not be loaded
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// No server instance is installed in the handle
    #[error("Server instance is not initialized")]
    NotInitialized,

    /// The server instance is stopping or already stopped
    #[error("Server is shutting down")]
    ShuttingDown,

    /// Internal system errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for xfront operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Build a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Build an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Process exit code reported when this error aborts startup.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } | Self::BindAddress { .. } | Self::BadConfiguration { .. } => 1,
            Self::NotInitialized | Self::ShuttingDown => 3,
            _ => 2,
        }
    }

    /// Whether startup may continue after this error once it has been handled.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingPermissions { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Network { message: err.to_string() }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Configuration { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_non_zero() {
        let errors = [
            Error::configuration("bad"),
            Error::BindAddress { message: "/ns".into() },
            Error::network("refused"),
            Error::ServiceNotReady { message: "engine".into() },
            Error::BadConfiguration { message: "grants".into() },
            Error::NotInitialized,
            Error::internal("boom"),
        ];
        for err in &errors {
            assert_ne!(err.exit_code(), 0, "{err}");
        }
    }

    #[test]
    fn test_only_missing_permissions_is_recoverable() {
        assert!(Error::MissingPermissions { message: "x".into() }.is_recoverable());
        assert!(!Error::BadConfiguration { message: "x".into() }.is_recoverable());
    }

    #[test]
    fn test_io_error_maps_to_network() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use").into();
        assert!(matches!(err, Error::Network { .. }));
    }
}
