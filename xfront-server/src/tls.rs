//! TLS negotiation.
//!
//! Front-end specific material wins over the engine's when any of it is
//! configured. Otherwise the engine's material is used if the engine has TLS
//! enabled. A configuration that fails to load is logged and the listener
//! keeps running without TLS.

use crate::engine::NetworkSettings;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{info, warn};
use xfront_core::config::TlsSettings;
use xfront_core::{Error, Result};

/// Where the effective TLS material came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSource {
    /// Front-end configuration
    Plugin,
    /// Engine-wide configuration
    Server,
    Disabled,
}

impl fmt::Display for TlsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin => write!(f, "plugin"),
            Self::Server => write!(f, "server"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Pick the TLS material to use.
#[must_use]
pub fn resolve_tls<'a>(
    plugin: &'a TlsSettings,
    server: &'a NetworkSettings,
) -> (TlsSource, Option<&'a TlsSettings>) {
    if plugin.is_configured() {
        (TlsSource::Plugin, Some(plugin))
    } else if server.have_tls {
        (TlsSource::Server, Some(&server.tls))
    } else {
        (TlsSource::Disabled, None)
    }
}

/// Outcome of TLS negotiation, kept by the server for the rest of its life.
#[derive(Clone)]
pub struct TlsContext {
    source: TlsSource,
    config: Option<Arc<ServerConfig>>,
}

impl TlsContext {
    #[must_use]
    pub const fn disabled() -> Self {
        Self { source: TlsSource::Disabled, config: None }
    }

    /// Resolve and load the TLS configuration. Never fails.
    #[must_use]
    pub fn establish(plugin: &TlsSettings, server: &NetworkSettings) -> Self {
        let (source, settings) = resolve_tls(plugin, server);
        let Some(settings) = settings else {
            info!("TLS disabled: no certificate configured");
            return Self::disabled();
        };

        match build_server_config(settings, server.tls_version.as_deref()) {
            Ok(config) => {
                info!(%source, "Using TLS configuration");
                Self { source, config: Some(Arc::new(config)) }
            },
            Err(e) => {
                warn!(%source, error = %e, "TLS setup failed, continuing without TLS");
                Self { source, config: None }
            },
        }
    }

    /// Source selected during negotiation, even if loading it failed.
    #[must_use]
    pub const fn source(&self) -> TlsSource {
        self.source
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.config.is_some()
    }

    #[must_use]
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.config.clone()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("source", &self.source)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Build a rustls server configuration from PEM files.
///
/// # Errors
/// Returns [`Error::Tls`] when a file cannot be read or parsed, or when no
/// permitted protocol version is left.
pub fn build_server_config(
    settings: &TlsSettings,
    tls_version: Option<&str>,
) -> Result<ServerConfig> {
    let cert_path = non_empty(settings.ssl_cert.as_deref())
        .ok_or_else(|| tls_error("no certificate file configured"))?;
    let key_path =
        non_empty(settings.ssl_key.as_deref()).ok_or_else(|| tls_error("no key file configured"))?;

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let versions = parse_versions(tls_version)?;

    if non_empty(settings.ssl_cipher.as_deref()).is_some() {
        warn!("ssl_cipher is ignored; the provider's default suites are used");
    }
    if non_empty(settings.ssl_capath.as_deref()).is_some()
        || non_empty(settings.ssl_crlpath.as_deref()).is_some()
    {
        warn!("ssl_capath and ssl_crlpath are not supported; use ssl_ca and ssl_crl");
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)
        .map_err(|e| tls_error(e.to_string()))?;

    let builder = match non_empty(settings.ssl_ca.as_deref()) {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert).map_err(|e| tls_error(format!("{ca_path}: {e}")))?;
            }
            let mut verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .allow_unauthenticated();
            if let Some(crl_path) = non_empty(settings.ssl_crl.as_deref()) {
                verifier = verifier.with_crls(load_crls(crl_path)?);
            }
            let verifier = verifier.build().map_err(|e| tls_error(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        },
        None => builder.with_no_client_auth(),
    };

    builder.with_single_cert(certs, key).map_err(|e| tls_error(e.to_string()))
}

/// Protocol versions named in `TLSv1.2,TLSv1.3` form; all versions when unset.
fn parse_versions(list: Option<&str>) -> Result<Vec<&'static SupportedProtocolVersion>> {
    let Some(list) = non_empty(list) else {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    };

    let mut versions = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name {
            "TLSv1.2" => versions.push(&rustls::version::TLS12),
            "TLSv1.3" => versions.push(&rustls::version::TLS13),
            other => warn!(version = other, "Unsupported TLS version ignored"),
        }
    }

    if versions.is_empty() {
        return Err(tls_error(format!("no supported TLS version in '{list}'")));
    }
    Ok(versions)
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| tls_error(format!("{path}: {e}")))?;
    if certs.is_empty() {
        return Err(tls_error(format!("{path}: no certificates found")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(format!("{path}: {e}")))?
        .ok_or_else(|| tls_error(format!("{path}: no private key found")))
}

fn load_crls(path: &str) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let mut reader = open(path)?;
    rustls_pemfile::crls(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| tls_error(format!("{path}: {e}")))
}

fn open(path: &str) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| tls_error(format!("{path}: {e}")))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::Tls { message: message.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_material(dir: &Path) -> TlsSettings {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        TlsSettings {
            ssl_cert: Some(cert_path.display().to_string()),
            ssl_key: Some(key_path.display().to_string()),
            ..TlsSettings::default()
        }
    }

    fn server_with_tls(tls: TlsSettings) -> NetworkSettings {
        NetworkSettings { have_tls: true, tls, ..NetworkSettings::default() }
    }

    #[test]
    fn test_plugin_settings_win() {
        let plugin = TlsSettings { ssl_cert: Some("p.pem".into()), ..TlsSettings::default() };
        let server =
            server_with_tls(TlsSettings { ssl_cert: Some("s.pem".into()), ..TlsSettings::default() });

        let (source, settings) = resolve_tls(&plugin, &server);
        assert_eq!(source, TlsSource::Plugin);
        assert_eq!(settings.and_then(|s| s.ssl_cert.as_deref()), Some("p.pem"));
    }

    #[test]
    fn test_server_settings_used_when_plugin_empty() {
        let server = server_with_tls(TlsSettings::default());
        let (source, _) = resolve_tls(&TlsSettings::default(), &server);
        assert_eq!(source, TlsSource::Server);
    }

    #[test]
    fn test_disabled_without_any_source() {
        let plugin = TlsSettings::default();
        let server = NetworkSettings::default();
        let (source, settings) = resolve_tls(&plugin, &server);
        assert_eq!(source, TlsSource::Disabled);
        assert!(settings.is_none());
    }

    #[test]
    fn test_establish_loads_generated_material() {
        let dir = TempDir::new().unwrap();
        let plugin = write_material(dir.path());

        let context = TlsContext::establish(&plugin, &NetworkSettings::default());
        assert_eq!(context.source(), TlsSource::Plugin);
        assert!(context.is_active());
    }

    #[test]
    fn test_broken_material_leaves_tls_off() {
        let plugin = TlsSettings {
            ssl_cert: Some("/nonexistent/cert.pem".into()),
            ssl_key: Some("/nonexistent/key.pem".into()),
            ..TlsSettings::default()
        };
        let context = TlsContext::establish(&plugin, &NetworkSettings::default());
        assert_eq!(context.source(), TlsSource::Plugin);
        assert!(!context.is_active());
    }

    #[test]
    fn test_version_list() {
        assert_eq!(parse_versions(Some("TLSv1.3")).unwrap().len(), 1);
        assert_eq!(parse_versions(Some("TLSv1.2, TLSv1.3")).unwrap().len(), 2);
        assert!(parse_versions(Some("TLSv1.0")).is_err());
        assert_eq!(parse_versions(None).unwrap().len(), rustls::ALL_VERSIONS.len());
    }
}
