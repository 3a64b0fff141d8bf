//! STARTTLS material
//!
//! Loads a PEM certificate chain and PKCS#8 key into a rustls server config
//! shared by every session. STARTTLS is only advertised when this loads.

use crate::config::SmtpConfig;
use crate::error::{GatewayError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Build from the `[smtp]` section; `None` unless both paths are set.
    pub fn from_smtp_config(config: &SmtpConfig) -> Result<Option<Self>> {
        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => Self::from_pem_files(cert, key).map(Some),
            (None, None) => Ok(None),
            _ => Err(GatewayError::Config(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            )),
        }
    }

    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| GatewayError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let certs = certs(&mut BufReader::new(cert_file))
            .map_err(|e| GatewayError::Tls(format!("Failed to read certificates: {}", e)))?;
        if certs.is_empty() {
            return Err(GatewayError::Tls("No certificates found in file".to_string()));
        }
        debug!("Loaded {} certificate(s)", certs.len());

        let key_file = File::open(key_path.as_ref())
            .map_err(|e| GatewayError::Tls(format!("Failed to open key file: {}", e)))?;
        let mut keys = pkcs8_private_keys(&mut BufReader::new(key_file))
            .map_err(|e| GatewayError::Tls(format!("Failed to read private keys: {}", e)))?;
        if keys.is_empty() {
            return Err(GatewayError::Tls("No private key found in file".to_string()));
        }

        // rustls 0.21 API
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                rustls::PrivateKey(keys.remove(0)),
            )
            .map_err(|e| GatewayError::Tls(format!("Failed to create TLS config: {}", e)))?;

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }
}

/// Self-signed certificate and key written to temp files, for tests.
#[cfg(test)]
pub(crate) fn self_signed_pem_files(domain: &str) -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
    let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
    let cert_file = tempfile::NamedTempFile::new().unwrap();
    let key_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(cert_file.path(), cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(key_file.path(), cert.serialize_private_key_pem()).unwrap();
    (cert_file, key_file)
}
