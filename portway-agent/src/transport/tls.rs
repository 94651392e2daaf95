//! TLS transport using rustls

use super::BoxedStream;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone, Default)]
pub struct TlsTransportConfig {
    /// Server name for SNI and certificate verification. Defaults to the
    /// host part of the dial address.
    pub server_name: Option<String>,
    /// Extra CA certificate to trust (private deployments).
    pub ca_cert_path: Option<PathBuf>,
    /// Skip certificate verification (maps from `tls_verify: false`).
    pub skip_verify: bool,
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

/// A verifier that accepts any certificate (insecure, for self-signed certs)
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

pub fn create_client_config(config: &TlsTransportConfig) -> io::Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder();

    let client_config = if config.skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(ca_path) = &config.ca_cert_path {
            for cert in load_certs(ca_path)? {
                root_store.add(cert).map_err(|e| {
                    io::Error::new(ErrorKind::InvalidData, format!("invalid CA cert: {e}"))
                })?;
            }
        }
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(Arc::new(client_config))
}

pub async fn connect(addr: &str, config: &TlsTransportConfig) -> io::Result<BoxedStream> {
    let client_config = create_client_config(config)?;
    let connector = TlsConnector::from(client_config);

    let tcp_stream = TcpStream::connect(addr).await?;
    tcp_stream.set_nodelay(true)?;

    let host = config
        .server_name
        .clone()
        .unwrap_or_else(|| addr.split(':').next().unwrap_or("localhost").to_string());
    let server_name = ServerName::try_from(host)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, format!("invalid server name: {e}")))?;

    let tls_stream = connector.connect(server_name, tcp_stream).await?;
    Ok(Box::pin(tls_stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_with_webpki_roots() {
        let config = TlsTransportConfig::default();
        assert!(create_client_config(&config).is_ok());
    }

    #[test]
    fn test_client_config_skip_verify() {
        let config = TlsTransportConfig {
            skip_verify: true,
            ..Default::default()
        };
        assert!(create_client_config(&config).is_ok());
    }

    #[test]
    fn test_missing_ca_file_errors() {
        let config = TlsTransportConfig {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(create_client_config(&config).is_err());
    }
}
