use crate::error::{Error, Result};
use rustls_pki_types::ServerName;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Upstream certificate verifier that only checks signature well-formedness.
/// Chain and hostname validation are out of scope for the splice: the proxy
/// terminates the client leg itself and re-dials the server leg.
#[derive(Debug)]
struct NoVerifier {
    supported: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer,
        _intermediates: &[rustls_pki_types::CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// TLS material for splicing: the acceptor terminates the client-facing leg
/// with the operator-supplied certificate, the connector dials the real
/// server.
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let mut cert_reader = BufReader::new(std::fs::File::open(cert_path)?);
        let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(Error::from(format!("no certificates found in {}", cert_path.display())));
        }
        let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or_else(|| Error::from(format!("no private key found in {}", key_path.display())))?;

        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());

        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let connector = Self::permissive_connector(&provider)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector,
        })
    }

    fn permissive_connector(provider: &Arc<CryptoProvider>) -> Result<TlsConnector> {
        let verifier = NoVerifier {
            supported: provider.signature_verification_algorithms,
        };
        let client_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(TlsConnector::from(Arc::new(client_config)))
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }
}

/// SNI for an upstream leg dialed by address: the raw IP is used, there is no
/// hostname to offer.
pub fn server_name_for(addr: &SocketAddr) -> ServerName<'static> {
    ServerName::IpAddress(addr.ip().into())
}
