//! TLS plumbing shared by the edge's client listener and the hub's control
//! listener: PEM loading and a server config that accepts (but does not
//! require) client certificates, so certificate hashes are available to
//! bans and `$hash` ACL groups.

use crate::blob::sha1_hex;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::server::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{self, Certificate, DistinguishedNames, PrivateKey};
use tokio_rustls::server::TlsStream;

pub fn load_certs<P: AsRef<Path>>(path: P) -> io::Result<Vec<Certificate>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid cert"))
        .map(|mut certs| certs.drain(..).map(Certificate).collect())
}

pub fn load_keys<P: AsRef<Path>>(path: P) -> io::Result<Vec<PrivateKey>> {
    let path = path.as_ref();

    let mut keys: Vec<PrivateKey> = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(path)?))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid key"))
        .map(|mut keys| keys.drain(..).map(PrivateKey).collect())?;

    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(File::open(path)?))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid key"))
            .map(|mut keys| keys.drain(..).map(PrivateKey).collect())?;
    }

    Ok(keys)
}

/// Clients may present any certificate; identity is the fingerprint, not a
/// chain to some authority.
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> Option<bool> {
        Some(false)
    }

    fn client_auth_root_subjects(&self) -> Option<DistinguishedNames> {
        Some(DistinguishedNames::new())
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: std::time::SystemTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }
}

pub fn server_config(certs: Vec<Certificate>, key: PrivateKey) -> Result<rustls::ServerConfig, rustls::Error> {
    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(certs, key)
}

/// Accepts any server certificate; for cluster-internal links and the test
/// client, where trust is the shared secret or the operator's eyes.
pub struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

pub fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// SHA-1 fingerprint of the client certificate, the identity Mumble tooling
/// exchanges in ACLs and bans.
pub fn peer_cert_hash(stream: &TlsStream<TcpStream>) -> Option<String> {
    let (_, connection) = stream.get_ref();

    connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| sha1_hex(&cert.0))
}
