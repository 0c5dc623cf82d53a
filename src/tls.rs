//! Credential store and mutual-TLS configuration builder.
//!
//! Loads `CA.crt` plus a `<variant>.crt`/`<variant>.key` pair from a
//! directory and builds the matching `rustls` client or server config.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, Result};

/// Which named pair to load from the certificate directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// `agent.crt` / `agent.key` — server side, used by the RPC listener.
    Agent,
    /// `client.crt` / `client.key` — host side, used by `agentctl`.
    Client,
}

impl Variant {
    fn stem(self) -> &'static str {
        match self {
            Variant::Agent => "agent",
            Variant::Client => "client",
        }
    }
}

struct CredentialBundle {
    ca: Vec<CertificateDer<'static>>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

fn read_file(dir: &Path, name: &str) -> Result<Vec<u8>> {
    std::fs::read(dir.join(name))
        .map_err(|e| Error::config(format!("unable to read {name}: {e}")))
}

fn load_bundle(cert_dir: &Path, variant: Variant) -> Result<CredentialBundle> {
    let ca_pem = read_file(cert_dir, "CA.crt")?;
    let ca: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut ca_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::config(format!("malformed CA.crt: {e}")))?;
    if ca.is_empty() {
        return Err(Error::config("CA.crt contains no certificates"));
    }

    let crt_pem = read_file(cert_dir, &format!("{}.crt", variant.stem()))?;
    let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut crt_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::config(format!("malformed {}.crt: {e}", variant.stem())))?;
    if cert_chain.is_empty() {
        return Err(Error::config(format!(
            "{}.crt contains no certificates",
            variant.stem()
        )));
    }

    let key_pem = read_file(cert_dir, &format!("{}.key", variant.stem()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::config(format!("malformed {}.key: {e}", variant.stem())))?
        .ok_or_else(|| Error::config(format!("{}.key contains no private key", variant.stem())))?;

    Ok(CredentialBundle {
        ca,
        cert_chain,
        key,
    })
}

fn root_store(ca: &[CertificateDer<'static>]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in ca {
        store
            .add(cert.clone())
            .map_err(|e| Error::config(format!("invalid CA certificate: {e}")))?;
    }
    Ok(store)
}

/// Builds the mutual-TLS server config used by the RPC listener: TLS 1.2
/// minimum, ALPN `h2`, and client certificates required and verified against
/// the same CA pool used as root CAs.
pub fn server_config(cert_dir: &Path) -> Result<ServerConfig> {
    let bundle = load_bundle(cert_dir, Variant::Agent)?;
    let roots = Arc::new(root_store(&bundle.ca)?);

    let verifier = rustls::server::WebPkiClientVerifier::builder(roots)
        .build()
        .map_err(|e| Error::config(format!("client verifier setup failed: {e}")))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(bundle.cert_chain, bundle.key)
        .map_err(|e| Error::config(format!("invalid server keypair: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

/// Builds the client-side TLS config used by `agentctl` when dialing the
/// guest over `tcp:` or `cid:`. Server-certificate verification can be
/// disabled for the link-local TCP path since the guest's certificate is
/// self-signed; mutual TLS still authenticates the client.
pub fn client_config(cert_dir: &Path, verify_server: bool) -> Result<ClientConfig> {
    let bundle = load_bundle(cert_dir, Variant::Client)?;
    let roots = root_store(&bundle.ca)?;

    let builder = ClientConfig::builder();
    let mut config = if verify_server {
        builder
            .with_root_certificates(roots)
            .with_client_auth_cert(bundle.cert_chain, bundle.key)
            .map_err(|e| Error::config(format!("invalid client keypair: {e}")))?
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoServerVerification))
            .with_client_auth_cert(bundle.cert_chain, bundle.key)
            .map_err(|e| Error::config(format!("invalid client keypair: {e}")))?
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    config.resumption = rustls::client::Resumption::in_memory_sessions(256);
    Ok(config)
}

/// Certificate directory resolved from the CLI flag / `CERTDIR` env var.
pub fn resolve_cert_dir(configured: &Path) -> PathBuf {
    configured.to_path_buf()
}

#[derive(Debug)]
struct NoServerVerification;

impl rustls::client::danger::ServerCertVerifier for NoServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_dir_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_bundle(dir.path(), Variant::Agent).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
