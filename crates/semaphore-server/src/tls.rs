//! TLS material: PEM loading and development self-signed certificates.

use semaphore_core::{RelayError, RelayResult};
use std::path::{Path, PathBuf};
use tracing::info;

/// Load a rustls server configuration from PEM cert/key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> RelayResult<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| RelayError::Config(format!("cannot read cert {}: {e}", cert_path.display())))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| RelayError::Config(format!("cannot read key {}: {e}", key_path.display())))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RelayError::Config(format!("invalid certificate PEM: {e}")))?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| RelayError::Config(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| RelayError::Config("no private key found in PEM".into()))?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Config(format!("TLS configuration rejected: {e}")))?;

    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Make sure a self-signed certificate exists for development use.
///
/// Resolves missing paths to `~/.semaphore/{cert,key}.pem`, reuses files
/// that are already on disk, and otherwise generates a fresh certificate for
/// the loopback names.
pub fn ensure_self_signed_cert(
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
) -> RelayResult<(PathBuf, PathBuf)> {
    let state_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".semaphore");

    let cert_path = cert_path.unwrap_or_else(|| state_dir.join("cert.pem"));
    let key_path = key_path.unwrap_or_else(|| state_dir.join("key.pem"));

    if cert_path.exists() && key_path.exists() {
        info!(cert = %cert_path.display(), "reusing existing certificate");
        return Ok((cert_path, key_path));
    }

    if let Some(parent) = cert_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RelayError::Config(format!("cannot create {}: {e}", parent.display())))?;
    }

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])
    .map_err(|e| RelayError::Config(format!("certificate parameters rejected: {e}")))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "semaphore dev cert");

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| RelayError::Config(format!("key generation failed: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| RelayError::Config(format!("certificate generation failed: {e}")))?;

    std::fs::write(&cert_path, cert.pem())
        .map_err(|e| RelayError::Config(format!("cannot write {}: {e}", cert_path.display())))?;
    std::fs::write(&key_path, key_pair.serialize_pem())
        .map_err(|e| RelayError::Config(format!("cannot write {}: {e}", key_path.display())))?;

    Ok((cert_path, key_path))
}
