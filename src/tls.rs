//! Certificate plumbing for the session listener. Clients must present
//! a certificate signed by one of the configured CAs; the leaf's SHA-256
//! fingerprint selects the session's capability profile.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig,
};
use sha2::{Digest, Sha256};

use crate::{
    config::TlsSettings,
    error::{BridgeError, Result},
};

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| BridgeError::Tls(format!("cannot open {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut reader).collect();
    let certs =
        certs.map_err(|err| BridgeError::Tls(format!("bad PEM in {}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(BridgeError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| BridgeError::Tls(format!("cannot open {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| BridgeError::Tls(format!("bad PEM in {}: {err}", path.display())))?
        .ok_or_else(|| BridgeError::Tls(format!("no private key in {}", path.display())))
}

/// Server config for the listener: our certificate plus mandatory
/// client-certificate verification against the configured CA roots.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<ServerConfig>> {
    if settings.ca.is_empty() {
        return Err(BridgeError::Tls(
            "client authentication requires at least one CA certificate".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    for path in &settings.ca {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|err| BridgeError::Tls(format!("bad CA in {}: {err}", path.display())))?;
        }
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| BridgeError::Tls(format!("client verifier: {err}")))?;

    let certs = load_certs(&settings.certificate)?;
    let key = load_key(&settings.key)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|err| BridgeError::Tls(format!("certificate/key mismatch: {err}")))?;
    Ok(Arc::new(config))
}

/// Lowercase hex SHA-256 over the DER encoding; the key of the
/// `[access.clients]` table.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn fingerprint_is_stable_lowercase_hex() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let fp = fingerprint(&cert);
        assert_eq!(fp.len(), 64);
        assert!(fp.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(&CertificateDer::from(vec![1u8, 2, 3])));
    }

    #[test]
    fn missing_certificate_file_is_a_tls_error() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, BridgeError::Tls(_)));
    }

    #[test]
    fn empty_pem_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a pem\n").unwrap();
        assert!(load_certs(file.path()).is_err());
    }
}
