use std::io::Cursor;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use crate::TlsError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in PEM content
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let parsed = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if parsed.is_empty() {
        return Err(TlsError::Certificate(
            "No certificate found in PEM content".to_string(),
        ));
    }
    Ok(parsed)
}

/// Parse the first private key in PEM content
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TlsError::PrivateKey(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TlsError::PrivateKey("No private key found in PEM content".to_string()))
}

fn load_root_store_from_pem(pem_content: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs_from_pem(pem_content)? {
        root_store.add(cert).map_err(|e| {
            TlsError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

/// Build the API server's TLS config from PEM content.
///
/// With `client_ca_pem`, clients must present a certificate signed by that
/// CA (mutual TLS).
pub fn load_server_config(
    cert_pem: &str,
    key_pem: &str,
    client_ca_pem: Option<&str>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Tls(format!("Unsupported protocol versions: {}", e)))?;

    let builder = match client_ca_pem {
        Some(ca_pem) => {
            let root_store = load_root_store_from_pem(ca_pem)?;
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider())
                    .build()
                    .map_err(|e| {
                        TlsError::Tls(format!("Failed to build client verifier: {}", e))
                    })?;
            tracing::info!("Client certificates required for API connections");
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Tls(format!("Failed to build server config: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Convenience wrapper around [`load_server_config`]
pub fn tls_acceptor(
    cert_pem: &str,
    key_pem: &str,
    client_ca_pem: Option<&str>,
) -> Result<TlsAcceptor, TlsError> {
    load_server_config(cert_pem, key_pem, client_ca_pem).map(TlsAcceptor::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair, SanType};

    fn self_signed() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![SanType::DnsName("localhost".try_into().unwrap())];
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_server_config_without_client_auth() {
        let (cert, key) = self_signed();
        let config = load_server_config(&cert, &key, None).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_server_config_with_client_ca() {
        let (cert, key) = self_signed();
        let (ca, _) = self_signed();
        assert!(tls_acceptor(&cert, &key, Some(&ca)).is_ok());
    }

    #[test]
    fn test_rejects_missing_material() {
        let (cert, key) = self_signed();
        assert!(matches!(
            load_server_config("", &key, None),
            Err(TlsError::Certificate(_))
        ));
        assert!(matches!(
            load_server_config(&cert, &cert, None),
            Err(TlsError::PrivateKey(_))
        ));
        assert!(matches!(
            load_server_config(&cert, &key, Some("not pem")),
            Err(TlsError::Certificate(_))
        ));
    }
}
