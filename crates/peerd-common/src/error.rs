use thiserror::Error;

/// Errors building a TLS configuration
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Private key error: {0}")]
    PrivateKey(String),

    #[error("TLS error: {0}")]
    Tls(String),
}
