mod error;
mod tls;

pub use error::TlsError;
pub use tls::{load_certs_from_pem, load_private_key_from_pem, load_server_config, tls_acceptor};
