//! Secret references for peerd configuration
//!
//! Config values that carry key material (the API bearer secret, the local
//! WireGuard private key, TLS certificates and keys) are secret references
//! rather than raw strings:
//!
//! - **Environment variables** (`env://VAR_NAME`)
//! - **Files** (`file:///path` or just `/path`)
//! - **Inline base64** (`base64:<data>`)
//! - **Plain values**: anything else is the literal value
//!
//! # Example
//!
//! ```rust,ignore
//! use peerd_secrets::{SecretResolver, SecretUri};
//!
//! let uri: SecretUri = "file:///etc/peerd/wg.key".parse()?;
//! let key = SecretResolver::new().resolve_required(&uri)?;
//! ```
//!
//! # Features
//!
//! - `env` (default): environment variable support
//! - `file` (default): file reading support
//! - `base64` (default): inline base64 support

mod backends;
mod error;
mod resolver;
mod uri;

pub use error::SecretError;
pub use resolver::SecretResolver;
pub use uri::SecretUri;
