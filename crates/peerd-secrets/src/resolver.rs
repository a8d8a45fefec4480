//! Secret resolution dispatcher

use crate::error::SecretError;
use crate::uri::SecretUri;

/// Resolves secret references to their values
#[derive(Debug, Default)]
pub struct SecretResolver {
    _private: (),
}

impl SecretResolver {
    pub fn new() -> Self {
        Self { _private: () }
    }

    pub fn resolve(&self, uri: &SecretUri) -> Result<String, SecretError> {
        tracing::debug!("Resolving secret from {}", uri);

        match uri {
            SecretUri::Plain(value) => Ok(value.clone()),

            #[cfg(feature = "env")]
            SecretUri::Env { var_name } => crate::backends::env::resolve(var_name),

            #[cfg(not(feature = "env"))]
            SecretUri::Env { .. } => Err(SecretError::disabled("env")),

            #[cfg(feature = "file")]
            SecretUri::File { path } => crate::backends::file::resolve(path),

            #[cfg(not(feature = "file"))]
            SecretUri::File { .. } => Err(SecretError::disabled("file")),

            #[cfg(feature = "base64")]
            SecretUri::Base64 { data } => crate::backends::base64::resolve(data),

            #[cfg(not(feature = "base64"))]
            SecretUri::Base64 { .. } => Err(SecretError::disabled("base64")),
        }
    }

    /// Resolve and trim surrounding whitespace (trailing newlines in files)
    pub fn resolve_trimmed(&self, uri: &SecretUri) -> Result<String, SecretError> {
        self.resolve(uri).map(|s| s.trim().to_string())
    }

    /// Like [`resolve_trimmed`](Self::resolve_trimmed), but an empty result
    /// is an error
    pub fn resolve_required(&self, uri: &SecretUri) -> Result<String, SecretError> {
        let value = self.resolve_trimmed(uri)?;
        if value.is_empty() {
            return Err(SecretError::Empty {
                backend: uri.backend_name(),
            });
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_plain() {
        let resolver = SecretResolver::new();
        let uri = SecretUri::Plain("my-secret".to_string());
        assert_eq!(resolver.resolve(&uri).unwrap(), "my-secret");
    }

    #[test]
    #[cfg(feature = "env")]
    fn test_resolve_env() {
        std::env::set_var("PEERD_TEST_RESOLVER_SECRET", "env-secret-value\n");
        let resolver = SecretResolver::new();
        let uri = SecretUri::Env {
            var_name: "PEERD_TEST_RESOLVER_SECRET".to_string(),
        };
        assert_eq!(resolver.resolve_trimmed(&uri).unwrap(), "env-secret-value");
        std::env::remove_var("PEERD_TEST_RESOLVER_SECRET");
    }

    #[test]
    #[cfg(feature = "file")]
    fn test_resolve_file_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  wg-private-key  ").unwrap();
        let uri = SecretUri::File {
            path: file.path().to_path_buf(),
        };
        let resolver = SecretResolver::new();
        assert_eq!(resolver.resolve_trimmed(&uri).unwrap(), "wg-private-key");
    }

    #[test]
    fn test_required_rejects_empty() {
        let resolver = SecretResolver::new();
        let err = resolver
            .resolve_required(&SecretUri::Plain("   ".to_string()))
            .unwrap_err();
        assert!(matches!(err, SecretError::Empty { backend: "plain" }));
    }
}
