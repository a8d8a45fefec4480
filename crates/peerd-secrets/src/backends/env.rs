//! Environment variable backend

use crate::error::SecretError;

pub fn resolve(var_name: &str) -> Result<String, SecretError> {
    std::env::var(var_name).map_err(|_| SecretError::EnvNotSet {
        var: var_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_var() {
        let result = resolve("PEERD_DEFINITELY_NOT_SET_31337");
        assert!(matches!(result, Err(SecretError::EnvNotSet { ref var }) if var == "PEERD_DEFINITELY_NOT_SET_31337"));
    }
}
