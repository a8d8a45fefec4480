use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::error::SecretError;

/// Where a secret value comes from.
///
/// - `env://VAR_NAME`: environment variable
/// - `file:///path/to/file`, or a bare `/path`, `./path`, `../path`: file content
/// - `base64:<data>`: inline base64 (handy for PEM material in env vars)
/// - anything else: the literal value
///
/// A bare value ending in `=` is always a literal. WireGuard keys are base64
/// and may start with `/`, but always end in padding.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretUri {
    Plain(String),
    Env { var_name: String },
    File { path: PathBuf },
    Base64 { data: String },
}

impl SecretUri {
    pub fn is_plain(&self) -> bool {
        matches!(self, SecretUri::Plain(_))
    }

    /// An empty literal, as produced by an unset config value
    pub fn is_empty(&self) -> bool {
        matches!(self, SecretUri::Plain(value) if value.trim().is_empty())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            SecretUri::Plain(_) => "plain",
            SecretUri::Env { .. } => "env",
            SecretUri::File { .. } => "file",
            SecretUri::Base64 { .. } => "base64",
        }
    }
}

impl Default for SecretUri {
    fn default() -> Self {
        SecretUri::Plain(String::new())
    }
}

// Literal and inline values never reach logs
impl fmt::Display for SecretUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretUri::Plain(value) if value.is_empty() => f.write_str("<empty>"),
            SecretUri::Plain(_) => f.write_str("<literal>"),
            SecretUri::Env { var_name } => write!(f, "env://{}", var_name),
            SecretUri::File { path } => write!(f, "file://{}", path.display()),
            SecretUri::Base64 { .. } => f.write_str("base64:<inline>"),
        }
    }
}

impl fmt::Debug for SecretUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretUri({})", self)
    }
}

impl FromStr for SecretUri {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(var_name) = s.strip_prefix("env://") {
            if var_name.is_empty() {
                return Err(SecretError::invalid_uri(
                    s,
                    "env URI must specify a variable name",
                ));
            }
            Ok(SecretUri::Env {
                var_name: var_name.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SecretError::invalid_uri(s, "file URI must specify a path"));
            }
            Ok(SecretUri::File {
                path: PathBuf::from(path),
            })
        } else if let Some(data) = s.strip_prefix("base64:") {
            if data.trim().is_empty() {
                return Err(SecretError::invalid_uri(s, "base64 reference has no data"));
            }
            Ok(SecretUri::Base64 {
                data: data.trim().to_string(),
            })
        } else if looks_like_file_path(s) {
            Ok(SecretUri::File {
                path: PathBuf::from(s),
            })
        } else {
            Ok(SecretUri::Plain(s.to_string()))
        }
    }
}

fn looks_like_file_path(s: &str) -> bool {
    if s.ends_with('=') {
        return false;
    }
    s.starts_with('/')
        || s.starts_with("./")
        || s.starts_with("../")
        || s.ends_with(".pem")
        || s.ends_with(".crt")
        || s.ends_with(".key")
}

impl<'de> Deserialize<'de> for SecretUri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretUri::from_str(&s).map_err(serde::de::Error::custom)
    }
}
