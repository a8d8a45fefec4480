//! Secret backend implementations

#[cfg(feature = "base64")]
pub mod base64;

#[cfg(feature = "env")]
pub mod env;

#[cfg(feature = "file")]
pub mod file;
