use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::Asn;
use crate::render::TemplateError;

/// A single side effect performed by the applier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    WriteTunnelConfig,
    WriteRoutingConfig,
    Start,
    Enable,
    Reload,
    Disable,
    Stop,
    RemoveRoutingConfig,
    RemoveTunnelConfig,
    /// OpenRC per-interface service link
    RemoveServiceLink,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::WriteTunnelConfig => "write-tunnel-config",
            Stage::WriteRoutingConfig => "write-routing-config",
            Stage::Start => "start",
            Stage::Enable => "enable",
            Stage::Reload => "reload",
            Stage::Disable => "disable",
            Stage::Stop => "stop",
            Stage::RemoveRoutingConfig => "remove-routing-config",
            Stage::RemoveTunnelConfig => "remove-tunnel-config",
            Stage::RemoveServiceLink => "remove-service-link",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one step failed
#[derive(Debug, Error)]
pub enum StepError {
    #[error("`{command}` exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {after:?}")]
    TimedOut { command: String, after: Duration },

    #[error("failed to execute `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StepError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StepError::TimedOut { .. })
    }
}

/// A failed step together with the stage it belongs to
#[derive(Debug, Error)]
#[error("stage {stage}: {source}")]
pub struct StepFailure {
    pub stage: Stage,
    #[source]
    pub source: StepError,
}

impl StepFailure {
    pub fn new(stage: Stage, source: StepError) -> Self {
        Self { stage, source }
    }
}

/// Errors from the persisted peer database
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("peer already exists: AS{0}")]
    AlreadyExists(Asn),

    #[error("peer not found: AS{0}")]
    NotFound(Asn),

    #[error("peer database {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("failed to write peer database {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode peer database: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Errors surfaced by peer manager operations
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("Peer already exists: AS{0}")]
    AlreadyExists(Asn),

    #[error("Listen port {port} is already used by AS{owner}")]
    ListenPortInUse { port: u16, owner: Asn },

    #[error("Peer not found: AS{0}")]
    NotFound(Asn),

    /// Nothing was applied
    #[error("Failed to render config: {0}")]
    Render(#[from] TemplateError),

    #[error("Failed to apply config at {0}")]
    ApplyFailed(StepFailure),

    /// The peer has been removed from the registry regardless
    #[error("Peer removed, but teardown failed at {0}")]
    RetractFailed(StepFailure),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl PeerError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for PeerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(asn) => PeerError::AlreadyExists(asn),
            StoreError::NotFound(asn) => PeerError::NotFound(asn),
            other => PeerError::Store(other),
        }
    }
}
