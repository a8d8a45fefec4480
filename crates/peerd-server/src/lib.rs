//! peerd daemon library
//!
//! Configuration, the authenticated HTTP API and the wiring that turns a
//! resolved configuration into a running peer manager. The `peerd` binary is
//! a thin wrapper; tests embed the same components.

mod api;
mod auth;
mod config;
mod daemon;

pub use api::ApiPlane;
pub use auth::{AuthDecision, BearerAuth};
pub use config::{
    ApiConfig, ApiTlsConfig, EnvironmentConfig, PathsConfig, PeerConfig, ResolvedApiConfig,
    ResolvedServerConfig, ResolvedTlsConfig, ServerConfig, TemplatesConfig,
};
pub use daemon::{build_api, build_manager, build_tls_acceptor, listen_addrs, report_drift};
