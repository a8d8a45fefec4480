//! Peer registry and configuration-application engine
//!
//! Peers are WireGuard tunnels with a BGP session on top. This crate owns the
//! registry of peers, renders their tunnel and BIRD configuration, and brings
//! that configuration up or down on the host:
//!
//! - [`PeerStore`]: the persisted registry
//! - [`Renderer`]: peer record to config text, no I/O
//! - [`SystemApplier`]: file writes, service control and BIRD reloads
//! - [`PeerManager`]: serializes add/delete/get over the pieces above

mod applier;
mod error;
mod manager;
mod model;
mod render;
mod runner;
mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use applier::{InitSystem, SystemApplier, SystemPaths};
pub use error::{PeerError, Stage, StepError, StepFailure, StoreError};
pub use manager::{Drift, PeerManager};
pub use model::{
    interface_name, is_link_local, is_valid_endpoint, is_valid_public_key, Asn, AsnRange,
    PeerRecord, Validator, INTERFACE_PREFIX, MAX_INTERFACE_NAME_LEN,
};
pub use render::{
    LocalSettings, PortPrefix, RenderedConfig, Renderer, TemplateError, Templates,
    DEFAULT_BIRD_TEMPLATE, DEFAULT_WIREGUARD_TEMPLATE, TEMPLATE_VARIABLES,
};
pub use runner::{CommandOutput, ProcessRunner, RunError, SystemRunner};
pub use store::PeerStore;
