//! End-to-end test utilities for peerd
//!
//! Runs the real API server in-process against a simulated host, so the
//! full request path can be exercised without root, WireGuard or BIRD.

pub mod certificates;
pub mod harness;

pub use certificates::{Identity, TestCertificates};
pub use harness::{TestServer, TestServerBuilder, LOCAL_PRIVATE_KEY};
