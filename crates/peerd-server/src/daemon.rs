//! Wiring from a resolved configuration to running components

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_rustls::TlsAcceptor;

use peerd_core::{PeerManager, PeerStore, ProcessRunner, Renderer, SystemApplier, Validator};

use crate::api::ApiPlane;
use crate::auth::BearerAuth;
use crate::config::{ResolvedApiConfig, ResolvedServerConfig};

/// Load the registry and assemble the peer manager.
///
/// A registry file that exists but cannot be read is an error; the daemon
/// must not start with an empty view of peers it already configured.
pub fn build_manager(
    config: &ResolvedServerConfig,
    runner: Arc<dyn ProcessRunner>,
) -> Result<Arc<PeerManager>> {
    let store = PeerStore::load(&config.database)
        .with_context(|| format!("Failed to load peer registry {}", config.database.display()))?;

    let validator = Validator::new(config.asn_ranges.clone());
    let renderer = Renderer::new(config.local.clone(), config.templates.clone());
    let applier = SystemApplier::new(
        runner,
        config.init_system.clone(),
        config.system_paths.clone(),
        config.birdc.clone(),
    );

    Ok(PeerManager::new(store, validator, renderer, applier))
}

/// TLS acceptor for the API, if certificates are configured
pub fn build_tls_acceptor(api: &ResolvedApiConfig) -> Result<Option<TlsAcceptor>> {
    let Some(tls) = &api.tls else {
        tracing::info!("API TLS: disabled (plain HTTP)");
        return Ok(None);
    };

    let acceptor = peerd_common::tls_acceptor(
        &tls.cert_pem,
        &tls.key_pem,
        tls.client_ca_pem.as_deref(),
    )
    .context("Failed to load API TLS configuration")?;
    tracing::info!("API TLS: enabled");
    Ok(Some(acceptor))
}

/// Build the API plane with authentication and TLS from `api`
pub fn build_api(api: &ResolvedApiConfig, manager: Arc<PeerManager>) -> Result<Arc<ApiPlane>> {
    let auth = BearerAuth::new(&api.secret);
    if !auth.is_enabled() {
        tracing::warn!("API secret is empty, requests will not be authenticated");
    }
    let tls_acceptor = build_tls_acceptor(api)?;
    Ok(ApiPlane::new(manager, auth, tls_acceptor))
}

/// Addresses the API listens on
pub fn listen_addrs(api: &ResolvedApiConfig) -> Vec<SocketAddr> {
    api.listen_v4
        .map(IpAddr::V4)
        .into_iter()
        .chain(api.listen_v6.map(IpAddr::V6))
        .map(|ip| SocketAddr::new(ip, api.port))
        .collect()
}

/// Log every registered peer whose files are missing. Returns the count.
pub async fn report_drift(manager: &PeerManager) -> usize {
    let drift = manager.audit().await;
    for entry in &drift {
        let missing: Vec<String> = entry
            .missing
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        tracing::warn!(
            "Peer {} ({}) is registered but missing {}",
            entry.asn,
            entry.interface_name,
            missing.join(", ")
        );
    }
    if drift.is_empty() {
        tracing::info!("Registry matches configuration files on disk");
    }
    drift.len()
}
