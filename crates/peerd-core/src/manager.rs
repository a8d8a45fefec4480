//! Peer lifecycle orchestration
//!
//! Every operation holds the registry lock for its whole duration, including
//! the external commands run by the applier. A peer is inserted only after
//! it has been applied, so the database never names a peer whose system
//! state failed to come up.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::applier::SystemApplier;
use crate::error::PeerError;
use crate::model::{Asn, PeerRecord, Validator};
use crate::render::Renderer;
use crate::store::PeerStore;

/// A registered peer whose configuration files are missing on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub asn: Asn,
    pub interface_name: String,
    pub missing: Vec<PathBuf>,
}

/// Owns the registry and serializes every change to it
pub struct PeerManager {
    registry: Mutex<PeerStore>,
    validator: Validator,
    renderer: Renderer,
    applier: SystemApplier,
}

impl PeerManager {
    pub fn new(
        store: PeerStore,
        validator: Validator,
        renderer: Renderer,
        applier: SystemApplier,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(store),
            validator,
            renderer,
            applier,
        })
    }

    pub async fn add_peer(&self, peer: PeerRecord) -> Result<(), PeerError> {
        let mut registry = self.registry.lock().await;

        self.validator.validate(&peer)?;
        if registry.exists(peer.asn) {
            return Err(PeerError::AlreadyExists(peer.asn));
        }

        let port = self.renderer.listen_port(peer.asn);
        if let Some(owner) = registry
            .iter()
            .find(|p| self.renderer.listen_port(p.asn) == port)
        {
            return Err(PeerError::ListenPortInUse {
                port,
                owner: owner.asn,
            });
        }

        let rendered = self.renderer.render(&peer)?;
        if let Err(failure) = self
            .applier
            .apply(
                &rendered.interface_name,
                &rendered.tunnel_config,
                &rendered.routing_config,
            )
            .await
        {
            tracing::error!("Failed to apply AS{}: {}", peer.asn, failure);
            return Err(PeerError::ApplyFailed(failure));
        }

        let asn = peer.asn;
        if let Err(e) = registry.insert(peer) {
            // Not persisted, so the system side must go too
            tracing::error!("Failed to persist AS{}, retracting: {}", asn, e);
            if let Err(failure) = self.applier.retract(&rendered.interface_name).await {
                tracing::warn!("Retract of unpersisted AS{} incomplete: {}", asn, failure);
            }
            return Err(e.into());
        }

        tracing::info!(
            "Peer added: AS{} on {} (port {})",
            asn,
            rendered.interface_name,
            port
        );
        Ok(())
    }

    /// Remove a peer. The registry entry is dropped even when teardown
    /// reports a failure; that case returns [`PeerError::RetractFailed`].
    /// If the removal cannot be persisted the entry still leaves memory and
    /// a [`PeerError::Store`] is returned.
    pub async fn delete_peer(&self, asn: Asn) -> Result<PeerRecord, PeerError> {
        let mut registry = self.registry.lock().await;

        let interface_name = registry.get(asn)?.interface_name();
        let retracted = self.applier.retract(&interface_name).await;
        let record = match registry.remove(asn) {
            Ok(record) => record,
            Err(e) => {
                if let Err(failure) = &retracted {
                    tracing::error!(
                        "Teardown of AS{} ({}) incomplete: {}",
                        asn,
                        interface_name,
                        failure
                    );
                }
                tracing::error!("Failed to persist removal of AS{}: {}", asn, e);
                return Err(e.into());
            }
        };

        match retracted {
            Ok(()) => {
                tracing::info!("Peer deleted: AS{} ({})", asn, interface_name);
                Ok(record)
            }
            Err(failure) => {
                tracing::warn!(
                    "Peer deleted: AS{} ({}), teardown incomplete: {}",
                    asn,
                    interface_name,
                    failure
                );
                Err(PeerError::RetractFailed(failure))
            }
        }
    }

    pub async fn get_peer(&self, asn: Asn) -> Result<PeerRecord, PeerError> {
        let registry = self.registry.lock().await;
        Ok(registry.get(asn)?.clone())
    }

    pub async fn peer_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Compare the registry against the config files on disk
    pub async fn audit(&self) -> Vec<Drift> {
        let registry = self.registry.lock().await;
        let paths = self.applier.paths();

        registry
            .iter()
            .filter_map(|peer| {
                let interface_name = peer.interface_name();
                let missing: Vec<PathBuf> = [
                    paths.tunnel_config(&interface_name),
                    paths.routing_config(&interface_name),
                ]
                .into_iter()
                .filter(|path| !path.exists())
                .collect();

                (!missing.is_empty()).then(|| Drift {
                    asn: peer.asn,
                    interface_name,
                    missing,
                })
            })
            .collect()
    }

    /// Persist the registry, waiting for any in-flight operation first
    pub async fn flush(&self) -> Result<(), PeerError> {
        let registry = self.registry.lock().await;
        registry.flush()?;
        tracing::info!(
            "Flushed {} peer(s) to {}",
            registry.len(),
            registry.path().display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::applier::{InitSystem, SystemPaths};
    use crate::error::Stage;
    use crate::model::AsnRange;
    use crate::render::{LocalSettings, PortPrefix, Templates};
    use crate::testing::{FailMode, FakeRunner};

    const KEY: &str = "Yb0CYoJiyOX2PcHBH0IZyPl1Mxtd5CphWq0dw2Qnnx8=";
    const UNIT: &str = "wg-quick@dn4242421234";

    struct Fixture {
        dir: tempfile::TempDir,
        runner: Arc<FakeRunner>,
        manager: Arc<PeerManager>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_ranges(vec![AsnRange::DN42])
        }

        fn with_ranges(ranges: Vec<AsnRange>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let runner = FakeRunner::new();
            let manager = build(&dir, runner.clone(), ranges);
            Self {
                dir,
                runner,
                manager,
            }
        }

        fn db_path(&self) -> PathBuf {
            self.dir.path().join("peers.toml")
        }

        fn paths(&self) -> SystemPaths {
            self.manager.applier.paths().clone()
        }
    }

    fn build(
        dir: &tempfile::TempDir,
        runner: Arc<FakeRunner>,
        ranges: Vec<AsnRange>,
    ) -> Arc<PeerManager> {
        let store = PeerStore::load(dir.path().join("peers.toml")).unwrap();
        let renderer = Renderer::new(
            LocalSettings {
                private_key: KEY.to_string(),
                link_local: "fe80::1".to_string(),
                port_prefix: PortPrefix::new(2).unwrap(),
            },
            Templates::builtin(),
        );
        let applier = SystemApplier::new(
            runner,
            InitSystem::Systemd {
                systemctl: PathBuf::from("systemctl"),
            },
            SystemPaths {
                wireguard_dir: dir.path().join("wireguard"),
                bird_peers_dir: dir.path().join("bird"),
            },
            PathBuf::from("birdc"),
        );
        PeerManager::new(store, Validator::new(ranges), renderer, applier)
    }

    fn peer(asn: Asn) -> PeerRecord {
        PeerRecord {
            asn,
            wireguard_endpoint: "peer.example.net:51820".to_string(),
            wireguard_link_local: "fe80::beef".to_string(),
            wireguard_public_key: KEY.to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_get_delete_scenario() {
        let fx = Fixture::new();

        fx.manager.add_peer(peer(4_242_421_234)).await.unwrap();
        assert_eq!(
            fx.manager.get_peer(4_242_421_234).await.unwrap(),
            peer(4_242_421_234)
        );
        assert!(fx.runner.is_enabled(UNIT));

        assert!(matches!(
            fx.manager.add_peer(peer(4_242_421_234)).await,
            Err(PeerError::AlreadyExists(4_242_421_234))
        ));
        assert!(matches!(
            fx.manager.delete_peer(4_242_421_235).await,
            Err(PeerError::NotFound(4_242_421_235))
        ));

        let removed = fx.manager.delete_peer(4_242_421_234).await.unwrap();
        assert_eq!(removed, peer(4_242_421_234));
        assert!(matches!(
            fx.manager.get_peer(4_242_421_234).await,
            Err(PeerError::NotFound(_))
        ));
        assert!(!fx.runner.is_active(UNIT));
        assert!(!fx.paths().tunnel_config("dn4242421234").exists());
    }

    #[tokio::test]
    async fn test_second_add_has_no_side_effects() {
        let fx = Fixture::new();
        fx.manager.add_peer(peer(4_242_421_234)).await.unwrap();
        let calls = fx.runner.call_count();

        let err = fx.manager.add_peer(peer(4_242_421_234)).await.unwrap_err();
        assert!(matches!(err, PeerError::AlreadyExists(_)));
        assert_eq!(fx.runner.call_count(), calls);
        assert_eq!(fx.runner.count("start"), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_runs_nothing() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.manager.delete_peer(4_242_420_001).await,
            Err(PeerError::NotFound(4_242_420_001))
        ));
        assert_eq!(fx.runner.call_count(), 0);
        assert!(!fx.db_path().exists());
    }

    #[tokio::test]
    async fn test_invalid_input_runs_nothing() {
        let fx = Fixture::new();
        let mut p = peer(4_242_421_234);
        p.wireguard_public_key = "abc123==".to_string();

        let err = fx.manager.add_peer(p).await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::InvalidInput {
                field: "wireguard_public_key",
                ..
            }
        ));
        assert_eq!(fx.runner.call_count(), 0);
        assert_eq!(fx.manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_apply_failure_leaves_registry_untouched() {
        let fx = Fixture::new();
        fx.runner.fail_on("configure", FailMode::exit(1, "bird: syntax error"));

        let err = fx.manager.add_peer(peer(4_242_421_234)).await.unwrap_err();
        match err {
            PeerError::ApplyFailed(failure) => assert_eq!(failure.stage, Stage::Reload),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(fx.manager.peer_count().await, 0);
        assert!(!fx.db_path().exists());
        assert!(!fx.paths().tunnel_config("dn4242421234").exists());
        assert!(!fx.runner.is_enabled(UNIT));

        // Same peer goes through once the system recovers
        fx.runner.clear_failures();
        fx.manager.add_peer(peer(4_242_421_234)).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_apply_failure() {
        let fx = Fixture::new();
        fx.runner.fail_on("start", FailMode::TimedOut);

        match fx.manager.add_peer(peer(4_242_421_234)).await {
            Err(PeerError::ApplyFailed(failure)) => {
                assert_eq!(failure.stage, Stage::Start);
                assert!(failure.source.is_timeout());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retract_failure_still_removes_peer() {
        let fx = Fixture::new();
        fx.manager.add_peer(peer(4_242_421_234)).await.unwrap();
        fx.runner.fail_on("disable", FailMode::exit(1, "Failed to disable unit"));

        let err = fx.manager.delete_peer(4_242_421_234).await.unwrap_err();
        match err {
            PeerError::RetractFailed(failure) => assert_eq!(failure.stage, Stage::Disable),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(
            fx.manager.get_peer(4_242_421_234).await,
            Err(PeerError::NotFound(_))
        ));
        assert!(PeerStore::load(fx.db_path()).unwrap().is_empty());
        assert!(!fx.paths().routing_config("dn4242421234").exists());
    }

    #[tokio::test]
    async fn test_listen_port_collision_rejected() {
        let fx = Fixture::with_ranges(vec![
            AsnRange::DN42,
            AsnRange::new(4_242_430_000, 4_242_439_999),
        ]);
        fx.manager.add_peer(peer(4_242_421_234)).await.unwrap();
        let calls = fx.runner.call_count();

        let err = fx.manager.add_peer(peer(4_242_431_234)).await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::ListenPortInUse {
                port: 21_234,
                owner: 4_242_421_234
            }
        ));
        assert_eq!(fx.runner.call_count(), calls);
    }

    #[tokio::test]
    async fn test_persist_failure_retracts() {
        let fx = Fixture::new();
        // Occupy the database path with a directory so the rename fails
        std::fs::create_dir(fx.db_path()).unwrap();
        std::fs::write(fx.db_path().join("occupied"), "x").unwrap();

        let err = fx.manager.add_peer(peer(4_242_421_234)).await.unwrap_err();
        assert!(matches!(err, PeerError::Store(_)));
        assert_eq!(fx.manager.peer_count().await, 0);
        assert!(!fx.runner.is_active(UNIT));
        assert!(!fx.runner.is_enabled(UNIT));
        assert!(!fx.paths().tunnel_config("dn4242421234").exists());
    }

    #[tokio::test]
    async fn test_persist_failure_on_delete_keeps_peer_out() {
        let fx = Fixture::new();
        fx.manager.add_peer(peer(4_242_421_234)).await.unwrap();
        fx.manager.add_peer(peer(4_242_420_001)).await.unwrap();

        std::fs::remove_file(fx.db_path()).unwrap();
        std::fs::create_dir(fx.db_path()).unwrap();
        std::fs::write(fx.db_path().join("occupied"), "x").unwrap();

        let err = fx.manager.delete_peer(4_242_421_234).await.unwrap_err();
        assert!(matches!(err, PeerError::Store(_)));
        assert!(matches!(
            fx.manager.get_peer(4_242_421_234).await,
            Err(PeerError::NotFound(_))
        ));
        assert!(!fx.runner.is_active(UNIT));
        assert!(!fx.paths().tunnel_config("dn4242421234").exists());

        // The next write catches the database up with memory
        std::fs::remove_dir_all(fx.db_path()).unwrap();
        fx.manager.flush().await.unwrap();
        let store = PeerStore::load(fx.db_path()).unwrap();
        assert!(!store.exists(4_242_421_234));
        assert!(store.exists(4_242_420_001));
    }

    #[tokio::test]
    async fn test_render_failure_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let store = PeerStore::load(dir.path().join("peers.toml")).unwrap();
        let renderer = Renderer::new(
            LocalSettings {
                private_key: KEY.to_string(),
                link_local: "fe80::1".to_string(),
                port_prefix: PortPrefix::new(2).unwrap(),
            },
            Templates::parse("{{ peer_endpoint.host }}", crate::DEFAULT_BIRD_TEMPLATE).unwrap(),
        );
        let applier = SystemApplier::new(
            runner.clone(),
            InitSystem::Systemd {
                systemctl: PathBuf::from("systemctl"),
            },
            SystemPaths {
                wireguard_dir: dir.path().join("wireguard"),
                bird_peers_dir: dir.path().join("bird"),
            },
            PathBuf::from("birdc"),
        );
        let manager = PeerManager::new(store, Validator::default(), renderer, applier);

        let err = manager.add_peer(peer(4_242_421_234)).await.unwrap_err();
        assert!(matches!(err, PeerError::Render(_)));
        assert_eq!(runner.call_count(), 0);
        assert_eq!(manager.peer_count().await, 0);
        assert!(!dir.path().join("wireguard").exists());
    }

    #[tokio::test]
    async fn test_operations_are_serialized() {
        let fx = Fixture::new();
        fx.runner.set_delay(Some(Duration::from_millis(5)));

        let a = fx.manager.clone();
        let b = fx.manager.clone();
        let c = fx.manager.clone();
        let (ra, rb, rc) = tokio::join!(
            tokio::spawn(async move { a.add_peer(peer(4_242_420_001)).await }),
            tokio::spawn(async move { b.add_peer(peer(4_242_420_002)).await }),
            tokio::spawn(async move { c.get_peer(4_242_420_001).await.ok() }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();
        rc.unwrap();

        assert_eq!(fx.runner.max_concurrency(), 1);
        assert_eq!(fx.manager.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_registry_survives_restart() {
        let fx = Fixture::new();
        fx.manager.add_peer(peer(4_242_420_002)).await.unwrap();
        fx.manager.add_peer(peer(4_242_420_001)).await.unwrap();
        fx.runner.fail_on("start", FailMode::exit(1, "boom"));
        let _ = fx.manager.add_peer(peer(4_242_420_003)).await;
        fx.manager.flush().await.unwrap();

        let restarted = build(&fx.dir, FakeRunner::new(), vec![AsnRange::DN42]);
        assert_eq!(restarted.peer_count().await, 2);
        assert_eq!(
            restarted.get_peer(4_242_420_001).await.unwrap(),
            peer(4_242_420_001)
        );
        assert!(matches!(
            restarted.get_peer(4_242_420_003).await,
            Err(PeerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_audit_reports_missing_files() {
        let fx = Fixture::new();
        fx.manager.add_peer(peer(4_242_420_001)).await.unwrap();
        fx.manager.add_peer(peer(4_242_420_002)).await.unwrap();
        assert!(fx.manager.audit().await.is_empty());

        let routing = fx.paths().routing_config("dn4242420002");
        std::fs::remove_file(&routing).unwrap();

        let drift = fx.manager.audit().await;
        assert_eq!(
            drift,
            vec![Drift {
                asn: 4_242_420_002,
                interface_name: "dn4242420002".to_string(),
                missing: vec![routing],
            }]
        );
    }
}
