//! Realizes rendered peer configuration on the host
//!
//! `apply` is fail-fast: the first failing step undoes everything done so
//! far, because a peer that is not yet registered must leave no trace.
//! `retract` is best-effort: every teardown step is attempted and the first
//! failure is reported afterwards, because a registered peer must always be
//! removable.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::error::{Stage, StepError, StepFailure};
use crate::runner::{CommandOutput, ProcessRunner, RunError};

/// Directories holding per-interface configuration files
#[derive(Debug, Clone)]
pub struct SystemPaths {
    pub wireguard_dir: PathBuf,
    pub bird_peers_dir: PathBuf,
}

impl SystemPaths {
    pub fn tunnel_config(&self, interface_name: &str) -> PathBuf {
        self.wireguard_dir.join(format!("{}.conf", interface_name))
    }

    pub fn routing_config(&self, interface_name: &str) -> PathBuf {
        self.bird_peers_dir.join(format!("{}.conf", interface_name))
    }
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            wireguard_dir: PathBuf::from("/etc/wireguard"),
            bird_peers_dir: PathBuf::from("/etc/bird/peers"),
        }
    }
}

/// Service manager used to run `wg-quick` per interface
#[derive(Debug, Clone)]
pub enum InitSystem {
    Systemd {
        systemctl: PathBuf,
    },
    /// Each interface gets a `wg-quick.<ifname>` link to the `wg-quick` init script
    OpenRc {
        rc_service: PathBuf,
        rc_update: PathBuf,
        init_dir: PathBuf,
    },
}

impl InitSystem {
    pub fn service_name(&self, interface_name: &str) -> String {
        match self {
            InitSystem::Systemd { .. } => format!("wg-quick@{}", interface_name),
            InitSystem::OpenRc { .. } => format!("wg-quick.{}", interface_name),
        }
    }

    /// Service link and the script it points at, for init systems that need one
    pub fn service_link(&self, interface_name: &str) -> Option<(PathBuf, PathBuf)> {
        match self {
            InitSystem::Systemd { .. } => None,
            InitSystem::OpenRc { init_dir, .. } => Some((
                init_dir.join(self.service_name(interface_name)),
                init_dir.join("wg-quick"),
            )),
        }
    }

    fn service_command(&self, verb: &str, interface_name: &str) -> Vec<String> {
        let service = self.service_name(interface_name);
        match self {
            InitSystem::Systemd { systemctl } => argv(systemctl, &[verb, &service]),
            InitSystem::OpenRc { rc_service, .. } => argv(rc_service, &[&service, verb]),
        }
    }

    fn start(&self, interface_name: &str) -> Vec<String> {
        self.service_command("start", interface_name)
    }

    fn stop(&self, interface_name: &str) -> Vec<String> {
        self.service_command("stop", interface_name)
    }

    fn enable(&self, interface_name: &str) -> Vec<String> {
        let service = self.service_name(interface_name);
        match self {
            InitSystem::Systemd { systemctl } => argv(systemctl, &["enable", &service]),
            InitSystem::OpenRc { rc_update, .. } => argv(rc_update, &["add", &service, "default"]),
        }
    }

    fn disable(&self, interface_name: &str) -> Vec<String> {
        let service = self.service_name(interface_name);
        match self {
            InitSystem::Systemd { systemctl } => argv(systemctl, &["disable", &service]),
            InitSystem::OpenRc { rc_update, .. } => argv(rc_update, &["del", &service, "default"]),
        }
    }

    fn active_query(&self, interface_name: &str) -> Vec<String> {
        let service = self.service_name(interface_name);
        match self {
            InitSystem::Systemd { systemctl } => {
                argv(systemctl, &["is-active", "--quiet", &service])
            }
            InitSystem::OpenRc { rc_service, .. } => argv(rc_service, &[&service, "status"]),
        }
    }

    fn enabled_query(&self, interface_name: &str) -> Vec<String> {
        match self {
            InitSystem::Systemd { systemctl } => argv(
                systemctl,
                &["is-enabled", "--quiet", &self.service_name(interface_name)],
            ),
            InitSystem::OpenRc { rc_update, .. } => argv(rc_update, &["show", "default"]),
        }
    }

    fn parse_enabled(&self, interface_name: &str, output: &CommandOutput) -> Option<bool> {
        match self {
            InitSystem::Systemd { .. } => Some(output.success()),
            InitSystem::OpenRc { .. } => {
                if !output.success() {
                    return None;
                }
                // Lines look like " wg-quick.dn4242421234 | default"
                let service = self.service_name(interface_name);
                Some(output.stdout.lines().any(|line| {
                    line.split('|').next().map(str::trim) == Some(service.as_str())
                }))
            }
        }
    }
}

impl fmt::Display for InitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitSystem::Systemd { .. } => f.write_str("systemd"),
            InitSystem::OpenRc { .. } => f.write_str("openrc"),
        }
    }
}

fn argv(program: &Path, args: &[&str]) -> Vec<String> {
    std::iter::once(program.display().to_string())
        .chain(args.iter().map(|a| a.to_string()))
        .collect()
}

/// How far a failed apply got before it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Progress {
    FilesWritten,
    Started,
    Enabled,
}

/// Sequences the side effects of adding and removing a peer
pub struct SystemApplier {
    runner: Arc<dyn ProcessRunner>,
    init: InitSystem,
    paths: SystemPaths,
    birdc: PathBuf,
}

impl SystemApplier {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        init: InitSystem,
        paths: SystemPaths,
        birdc: PathBuf,
    ) -> Self {
        Self {
            runner,
            init,
            paths,
            birdc,
        }
    }

    pub fn paths(&self) -> &SystemPaths {
        &self.paths
    }

    pub fn init_system(&self) -> &InitSystem {
        &self.init
    }

    /// Write both config files, bring the tunnel up, and reload BIRD
    pub async fn apply(
        &self,
        interface_name: &str,
        tunnel_config: &str,
        routing_config: &str,
    ) -> Result<(), StepFailure> {
        let tunnel_path = self.paths.tunnel_config(interface_name);
        let routing_path = self.paths.routing_config(interface_name);

        if let Err(e) = write_config(&tunnel_path, tunnel_config).await {
            discard(&tunnel_path).await;
            return Err(StepFailure::new(Stage::WriteTunnelConfig, e));
        }
        if let Err(e) = write_config(&routing_path, routing_config).await {
            discard(&routing_path).await;
            discard(&tunnel_path).await;
            return Err(StepFailure::new(Stage::WriteRoutingConfig, e));
        }

        if let Err(failure) = self.start(interface_name).await {
            self.roll_back(interface_name, Progress::FilesWritten).await;
            return Err(failure);
        }

        if let Err(failure) = self
            .exec(Stage::Enable, &self.init.enable(interface_name))
            .await
        {
            self.roll_back(interface_name, Progress::Started).await;
            return Err(failure);
        }

        if let Err(failure) = self.reload().await {
            self.roll_back(interface_name, Progress::Enabled).await;
            return Err(failure);
        }

        tracing::info!(
            "Applied {} ({} service {})",
            interface_name,
            self.init,
            self.init.service_name(interface_name)
        );
        Ok(())
    }

    /// Tear down everything belonging to an interface. Steps whose goal is
    /// already met (service stopped, file absent) count as successful.
    pub async fn retract(&self, interface_name: &str) -> Result<(), StepFailure> {
        let mut first_failure = None;

        if self.is_enabled(interface_name).await != Some(false) {
            let result = self
                .exec(Stage::Disable, &self.init.disable(interface_name))
                .await;
            note(&mut first_failure, interface_name, result.map(drop));
        }

        if self.is_active(interface_name).await != Some(false) {
            let result = self
                .exec(Stage::Stop, &self.init.stop(interface_name))
                .await;
            note(&mut first_failure, interface_name, result.map(drop));
        }

        let result = remove_if_present(&self.paths.routing_config(interface_name))
            .await
            .map_err(|e| StepFailure::new(Stage::RemoveRoutingConfig, e));
        note(&mut first_failure, interface_name, result);

        let result = remove_if_present(&self.paths.tunnel_config(interface_name))
            .await
            .map_err(|e| StepFailure::new(Stage::RemoveTunnelConfig, e));
        note(&mut first_failure, interface_name, result);

        if let Some((link, _)) = self.init.service_link(interface_name) {
            let result = remove_if_present(&link)
                .await
                .map_err(|e| StepFailure::new(Stage::RemoveServiceLink, e));
            note(&mut first_failure, interface_name, result);
        }

        note(&mut first_failure, interface_name, self.reload().await);

        match first_failure {
            None => {
                tracing::info!("Retracted {}", interface_name);
                Ok(())
            }
            Some(failure) => Err(failure),
        }
    }

    async fn start(&self, interface_name: &str) -> Result<(), StepFailure> {
        if let Some((link, target)) = self.init.service_link(interface_name) {
            create_link(&target, &link)
                .await
                .map_err(|e| StepFailure::new(Stage::Start, e))?;
        }
        self.exec(Stage::Start, &self.init.start(interface_name))
            .await
            .map(drop)
    }

    async fn reload(&self) -> Result<(), StepFailure> {
        self.exec(Stage::Reload, &argv(&self.birdc, &["configure"]))
            .await
            .map(drop)
    }

    /// Undo a partial apply. Errors are logged; the caller reports the
    /// failure that triggered the rollback.
    async fn roll_back(&self, interface_name: &str, progress: Progress) {
        tracing::warn!("Rolling back {} after failed apply", interface_name);

        if progress >= Progress::Enabled {
            let result = self
                .exec(Stage::Disable, &self.init.disable(interface_name))
                .await;
            log_rollback(interface_name, result.map(drop));
        }
        if progress >= Progress::Started {
            let result = self
                .exec(Stage::Stop, &self.init.stop(interface_name))
                .await;
            log_rollback(interface_name, result.map(drop));
        }
        if let Some((link, _)) = self.init.service_link(interface_name) {
            discard(&link).await;
        }
        discard(&self.paths.routing_config(interface_name)).await;
        discard(&self.paths.tunnel_config(interface_name)).await;
    }

    async fn is_active(&self, interface_name: &str) -> Option<bool> {
        self.query(&self.init.active_query(interface_name))
            .await
            .map(|out| out.success())
    }

    async fn is_enabled(&self, interface_name: &str) -> Option<bool> {
        let out = self.query(&self.init.enabled_query(interface_name)).await?;
        self.init.parse_enabled(interface_name, &out)
    }

    /// Run a state query; `None` when the answer is unknown
    async fn query(&self, argv: &[String]) -> Option<CommandOutput> {
        match self.runner.run(argv).await {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::debug!("Query `{}` failed: {}", argv.join(" "), e);
                None
            }
        }
    }

    /// Run a command that must exit successfully
    async fn exec(&self, stage: Stage, argv: &[String]) -> Result<CommandOutput, StepFailure> {
        let command = argv.join(" ");
        tracing::debug!("[{}] running `{}`", stage, command);

        match self.runner.run(argv).await {
            Ok(out) if out.success() => Ok(out),
            Ok(out) => {
                tracing::debug!("[{}] `{}` failed with {}", stage, command, out.status_string());
                Err(StepFailure::new(
                    stage,
                    StepError::Exit {
                        command,
                        status: out.status_string(),
                        stdout: out.stdout,
                        stderr: out.stderr.trim().to_string(),
                    },
                ))
            }
            Err(RunError::TimedOut(after)) => Err(StepFailure::new(
                stage,
                StepError::TimedOut { command, after },
            )),
            Err(e) => Err(StepFailure::new(
                stage,
                StepError::Spawn {
                    command,
                    message: e.to_string(),
                },
            )),
        }
    }
}

fn note(first: &mut Option<StepFailure>, interface_name: &str, result: Result<(), StepFailure>) {
    if let Err(failure) = result {
        tracing::warn!("Teardown of {} continuing after failure: {}", interface_name, failure);
        first.get_or_insert(failure);
    }
}

fn log_rollback(interface_name: &str, result: Result<(), StepFailure>) {
    if let Err(failure) = result {
        tracing::warn!("Rollback of {} incomplete: {}", interface_name, failure);
    }
}

async fn write_config(path: &Path, content: &str) -> Result<(), StepError> {
    let io_err = |source: std::io::Error| StepError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }

    // Tunnel configs carry the private key
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(io_err)?;
    file.write_all(content.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<(), StepError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StepError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn discard(path: &Path) {
    if let Err(e) = remove_if_present(path).await {
        tracing::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

async fn create_link(target: &Path, link: &Path) -> Result<(), StepError> {
    let io_err = |source: std::io::Error| StepError::Io {
        path: link.to_path_buf(),
        source,
    };

    if let Ok(existing) = tokio::fs::read_link(link).await {
        if existing == target {
            return Ok(());
        }
        tokio::fs::remove_file(link).await.map_err(io_err)?;
    }

    #[cfg(unix)]
    {
        tokio::fs::symlink(target, link).await.map_err(io_err)
    }

    #[cfg(not(unix))]
    {
        Err(io_err(std::io::Error::new(
            ErrorKind::Unsupported,
            "service links require a unix host",
        )))
    }
}
