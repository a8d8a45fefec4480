//! Daemon configuration with environment variable priority
//!
//! Every value is resolved in this order (first found wins):
//! 1. Environment variables (PEERD_*)
//! 2. Config file (peerd.toml)
//! 3. Default values (where applicable)

use std::env;
use std::fmt::Display;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

use peerd_core::{
    is_link_local, is_valid_public_key, AsnRange, InitSystem, LocalSettings, PortPrefix,
    SystemPaths, Templates, DEFAULT_BIRD_TEMPLATE, DEFAULT_WIREGUARD_TEMPLATE,
};
use peerd_secrets::{SecretResolver, SecretUri};

/// Environment variable prefix
const ENV_PREFIX: &str = "PEERD";

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_PORT_PREFIX: u16 = 2;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Daemon configuration as written in peerd.toml
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub api: ApiConfig,
    pub peer: PeerConfig,
    pub environment: EnvironmentConfig,
    pub paths: PathsConfig,
    pub templates: TemplatesConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// IPv4 listen address, empty to disable (default 127.0.0.1)
    pub listen_v4: Option<String>,

    /// IPv6 listen address, empty to disable (default disabled)
    pub listen_v6: Option<String>,

    pub port: Option<u16>,

    /// Bearer secret (env://, file://, base64:, or plain). Empty disables auth.
    pub secret: Option<String>,

    pub tls: Option<ApiTlsConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ApiTlsConfig {
    pub cert: Option<String>,
    pub key: Option<String>,

    /// CA for client certificates; enables mutual TLS
    pub client_ca: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
    /// Local fe80::/10 address assigned on every tunnel
    pub link_local: Option<String>,

    /// Local WireGuard private key (secret reference)
    pub wireguard_private_key: Option<String>,

    /// Leading digit of every tunnel listen port (1-5)
    pub port_prefix: Option<u16>,

    /// Inclusive `[first, last]` ranges of accepted ASNs
    pub asn_ranges: Option<Vec<AsnRange>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// `systemd` or `openrc`
    pub init_system: Option<String>,
    pub systemctl_path: Option<String>,
    pub rc_service_path: Option<String>,
    pub rc_update_path: Option<String>,
    pub birdc_path: Option<String>,
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub database: Option<PathBuf>,
    pub wireguard_dir: Option<PathBuf>,
    pub bird_peers_dir: Option<PathBuf>,
    pub openrc_init_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TemplatesConfig {
    pub wireguard: Option<PathBuf>,
    pub bird: Option<PathBuf>,
}

/// API listener settings with secrets resolved
pub struct ResolvedApiConfig {
    pub listen_v4: Option<Ipv4Addr>,
    pub listen_v6: Option<Ipv6Addr>,
    pub port: u16,
    /// Empty when authentication is disabled
    pub secret: String,
    pub tls: Option<ResolvedTlsConfig>,
}

pub struct ResolvedTlsConfig {
    pub cert_pem: String,
    pub key_pem: String,
    pub client_ca_pem: Option<String>,
}

/// Fully validated configuration with actual secret values
pub struct ResolvedServerConfig {
    pub api: ResolvedApiConfig,
    pub local: LocalSettings,
    pub asn_ranges: Vec<AsnRange>,
    pub init_system: InitSystem,
    pub birdc: PathBuf,
    pub command_timeout: Duration,
    pub database: PathBuf,
    pub system_paths: SystemPaths,
    pub templates: Templates,
}

/// Looks up `PEERD_<name>`
type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn parse_env<T>(env: EnvLookup<'_>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {}_{}={:?}: {}", ENV_PREFIX, name, raw, e)),
        None => Ok(None),
    }
}

/// Empty means disabled
fn parse_listen<T>(value: &str, field: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|e| anyhow!("Invalid {} {:?}: {}", field, value, e))
}

/// `4242420000-4242429999,4201270000-4201279999`
fn parse_asn_ranges(raw: &str) -> anyhow::Result<Vec<AsnRange>> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| -> anyhow::Result<AsnRange> {
            let (first, last) = part
                .trim()
                .split_once('-')
                .ok_or_else(|| anyhow!("ASN range {:?} must be <first>-<last>", part))?;
            Ok(AsnRange::new(
                first
                    .trim()
                    .parse::<u32>()
                    .context("Invalid ASN range start")?,
                last.trim().parse::<u32>().context("Invalid ASN range end")?,
            ))
        })
        .collect()
}

fn non_empty_path(value: String, field: &str) -> anyhow::Result<PathBuf> {
    if value.trim().is_empty() {
        bail!("{} must not be empty", field);
    }
    Ok(PathBuf::from(value.trim()))
}

fn parse_secret(source: &str, what: &str) -> anyhow::Result<SecretUri> {
    source
        .parse()
        .map_err(|e| anyhow!("Invalid {} source: {}", what, e))
}

fn read_template(path: Option<PathBuf>, builtin: &'static str) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template {}", path.display())),
        None => Ok(builtin.to_string()),
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(
                "No config file at {}, using environment and defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(&|name: &str| env::var(format!("{}_{}", ENV_PREFIX, name)).ok())
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: impl AsRef<Path>) -> anyhow::Result<ResolvedServerConfig> {
        Self::load(path)?.resolve()
    }

    fn resolve_with(self, env: EnvLookup<'_>) -> anyhow::Result<ResolvedServerConfig> {
        let resolver = SecretResolver::new();
        let api = self.api;
        let peer = self.peer;
        let environment = self.environment;
        let paths = self.paths;

        // Listeners: ENV > config > 127.0.0.1 / disabled
        let listen_v4: Option<Ipv4Addr> = parse_listen(
            &env("API_LISTEN_V4")
                .or(api.listen_v4)
                .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string()),
            "api.listen_v4",
        )?;
        let listen_v6: Option<Ipv6Addr> = parse_listen(
            &env("API_LISTEN_V6").or(api.listen_v6).unwrap_or_default(),
            "api.listen_v6",
        )?;
        if listen_v4.is_none() && listen_v6.is_none() {
            bail!("At least one of api.listen_v4 and api.listen_v6 must be set");
        }

        let port = parse_env(env, "API_PORT")?
            .or(api.port)
            .unwrap_or(DEFAULT_PORT);
        if port == 0 {
            bail!("api.port must not be 0");
        }

        // Secret: ENV > config > empty (auth disabled)
        let secret_uri = parse_secret(
            &env("API_SECRET").or(api.secret).unwrap_or_default(),
            "API secret",
        )?;
        let secret = resolver
            .resolve_trimmed(&secret_uri)
            .map_err(|e| anyhow!("Failed to resolve API secret: {}", e))?;

        // TLS: cert and key come together, client CA is optional
        let tls_file = api.tls.unwrap_or_default();
        let cert_source = env("TLS_CERT").or(tls_file.cert);
        let key_source = env("TLS_KEY").or(tls_file.key);
        let client_ca_source = env("TLS_CLIENT_CA").or(tls_file.client_ca);
        let tls = match (cert_source, key_source) {
            (Some(cert), Some(key)) => {
                let cert_pem = resolver
                    .resolve_required(&parse_secret(&cert, "TLS certificate")?)
                    .map_err(|e| anyhow!("Failed to resolve TLS certificate: {}", e))?;
                let key_pem = resolver
                    .resolve_required(&parse_secret(&key, "TLS key")?)
                    .map_err(|e| anyhow!("Failed to resolve TLS key: {}", e))?;
                let client_ca_pem = match client_ca_source {
                    Some(ca) => Some(
                        resolver
                            .resolve_required(&parse_secret(&ca, "client CA")?)
                            .map_err(|e| anyhow!("Failed to resolve client CA: {}", e))?,
                    ),
                    None => None,
                };
                Some(ResolvedTlsConfig {
                    cert_pem,
                    key_pem,
                    client_ca_pem,
                })
            }
            (None, None) if client_ca_source.is_none() => None,
            _ => bail!("api.tls requires both cert and key"),
        };

        // Local link-local: ENV > config > required
        let link_local = env("LINK_LOCAL").or(peer.link_local).ok_or_else(|| {
            anyhow!("Local link-local address required. Set PEERD_LINK_LOCAL or peer.link_local in config")
        })?;
        let link_local = link_local.trim().to_string();
        if !is_link_local(&link_local) {
            bail!("peer.link_local {:?} is not an fe80::/10 address", link_local);
        }

        // Private key: ENV > config > required
        let key_source = env("WIREGUARD_PRIVATE_KEY")
            .or(peer.wireguard_private_key)
            .ok_or_else(|| {
                anyhow!("WireGuard private key required. Set PEERD_WIREGUARD_PRIVATE_KEY or peer.wireguard_private_key in config")
            })?;
        let private_key = resolver
            .resolve_required(&parse_secret(&key_source, "WireGuard private key")?)
            .map_err(|e| anyhow!("Failed to resolve WireGuard private key: {}", e))?;
        if !is_valid_public_key(&private_key) {
            bail!("peer.wireguard_private_key must be a base64-encoded 32-byte key");
        }

        let prefix = parse_env(env, "PORT_PREFIX")?
            .or(peer.port_prefix)
            .unwrap_or(DEFAULT_PORT_PREFIX);
        let port_prefix = PortPrefix::new(prefix).ok_or_else(|| {
            anyhow!(
                "peer.port_prefix must be between {} and {}, got {}",
                PortPrefix::MIN,
                PortPrefix::MAX,
                prefix
            )
        })?;

        let asn_ranges = match env("ASN_RANGES") {
            Some(raw) => parse_asn_ranges(&raw)?,
            None => peer.asn_ranges.unwrap_or_else(|| vec![AsnRange::DN42]),
        };
        if asn_ranges.is_empty() {
            bail!("peer.asn_ranges must contain at least one range");
        }
        if let Some(range) = asn_ranges.iter().find(|r| r.is_empty()) {
            bail!("Invalid ASN range [{}, {}]", range.first, range.last);
        }

        // Service management
        let openrc_init_dir = env("OPENRC_INIT_DIR")
            .map(PathBuf::from)
            .or(paths.openrc_init_dir)
            .unwrap_or_else(|| PathBuf::from("/etc/init.d"));
        let init_name = env("INIT_SYSTEM")
            .or(environment.init_system)
            .unwrap_or_else(|| "systemd".to_string());
        let init_system = match init_name.trim() {
            "systemd" => InitSystem::Systemd {
                systemctl: non_empty_path(
                    env("SYSTEMCTL_PATH")
                        .or(environment.systemctl_path)
                        .unwrap_or_else(|| "systemctl".to_string()),
                    "environment.systemctl_path",
                )?,
            },
            "openrc" => InitSystem::OpenRc {
                rc_service: non_empty_path(
                    env("RC_SERVICE_PATH")
                        .or(environment.rc_service_path)
                        .unwrap_or_else(|| "rc-service".to_string()),
                    "environment.rc_service_path",
                )?,
                rc_update: non_empty_path(
                    env("RC_UPDATE_PATH")
                        .or(environment.rc_update_path)
                        .unwrap_or_else(|| "rc-update".to_string()),
                    "environment.rc_update_path",
                )?,
                init_dir: openrc_init_dir,
            },
            other => bail!(
                "Unsupported init system {:?} (expected systemd or openrc)",
                other
            ),
        };
        let birdc = non_empty_path(
            env("BIRDC_PATH")
                .or(environment.birdc_path)
                .unwrap_or_else(|| "birdc".to_string()),
            "environment.birdc_path",
        )?;

        let timeout_secs = parse_env(env, "COMMAND_TIMEOUT_SECS")?
            .or(environment.command_timeout_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        if timeout_secs == 0 {
            bail!("environment.command_timeout_secs must be positive");
        }

        // Files
        let defaults = SystemPaths::default();
        let database = env("DATABASE")
            .map(PathBuf::from)
            .or(paths.database)
            .unwrap_or_else(|| PathBuf::from("peers.toml"));
        let system_paths = SystemPaths {
            wireguard_dir: env("WIREGUARD_DIR")
                .map(PathBuf::from)
                .or(paths.wireguard_dir)
                .unwrap_or(defaults.wireguard_dir),
            bird_peers_dir: env("BIRD_PEERS_DIR")
                .map(PathBuf::from)
                .or(paths.bird_peers_dir)
                .unwrap_or(defaults.bird_peers_dir),
        };

        let wireguard_template = read_template(
            env("WIREGUARD_TEMPLATE")
                .map(PathBuf::from)
                .or(self.templates.wireguard),
            DEFAULT_WIREGUARD_TEMPLATE,
        )?;
        let bird_template = read_template(
            env("BIRD_TEMPLATE").map(PathBuf::from).or(self.templates.bird),
            DEFAULT_BIRD_TEMPLATE,
        )?;
        let templates = Templates::parse(&wireguard_template, &bird_template)?;

        tracing::info!("Configuration resolved ({} init system)", init_system);

        Ok(ResolvedServerConfig {
            api: ResolvedApiConfig {
                listen_v4,
                listen_v6,
                port,
                secret,
                tls,
            },
            local: LocalSettings {
                private_key,
                link_local,
                port_prefix,
            },
            asn_ranges,
            init_system,
            birdc,
            command_timeout: Duration::from_secs(timeout_secs),
            database,
            system_paths,
            templates,
        })
    }
}
