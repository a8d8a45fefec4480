//! In-process peerd for end-to-end tests
//!
//! The server is configured through a real peerd.toml in a temporary
//! directory and runs the full API stack, but host commands go to a
//! [`FakeRunner`] and configuration files land under the temporary directory.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use peerd_core::testing::FakeRunner;
use peerd_core::{interface_name, Asn, PeerManager, ProcessRunner};
use peerd_server::{build_api, build_manager, ServerConfig};

use crate::certificates::TestCertificates;

/// Local WireGuard private key written into the test config
pub const LOCAL_PRIVATE_KEY: &str = "YAnJtzpZLJ0ubqETnzWvE0D5RS7nr4Ia0r6mjD3nc0o=";

#[derive(Clone, Copy, PartialEq, Eq)]
enum TlsMode {
    Off,
    ServerOnly,
    Mutual,
}

/// Options for [`TestServer::start_with`]
pub struct TestServerBuilder {
    secret: Option<String>,
    tls: TlsMode,
}

impl TestServerBuilder {
    /// Require `Authorization: Bearer <secret>`
    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    /// Serve HTTPS
    pub fn tls(mut self) -> Self {
        self.tls = TlsMode::ServerOnly;
        self
    }

    /// Serve HTTPS and require a client certificate from the test CA
    pub fn mutual_tls(mut self) -> Self {
        self.tls = TlsMode::Mutual;
        self
    }

    pub async fn start(self) -> TestServer {
        TestServer::start_with(self).await
    }
}

/// A running peerd instance
pub struct TestServer {
    /// API listener address
    pub addr: SocketAddr,
    /// Simulated host the applier talks to
    pub runner: Arc<FakeRunner>,
    /// Manager behind the API, for assertions
    pub manager: Arc<PeerManager>,
    /// Certificates, when TLS is on
    pub certs: Option<Arc<TestCertificates>>,
    secret: Option<String>,
    dir: TempDir,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    /// Plain HTTP without authentication
    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            secret: None,
            tls: TlsMode::Off,
        }
    }

    async fn start_with(options: TestServerBuilder) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let certs = (options.tls != TlsMode::Off).then(|| Arc::new(TestCertificates::generate()));

        let config_path = dir.path().join("peerd.toml");
        let toml = render_config(&dir, options.secret.as_deref(), certs.as_deref(), options.tls);
        std::fs::write(&config_path, toml).expect("Failed to write peerd.toml");

        let config = ServerConfig::load_and_resolve(&config_path).expect("Failed to resolve config");

        let runner = FakeRunner::new();
        let manager = build_manager(&config, runner.clone() as Arc<dyn ProcessRunner>)
            .expect("Failed to build manager");
        let api = build_api(&config.api, manager.clone()).expect("Failed to build API");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind API listener");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                result = api.run_with_listener(listener) => {
                    if let Err(e) = result {
                        tracing::error!("API error: {}", e);
                    }
                }
                _ = shutdown_rx => {
                    tracing::debug!("API shutting down");
                }
            }
        });

        Self {
            addr,
            runner,
            manager,
            certs,
            secret: options.secret,
            dir,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// URL of an API route, e.g. `url("/add")`
    pub fn url(&self, path: &str) -> String {
        let scheme = if self.certs.is_some() { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.addr, path)
    }

    /// HTTP client that trusts the test CA and, with `with_identity`,
    /// presents the test client certificate
    pub fn client(&self, with_identity: bool) -> reqwest::Client {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(certs) = &self.certs {
            let ca = reqwest::Certificate::from_pem(certs.ca_cert_pem.as_bytes())
                .expect("Invalid CA certificate");
            builder = builder.add_root_certificate(ca);
            if with_identity {
                let identity = reqwest::Identity::from_pem(certs.client.bundle_pem().as_bytes())
                    .expect("Invalid client identity");
                builder = builder.identity(identity);
            }
        }
        builder.build().expect("Failed to build HTTP client")
    }

    /// POST a JSON body with the configured bearer token
    pub async fn post(&self, path: &str, body: &str) -> (u16, String) {
        let mut request = self
            .client(true)
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .body(body.to_string());
        if let Some(secret) = &self.secret {
            request = request.bearer_auth(secret);
        }
        let response = request.send().await.expect("Request failed");
        let status = response.status().as_u16();
        let text = response.text().await.expect("Failed to read body");
        (status, text)
    }

    pub fn database_path(&self) -> PathBuf {
        self.dir.path().join("peers.toml")
    }

    pub fn tunnel_config(&self, asn: Asn) -> PathBuf {
        self.dir
            .path()
            .join("wireguard")
            .join(format!("{}.conf", interface_name(asn)))
    }

    pub fn routing_config(&self, asn: Asn) -> PathBuf {
        self.dir
            .path()
            .join("bird")
            .join(format!("{}.conf", interface_name(asn)))
    }

    /// Whether the fake host has the peer's tunnel service running
    pub fn tunnel_active(&self, asn: Asn) -> bool {
        self.runner
            .is_active(&format!("wg-quick@{}", interface_name(asn)))
    }

    /// Shutdown the test server
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn render_config(
    dir: &TempDir,
    secret: Option<&str>,
    certs: Option<&TestCertificates>,
    tls: TlsMode,
) -> String {
    let root = dir.path();
    let mut toml = String::from("[api]\n");
    if let Some(secret) = secret {
        let _ = writeln!(toml, "secret = {:?}", secret);
    }

    if let Some(certs) = certs {
        let write_pem = |name: &str, pem: &str| {
            let path = root.join(name);
            std::fs::write(&path, pem).expect("Failed to write PEM");
            path.display().to_string()
        };
        let _ = writeln!(toml, "[api.tls]");
        let _ = writeln!(
            toml,
            "cert = {:?}",
            write_pem("server.crt", &certs.server.cert_pem)
        );
        let _ = writeln!(
            toml,
            "key = {:?}",
            write_pem("server.key", &certs.server.key_pem)
        );
        if tls == TlsMode::Mutual {
            let _ = writeln!(
                toml,
                "client_ca = {:?}",
                write_pem("ca.crt", &certs.ca_cert_pem)
            );
        }
    }

    let _ = writeln!(toml, "\n[peer]");
    let _ = writeln!(toml, "link_local = \"fe80::1\"");
    let _ = writeln!(toml, "wireguard_private_key = {:?}", LOCAL_PRIVATE_KEY);

    let _ = writeln!(toml, "\n[environment]");
    let _ = writeln!(toml, "init_system = \"systemd\"");

    let _ = writeln!(toml, "\n[paths]");
    let _ = writeln!(
        toml,
        "database = {:?}",
        root.join("peers.toml").display().to_string()
    );
    let _ = writeln!(
        toml,
        "wireguard_dir = {:?}",
        root.join("wireguard").display().to_string()
    );
    let _ = writeln!(
        toml,
        "bird_peers_dir = {:?}",
        root.join("bird").display().to_string()
    );
    toml
}
