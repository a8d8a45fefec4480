//! Simulated host for tests
//!
//! [`FakeRunner`] understands the `systemctl`, `rc-service`, `rc-update` and
//! `birdc` command lines the applier produces, keeps track of which
//! services are active and enabled, and can be told to fail any verb.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use crate::runner::{CommandOutput, ProcessRunner, RunError};

/// How an injected failure manifests
#[derive(Debug, Clone)]
pub enum FailMode {
    Exit { code: i32, stderr: String },
    TimedOut,
    Spawn,
}

impl FailMode {
    pub fn exit(code: i32, stderr: &str) -> Self {
        FailMode::Exit {
            code,
            stderr: stderr.to_string(),
        }
    }
}

/// Verb and service of a recognized command line
struct Parsed {
    verb: &'static str,
    service: Option<String>,
}

fn parse(argv: &[String]) -> Option<Parsed> {
    let program = Path::new(argv.first()?).file_name()?.to_str()?;
    let arg = |i: usize| argv.get(i).map(String::as_str);

    let (verb, service) = match program {
        "systemctl" => {
            let verb = match arg(1)? {
                "start" => "start",
                "stop" => "stop",
                "enable" => "enable",
                "disable" => "disable",
                "is-active" => "is-active",
                "is-enabled" => "is-enabled",
                _ => return None,
            };
            (verb, argv.last().cloned())
        }
        "rc-service" => {
            let verb = match arg(2)? {
                "start" => "start",
                "stop" => "stop",
                "status" => "is-active",
                _ => return None,
            };
            (verb, arg(1).map(str::to_string))
        }
        "rc-update" => match arg(1)? {
            "add" => ("enable", arg(2).map(str::to_string)),
            "del" => ("disable", arg(2).map(str::to_string)),
            "show" => ("list-enabled", None),
            _ => return None,
        },
        "birdc" => match arg(1)? {
            "configure" => ("configure", None),
            _ => return None,
        },
        _ => return None,
    };
    Some(Parsed { verb, service })
}

/// In-memory stand-in for the host's service manager and BIRD
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    failures: DashMap<&'static str, FailMode>,
    active: DashSet<String>,
    enabled: DashSet<String>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every future invocation of `verb` fail until cleared.
    ///
    /// Verbs: `start`, `stop`, `enable`, `disable`, `configure`,
    /// `is-active`, `is-enabled`, `list-enabled`.
    pub fn fail_on(&self, verb: &'static str, mode: FailMode) {
        self.failures.insert(verb, mode);
    }

    pub fn clear_failure(&self, verb: &str) {
        self.failures.remove(verb);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    /// Sleep this long inside every command
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of recorded invocations of `verb`, failed ones included
    pub fn count(&self, verb: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|argv| parse(argv).map(|p| p.verb) == Some(verb))
            .count()
    }

    pub fn is_active(&self, service: &str) -> bool {
        self.active.contains(service)
    }

    pub fn is_enabled(&self, service: &str) -> bool {
        self.enabled.contains(service)
    }

    /// Highest number of commands that were ever running at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, argv: &[String]) -> Result<CommandOutput, RunError> {
        let Some(parsed) = parse(argv) else {
            return Ok(exit(127, "", &format!("unknown command: {}", argv.join(" "))));
        };

        if let Some(mode) = self.failures.get(parsed.verb) {
            return match mode.value() {
                FailMode::Exit { code, stderr } => Ok(exit(*code, "", stderr)),
                FailMode::TimedOut => Err(RunError::TimedOut(Duration::from_secs(30))),
                FailMode::Spawn => Err(RunError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "No such file or directory",
                ))),
            };
        }

        let service = parsed.service.unwrap_or_default();
        let out = match parsed.verb {
            "start" => {
                self.active.insert(service);
                exit(0, "", "")
            }
            "stop" => {
                self.active.remove(&service);
                exit(0, "", "")
            }
            "enable" => {
                self.enabled.insert(service);
                exit(0, "", "")
            }
            "disable" => {
                self.enabled.remove(&service);
                exit(0, "", "")
            }
            "is-active" => exit(if self.active.contains(&service) { 0 } else { 3 }, "", ""),
            "is-enabled" => exit(if self.enabled.contains(&service) { 0 } else { 1 }, "", ""),
            "list-enabled" => {
                let mut services: Vec<String> =
                    self.enabled.iter().map(|s| s.key().clone()).collect();
                services.sort();
                let listing: String = services
                    .iter()
                    .map(|s| format!("  {} | default\n", s))
                    .collect();
                exit(0, &listing, "")
            }
            _ => exit(0, "", ""),
        };
        Ok(out)
    }
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: DashMap::new(),
            active: DashSet::new(),
            enabled: DashSet::new(),
            delay: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

fn exit(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, RunError> {
        if argv.is_empty() {
            return Err(RunError::EmptyCommand);
        }
        self.calls.lock().push(argv.to_vec());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.respond(argv);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
