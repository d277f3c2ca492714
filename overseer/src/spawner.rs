//! Process launching for supervised services.
//!
//! Children are spawned with null stdio and their PIDs written to
//! `<pid_dir>/<service>.pid`, followed on a second line by the executable
//! identity seen right after launch. Children spawned by this process are
//! reaped on the next liveness check; services started by an earlier overseer
//! are tracked through their PID file, and count as running only while the
//! PID is alive and, where identities are readable, still runs the recorded
//! executable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use steward::lock::{normalize_identity, ProcessProbe};
use steward::orchestrator::{ServiceSpec, Spawner};

use crate::config::ServiceConfig;

#[derive(Debug, Clone)]
struct LaunchSpec {
    program: String,
    args: Vec<String>,
}

/// Spawns configured programs as child processes.
pub struct CommandSpawner {
    launches: BTreeMap<String, LaunchSpec>,
    pid_dir: PathBuf,
    probe: Arc<dyn ProcessProbe>,
    children: Mutex<BTreeMap<String, Child>>,
}

impl std::fmt::Debug for CommandSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpawner")
            .field("services", &self.launches.keys().collect::<Vec<_>>())
            .field("pid_dir", &self.pid_dir)
            .finish_non_exhaustive()
    }
}

impl CommandSpawner {
    /// Spawner for `services`, writing PID files under `pid_dir`.
    pub fn new(services: &[ServiceConfig], pid_dir: PathBuf, probe: Arc<dyn ProcessProbe>) -> Self {
        let launches = services
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    LaunchSpec {
                        program: s.program.clone(),
                        args: s.args.clone(),
                    },
                )
            })
            .collect();
        Self {
            launches,
            pid_dir,
            probe,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    /// PID file for `service`.
    pub fn pid_file(&self, service: &str) -> PathBuf {
        self.pid_dir.join(format!("{service}.pid"))
    }

    /// Whether the PID file still names a live process running the launched executable.
    ///
    /// A file naming a reused PID is removed.
    fn pid_file_names_live_service(&self, service: &str) -> bool {
        let pid_file = self.pid_file(service);
        let Some(record) = read_pid_record(&pid_file) else {
            return false;
        };
        if !self.probe.is_alive(record.pid) {
            return false;
        }
        if !self.probe.supports_identity() {
            return true;
        }
        let actual = self.probe.identity(record.pid).map(normalize_identity);
        if record.identity.is_some() && record.identity == actual {
            return true;
        }
        warn!(
            service,
            pid = record.pid,
            recorded = record.identity.as_deref().unwrap_or("unknown"),
            actual = actual.as_deref().unwrap_or("unreadable"),
            "pid file names a different process, treating service as stopped"
        );
        if let Err(e) = std::fs::remove_file(&pid_file) {
            debug!(service, error = %e, "cannot remove outdated pid file");
        }
        false
    }
}

/// Parsed PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    /// Launched process.
    pub pid: u32,
    /// Its executable identity at launch, when it could be read.
    pub identity: Option<String>,
}

impl PidRecord {
    fn render(&self) -> String {
        match &self.identity {
            Some(identity) => format!("{}\n{identity}\n", self.pid),
            None => format!("{}\n", self.pid),
        }
    }
}

/// Read a PID file. Missing, empty, or garbled files yield `None`.
pub fn read_pid_record(path: &Path) -> Option<PidRecord> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut lines = raw.lines();
    let pid = lines.next()?.trim().parse().ok()?;
    let identity = lines
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned);
    Some(PidRecord { pid, identity })
}

/// PID named by a PID file.
pub fn read_pid(path: &Path) -> Option<u32> {
    read_pid_record(path).map(|record| record.pid)
}

#[async_trait]
impl Spawner for CommandSpawner {
    async fn spawn(&self, service: &ServiceSpec) -> anyhow::Result<u32> {
        let launch = self
            .launches
            .get(&service.name)
            .cloned()
            .with_context(|| format!("no launch command configured for {}", service.name))?;
        let pid_file = self.pid_file(&service.name);
        let pid_dir = self.pid_dir.clone();
        let processes = Arc::clone(&self.probe);

        info!(service = %service.name, program = %launch.program, "launching service");
        let child = tokio::task::spawn_blocking(move || -> anyhow::Result<Child> {
            std::fs::create_dir_all(&pid_dir)
                .with_context(|| format!("failed to create {}", pid_dir.display()))?;
            let child = std::process::Command::new(&launch.program)
                .args(&launch.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("failed to spawn {}", launch.program))?;
            // Spawn returns after exec, so the identity is the launched program's.
            let record = PidRecord {
                pid: child.id(),
                identity: processes.identity(child.id()).map(normalize_identity),
            };
            std::fs::write(&pid_file, record.render())
                .with_context(|| format!("failed to write {}", pid_file.display()))?;
            Ok(child)
        })
        .await
        .context("spawn task panicked")??;

        let pid = child.id();
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.name.clone(), child);
        Ok(pid)
    }

    fn is_running(&self, service: &ServiceSpec) -> bool {
        {
            let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(child) = children.get_mut(&service.name) {
                match child.try_wait() {
                    Ok(None) => return true,
                    Ok(Some(status)) => {
                        warn!(service = %service.name, status = %status, "service exited");
                        children.remove(&service.name);
                        return false;
                    }
                    Err(e) => {
                        debug!(service = %service.name, error = %e, "cannot poll child, falling back to pid file");
                        children.remove(&service.name);
                    }
                }
            }
        }
        self.pid_file_names_live_service(&service.name)
    }
}
