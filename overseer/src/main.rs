//! Overseer CLI entry point.
//!
//! Provides `start`, `check`, `lock-status`, and `reset-heal` subcommands for
//! running the supervisor daemon, reporting health once, inspecting a role
//! lock, or asking the daemon to re-arm remediation for a component.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use overseer::config::{load_overseer_config, OverseerConfig};
use overseer::monitor::Monitor;
use overseer::probes::probe_service;
use overseer::spawner::CommandSpawner;
use steward::config::{default_state_dir, load_config, StewardConfig};
use steward::coordinator::{request_heal_reset, Coordinator};
use steward::heal::MarkerRemoval;
use steward::health::HealthState;
use steward::lock::{LockStatus, SystemProbe};

/// Lock role held by the running daemon.
const DAEMON_ROLE: &str = "overseer";

/// Overseer: supervisor daemon for filesystem-coordinated services.
#[derive(Parser)]
#[command(name = "overseer", version, about)]
struct Cli {
    /// Path to `overseer.toml` (default `<state_dir>/overseer.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to `steward.toml` (default `<state_dir>/steward.toml`).
    #[arg(long, global = true)]
    steward_config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the supervisor daemon.
    Start,
    /// Probe every service once, print its state, and exit non-zero unless all are green.
    Check,
    /// Show who holds a role lock and whether the record is still valid.
    LockStatus {
        /// Lock role to inspect.
        #[arg(default_value = DAEMON_ROLE)]
        role: String,
    },
    /// Ask the running daemon to reset a component's heal attempts.
    ResetHeal {
        /// Component whose remediation budget is restored.
        component: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configs = Configs::load(cli.config, cli.steward_config)?;

    match cli.command {
        Command::Start => handle_start(configs).await,
        Command::Check => handle_check(configs),
        Command::LockStatus { role } => handle_lock_status(configs, &role),
        Command::ResetHeal { component } => handle_reset_heal(configs, &component),
    }
}

/// Both configuration files, resolved relative to the state directory.
struct Configs {
    steward: StewardConfig,
    overseer: OverseerConfig,
}

impl Configs {
    fn load(overseer_path: Option<PathBuf>, steward_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let state_dir = match std::env::var_os("STEWARD_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_state_dir()?,
        };
        let steward_path = steward_path.unwrap_or_else(|| state_dir.join("steward.toml"));
        let steward = load_config(&steward_path)?;

        let overseer_path = overseer_path.unwrap_or_else(|| {
            steward
                .paths
                .state_dir
                .clone()
                .unwrap_or(state_dir)
                .join("overseer.toml")
        });
        let overseer = load_overseer_config(&overseer_path)?;
        Ok(Self { steward, overseer })
    }
}

/// Run the supervisor daemon.
async fn handle_start(configs: Configs) -> anyhow::Result<()> {
    let Configs { steward, overseer } = configs;
    let paths = steward.resolve_paths()?;

    // Set up production logging (JSON file + stderr).
    let _logging_guard = steward::logging::init_production(&paths.logs_dir, DAEMON_ROLE)?;

    let coordinator = Coordinator::open(steward).context("failed to open coordination state")?;

    // Only one daemon may drive the fleet.
    let guard = match coordinator.lock(DAEMON_ROLE).into_guard() {
        Ok(guard) => guard,
        Err(outcome) => {
            eprintln!("overseer already running: {outcome}");
            warn!(outcome = %outcome, "running as secondary, exiting");
            coordinator.discard();
            std::process::exit(outcome.exit_code());
        }
    };
    info!(outcome = %guard.outcome(), "lock acquired");

    let probe = Arc::new(SystemProbe);
    let spawner = Arc::new(CommandSpawner::new(
        &overseer.services,
        paths.state_dir.join("pids"),
        probe,
    ));
    let markers: BTreeMap<String, PathBuf> = overseer
        .services
        .iter()
        .filter_map(|s| s.marker.clone().map(|m| (s.name.clone(), m)))
        .collect();
    let healer = coordinator
        .healer()
        .with_remediation(Arc::new(MarkerRemoval::new(coordinator.store(), markers)));
    let orchestrator = coordinator.orchestrator(spawner);
    let services = overseer.service_specs();

    info!(
        state_dir = %paths.state_dir.display(),
        services = services.len(),
        "overseer supervisor started"
    );

    let monitor = Monitor::new(coordinator, services, orchestrator, healer, overseer.checks)
        .with_lock(guard);
    monitor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

/// Probe every service once and report. Does not modify shared state.
fn handle_check(configs: Configs) -> anyhow::Result<()> {
    steward::logging::init_cli();
    let Configs { steward, overseer } = configs;
    let coordinator = Coordinator::open(steward).context("failed to open coordination state")?;
    let resolver = coordinator.resolver();
    let store = coordinator.store();

    let mut all_green = true;
    for service in overseer.service_specs() {
        let (freshness, _) = probe_service(&resolver, &store, &service);
        let state = coordinator.registry().state(&service.name);
        if state == HealthState::Green {
            println!("{:<20} {state:<8} {freshness}", service.name);
        } else {
            all_green = false;
            let why = coordinator.registry().why_not_green_line(&service.name);
            println!("{:<20} {state:<8} {freshness} blockers: {why}", service.name);
        }
    }
    coordinator.discard();

    if !all_green {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the state of one role lock.
fn handle_lock_status(configs: Configs, role: &str) -> anyhow::Result<()> {
    steward::logging::init_cli();
    let coordinator = Coordinator::open(configs.steward).context("failed to open coordination state")?;
    let lock = coordinator.lock(role);
    match lock.inspect() {
        LockStatus::Free => println!("{role}: free ({})", lock.path().display()),
        LockStatus::Active(record) => println!(
            "{role}: held by pid {} on {} since {}",
            record.owner_pid,
            record.owner_host,
            record.acquired_at.to_rfc3339()
        ),
        LockStatus::Stale { record, reason } => match record {
            Some(r) => println!("{role}: stale ({reason}), last owner pid {} on {}", r.owner_pid, r.owner_host),
            None => println!("{role}: stale ({reason})"),
        },
    }
    coordinator.discard();
    Ok(())
}

/// Write a heal-reset request for the running daemon to pick up.
fn handle_reset_heal(configs: Configs, component: &str) -> anyhow::Result<()> {
    steward::logging::init_cli();
    let coordinator = Coordinator::open(configs.steward).context("failed to open coordination state")?;
    let result = request_heal_reset(&coordinator.store(), coordinator.paths(), component);
    coordinator.discard();
    result?;
    println!("heal reset requested for {component}");
    Ok(())
}
