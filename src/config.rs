//! Configuration loading and validation for the coordination core.
//!
//! Loads `steward.toml` with per-section defaults. All sections use
//! `#[serde(default)]` so a minimal or empty config file is valid.
//!
//! Precedence: env vars > config file > defaults. Validation failures are
//! fatal and name the offending field together with how to fix it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Top-level coordination configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    /// Filesystem locations of shared state.
    pub paths: PathsConfig,
    /// Atomic write retry and read coalescing.
    pub store: StoreConfig,
    /// Health hysteresis constants.
    pub hysteresis: HysteresisConfig,
    /// Timestamp extraction and sanity bounds.
    pub freshness: FreshnessConfig,
    /// Singleton lock behaviour.
    pub lock: LockConfig,
    /// Duplicate-action suppression.
    pub idempotency: IdempotencyConfig,
    /// Bounded auto-remediation.
    pub heal: HealConfig,
    /// Startup sequencing and restart cooldown.
    pub orchestrator: OrchestratorConfig,
}

/// Optional path overrides. Unset entries resolve under `state_dir`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root directory for all shared state (default `~/.steward`).
    pub state_dir: Option<PathBuf>,
    /// Canonical health snapshot.
    pub health_snapshot: Option<PathBuf>,
    /// Older snapshot locations migrated into the canonical one.
    pub legacy_health_snapshots: Option<Vec<PathBuf>>,
    /// Directory holding one lock file per role.
    pub lock_dir: Option<PathBuf>,
    /// Idempotency ledger document.
    pub idempotency_ledger: Option<PathBuf>,
    /// Service acknowledgement board.
    pub acks: Option<PathBuf>,
}

/// Fully resolved filesystem layout.
#[derive(Debug, Clone)]
pub struct StatePaths {
    /// Root directory for shared state.
    pub state_dir: PathBuf,
    /// Canonical health snapshot.
    pub health_snapshot: PathBuf,
    /// Legacy snapshot locations.
    pub legacy_health_snapshots: Vec<PathBuf>,
    /// Lock directory.
    pub lock_dir: PathBuf,
    /// Idempotency ledger.
    pub idempotency_ledger: PathBuf,
    /// Service acknowledgement board.
    pub acks: PathBuf,
    /// Directory of operator heal-reset requests.
    pub heal_reset_dir: PathBuf,
    /// Directory for daemon logs.
    pub logs_dir: PathBuf,
}

impl StatePaths {
    /// Lay out every path under a single root, ignoring overrides.
    pub fn under(state_dir: &Path) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            health_snapshot: state_dir.join("health.json"),
            legacy_health_snapshots: vec![state_dir.join("health").join("health.json")],
            lock_dir: state_dir.join("locks"),
            idempotency_ledger: state_dir.join("idempotency.json"),
            acks: state_dir.join("service_acks.json"),
            heal_reset_dir: state_dir.join("heal_reset"),
            logs_dir: state_dir.join("logs"),
        }
    }
}

/// Atomic write retry and read coalescing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts after the first before a write is reported as failed.
    pub max_retries: u32,
    /// First backoff delay in milliseconds; doubles per retry.
    pub base_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Window in which repeated reads of one path are served from cache.
    pub read_coalesce_ms: u64,
    /// Sliding window for contention accounting.
    pub contention_window_secs: u64,
    /// Retries within the window that constitute systemic contention.
    pub contention_retry_threshold: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 50,
            max_backoff_ms: 2_000,
            read_coalesce_ms: 250,
            contention_window_secs: 60,
            contention_retry_threshold: 3,
        }
    }
}

/// Health hysteresis constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    /// Consecutive failed probes that flip a component to Red (K).
    pub failure_threshold: u32,
    /// Seconds of continuous failure that flip a component to Red (T).
    pub failing_duration_secs: u64,
    /// Consecutive successes required to return to Green.
    pub recovery_successes: u32,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failing_duration_secs: 30,
            recovery_successes: 2,
        }
    }
}

/// Timestamp extraction and sanity bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Declared timestamps further than this from now are rejected as corrupt.
    pub sanity_window_days: u64,
    /// Minimum seconds between repeated mtime-fallback warnings per artifact.
    pub fallback_warn_interval_secs: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            sanity_window_days: 365,
            fallback_warn_interval_secs: 60,
        }
    }
}

/// Singleton lock behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Seconds after the last acquire/renew at which a lock is stale.
    pub ttl_secs: u64,
    /// Purge a valid foreign lock instead of yielding (audited).
    pub force_override: bool,
    /// Executable identity a live owner must match. Unset by default, in which
    /// case the identity recorded by the owner at acquire time is used.
    pub expected_identity: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 120,
            force_override: false,
            expected_identity: None,
        }
    }
}

/// Duplicate-action suppression.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Seconds a recorded action blocks repeats.
    pub ttl_secs: u64,
    /// Width of the coarse time bucket folded into action keys.
    pub bucket_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            bucket_secs: 5,
        }
    }
}

/// Bounded auto-remediation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Minimum seconds between heal attempts on one component.
    pub cooldown_secs: u64,
    /// Attempts before the healer stands down and asks for an operator.
    pub max_attempts: u32,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 300,
            max_attempts: 3,
        }
    }
}

/// Startup sequencing and restart cooldown.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// At most one start attempt per service per this many seconds.
    pub restart_cooldown_secs: u64,
    /// Bounded wait for a freshly spawned service to turn Green.
    pub ready_timeout_secs: u64,
    /// Poll interval during the readiness wait.
    pub ready_poll_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            restart_cooldown_secs: MAX_RESTART_COOLDOWN_SECS,
            ready_timeout_secs: 60,
            ready_poll_secs: 5,
        }
    }
}

/// Upper bound on the restart cooldown window.
pub const MAX_RESTART_COOLDOWN_SECS: u64 = 120;

impl StewardConfig {
    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns an error naming the field, its value, and the remediation.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.store;
        anyhow::ensure!(
            (1..=20).contains(&s.max_retries),
            "store.max_retries must be in 1..=20 (got {}); lower it to bound write latency",
            s.max_retries
        );
        anyhow::ensure!(
            s.base_backoff_ms >= 1 && s.max_backoff_ms >= s.base_backoff_ms,
            "store backoff must satisfy 1 <= base_backoff_ms <= max_backoff_ms (got {} / {}); \
             raise max_backoff_ms or lower base_backoff_ms",
            s.base_backoff_ms,
            s.max_backoff_ms
        );
        anyhow::ensure!(
            s.read_coalesce_ms <= 5_000,
            "store.read_coalesce_ms must be <= 5000 (got {}); long windows hide fresh writes",
            s.read_coalesce_ms
        );
        anyhow::ensure!(
            s.contention_window_secs >= 1 && s.contention_retry_threshold >= 1,
            "store contention window and threshold must both be >= 1 (got {}s / {})",
            s.contention_window_secs,
            s.contention_retry_threshold
        );

        let h = &self.hysteresis;
        anyhow::ensure!(
            h.failure_threshold >= 1,
            "hysteresis.failure_threshold must be >= 1 (got {}); set K to a positive probe count",
            h.failure_threshold
        );
        anyhow::ensure!(
            h.failing_duration_secs >= 1,
            "hysteresis.failing_duration_secs must be >= 1 (got {}); set T in whole seconds",
            h.failing_duration_secs
        );
        anyhow::ensure!(
            h.recovery_successes >= 1,
            "hysteresis.recovery_successes must be >= 1 (got {})",
            h.recovery_successes
        );

        anyhow::ensure!(
            self.freshness.sanity_window_days >= 1,
            "freshness.sanity_window_days must be >= 1 (got {})",
            self.freshness.sanity_window_days
        );

        anyhow::ensure!(
            self.lock.ttl_secs >= 1,
            "lock.ttl_secs must be >= 1 (got {}); owners renew within this window",
            self.lock.ttl_secs
        );

        let i = &self.idempotency;
        anyhow::ensure!(
            i.ttl_secs >= 1 && i.bucket_secs >= 1 && i.bucket_secs < i.ttl_secs,
            "idempotency requires 1 <= bucket_secs < ttl_secs (got bucket {} / ttl {}); \
             widen ttl_secs or narrow bucket_secs",
            i.bucket_secs,
            i.ttl_secs
        );

        anyhow::ensure!(
            self.heal.cooldown_secs >= 1 && (1..=100).contains(&self.heal.max_attempts),
            "heal requires cooldown_secs >= 1 and max_attempts in 1..=100 (got {}s / {})",
            self.heal.cooldown_secs,
            self.heal.max_attempts
        );

        let o = &self.orchestrator;
        anyhow::ensure!(
            (1..=MAX_RESTART_COOLDOWN_SECS).contains(&o.restart_cooldown_secs),
            "orchestrator.restart_cooldown_secs must be in 1..={MAX_RESTART_COOLDOWN_SECS} (got {})",
            o.restart_cooldown_secs
        );
        anyhow::ensure!(
            o.ready_timeout_secs >= 1
                && o.ready_poll_secs >= 1
                && o.ready_poll_secs <= o.ready_timeout_secs,
            "orchestrator requires 1 <= ready_poll_secs <= ready_timeout_secs (got {} / {})",
            o.ready_poll_secs,
            o.ready_timeout_secs
        );

        Ok(())
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("STEWARD_STATE_DIR") {
            self.paths.state_dir = Some(PathBuf::from(v));
        }

        let force = env("STEWARD_FORCE_START").or_else(|| env("FORCE_START"));
        if let Some(v) = force {
            self.lock.force_override = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(v) = env("STEWARD_RESTART_COOLDOWN_SECS") {
            match v.parse() {
                Ok(n) => self.orchestrator.restart_cooldown_secs = n,
                Err(_) => tracing::warn!(
                    var = "STEWARD_RESTART_COOLDOWN_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Resolve every configured path, filling unset entries under `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if no state directory is configured and the home
    /// directory cannot be determined.
    pub fn resolve_paths(&self) -> anyhow::Result<StatePaths> {
        let state_dir = match &self.paths.state_dir {
            Some(dir) => dir.clone(),
            None => default_state_dir()?,
        };
        let mut paths = StatePaths::under(&state_dir);
        if let Some(p) = &self.paths.health_snapshot {
            paths.health_snapshot = p.clone();
        }
        if let Some(p) = &self.paths.legacy_health_snapshots {
            paths.legacy_health_snapshots = p.clone();
        }
        if let Some(p) = &self.paths.lock_dir {
            paths.lock_dir = p.clone();
        }
        if let Some(p) = &self.paths.idempotency_ledger {
            paths.idempotency_ledger = p.clone();
        }
        if let Some(p) = &self.paths.acks {
            paths.acks = p.clone();
        }
        Ok(paths)
    }
}

/// Resolve the default state directory (`~/.steward`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_state_dir() -> anyhow::Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory; set STEWARD_STATE_DIR"))?;
    Ok(base.home_dir().join(".steward"))
}

/// Parse and validate configuration from TOML text, applying `env` overrides.
///
/// # Errors
///
/// Returns an error if the text does not parse or fails validation.
pub fn parse_config(
    contents: &str,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<StewardConfig> {
    let mut config: StewardConfig =
        toml::from_str(contents).context("failed to parse steward config TOML")?;
    config.apply_overrides(env);
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or
/// fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<StewardConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading steward config");
            contents
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no steward config found, using defaults");
            String::new()
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read steward config at {}: {e}",
                path.display()
            ))
        }
    };
    parse_config(&contents, |key| std::env::var(key).ok())
        .with_context(|| format!("invalid steward config at {}", path.display()))
}
