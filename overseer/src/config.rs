//! Configuration loading for the overseer daemon.
//!
//! Loads `overseer.toml` with per-section defaults. All sections use
//! `#[serde(default)]` so a minimal or empty config file is valid; an empty
//! file simply supervises no services.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use steward::freshness::{ArtifactSpec, DEFAULT_TIMESTAMP_FIELDS};
use steward::orchestrator::ServiceSpec;
use steward::readiness::DependencyEdge;

/// Top-level overseer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverseerConfig {
    /// Loop timing.
    #[serde(default)]
    pub checks: ChecksConfig,

    /// Supervised services, in startup order.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Timing for the supervision loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ChecksConfig {
    /// Seconds between loop ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Seconds between health snapshot writes.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Seconds to sleep after a tick fails unexpectedly.
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,

    /// Seconds between ledger compaction and temp-file sweeps.
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            compaction_interval_secs: default_compaction_interval_secs(),
        }
    }
}

/// One supervised service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Unique service name; also its health component and lock role.
    pub name: String,

    /// Executable to launch.
    pub program: String,

    /// Arguments passed to `program`.
    #[serde(default)]
    pub args: Vec<String>,

    /// Marker file removed by remediation to force a supervised restart.
    #[serde(default)]
    pub marker: Option<PathBuf>,

    /// Artifact the service keeps fresh.
    pub artifact: ArtifactConfig,

    /// Upstream services that must be ready first.
    #[serde(default)]
    pub depends_on: Vec<DependencyConfig>,
}

/// Where a service's artifact lives and how old it may get.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    /// Candidate locations, any of which may hold the current copy.
    pub candidates: Vec<PathBuf>,

    /// Timestamp field aliases, dotted for nested fields.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,

    /// Maximum age in seconds for the service's own health.
    #[serde(default = "default_artifact_threshold_secs")]
    pub threshold_secs: u64,
}

/// A dependency edge with its own freshness bound.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencyConfig {
    /// Upstream service name.
    pub service: String,

    /// Maximum upstream artifact age for this edge.
    pub threshold_secs: u64,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_error_backoff_secs() -> u64 {
    60
}

fn default_compaction_interval_secs() -> u64 {
    600
}

fn default_fields() -> Vec<String> {
    DEFAULT_TIMESTAMP_FIELDS.iter().map(|f| (*f).to_owned()).collect()
}

fn default_artifact_threshold_secs() -> u64 {
    60
}

impl ServiceConfig {
    fn artifact_spec(&self, threshold_secs: u64) -> ArtifactSpec {
        ArtifactSpec {
            name: self.name.clone(),
            candidates: self.artifact.candidates.clone(),
            fields: self.artifact.fields.clone(),
            threshold: Duration::from_secs(threshold_secs),
        }
    }
}

impl OverseerConfig {
    /// Validate timing bounds and the service graph.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending field or service and how to fix it.
    pub fn validate(&self) -> anyhow::Result<()> {
        let c = &self.checks;
        anyhow::ensure!(
            c.interval_secs >= 1,
            "checks.interval_secs must be >= 1 (got {})",
            c.interval_secs
        );
        anyhow::ensure!(
            c.snapshot_interval_secs >= c.interval_secs,
            "checks.snapshot_interval_secs must be >= interval_secs (got {} < {})",
            c.snapshot_interval_secs,
            c.interval_secs
        );
        anyhow::ensure!(
            c.error_backoff_secs >= 1,
            "checks.error_backoff_secs must be >= 1 (got {})",
            c.error_backoff_secs
        );
        anyhow::ensure!(
            c.compaction_interval_secs >= 1,
            "checks.compaction_interval_secs must be >= 1 (got {})",
            c.compaction_interval_secs
        );

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for service in &self.services {
            let name = service.name.as_str();
            anyhow::ensure!(
                !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
                "service name {name:?} must be non-empty and use only [A-Za-z0-9_-]"
            );
            anyhow::ensure!(
                !service.program.trim().is_empty(),
                "service {name}: program must not be empty"
            );
            anyhow::ensure!(
                !service.artifact.candidates.is_empty(),
                "service {name}: artifact.candidates must list at least one path"
            );
            anyhow::ensure!(
                !service.artifact.fields.is_empty(),
                "service {name}: artifact.fields must not be empty; omit it to use the defaults"
            );
            anyhow::ensure!(
                service.artifact.threshold_secs >= 1,
                "service {name}: artifact.threshold_secs must be >= 1 (got {})",
                service.artifact.threshold_secs
            );
            for dep in &service.depends_on {
                anyhow::ensure!(
                    seen.contains(dep.service.as_str()),
                    "service {name} depends on {:?}, which is not declared before it; \
                     list dependencies earlier in [[services]]",
                    dep.service
                );
                anyhow::ensure!(
                    dep.threshold_secs >= 1,
                    "service {name}: depends_on {} threshold_secs must be >= 1 (got {})",
                    dep.service,
                    dep.threshold_secs
                );
            }
            anyhow::ensure!(
                seen.insert(name),
                "duplicate service name {name:?}; service names must be unique"
            );
        }
        Ok(())
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Service specs in startup order, with each edge bound to its upstream artifact.
    ///
    /// Assumes [`Self::validate`] passed.
    pub fn service_specs(&self) -> Vec<ServiceSpec> {
        self.services
            .iter()
            .map(|service| ServiceSpec {
                name: service.name.clone(),
                depends_on: service
                    .depends_on
                    .iter()
                    .filter_map(|dep| {
                        self.service(&dep.service).map(|upstream| {
                            DependencyEdge::new(dep.service.clone(), upstream.artifact_spec(dep.threshold_secs))
                        })
                    })
                    .collect(),
                own_artifact: service.artifact_spec(service.artifact.threshold_secs),
            })
            .collect()
    }
}

/// Parse and validate overseer configuration from TOML text.
///
/// # Errors
///
/// Returns an error if the text does not parse or fails validation.
pub fn parse_overseer_config(contents: &str) -> anyhow::Result<OverseerConfig> {
    let config: OverseerConfig = toml::from_str(contents).context("failed to parse overseer TOML")?;
    config.validate()?;
    Ok(config)
}

/// Load overseer configuration from a TOML file. A missing file yields defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or
/// fails validation.
pub fn load_overseer_config(path: &Path) -> anyhow::Result<OverseerConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_overseer_config(&contents)
            .with_context(|| format!("invalid overseer config at {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no overseer config found, supervising nothing");
            Ok(OverseerConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "failed to read overseer config at {}: {e}",
            path.display()
        )),
    }
}
