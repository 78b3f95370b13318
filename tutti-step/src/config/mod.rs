//! Step manager configuration loading.
//!
//! A single YAML file carries the few controller-wide knobs the step
//! manager consumes.  Every field has a default so a missing file section
//! (or no file at all) is accepted gracefully.
//!
//! The expected YAML structure is:
//! ```yaml
//! stepmgr:
//!   mem_reserved: true
//!   max_tasks_per_node: 128
//!   private_jobs: false
//!   front_end: false
//!   arbitrary_dist: "supported"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

// ── Private YAML deserialization types ────────────────────────────────────────

/// Top-level wrapper that maps directly onto the YAML file layout.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    stepmgr: ConfigEntry,
}

#[derive(Debug, Deserialize)]
struct ConfigEntry {
    #[serde(default)]
    mem_reserved: bool,
    #[serde(default = "default_max_tasks_per_node")]
    max_tasks_per_node: u32,
    #[serde(default)]
    private_jobs: bool,
    #[serde(default)]
    front_end: bool,
    arbitrary_dist: Option<String>,
}

impl Default for ConfigEntry {
    fn default() -> Self {
        Self {
            mem_reserved: false,
            max_tasks_per_node: default_max_tasks_per_node(),
            private_jobs: false,
            front_end: false,
            arbitrary_dist: None,
        }
    }
}

fn default_max_tasks_per_node() -> u32 {
    128
}

// ── Public configuration ──────────────────────────────────────────────────────

/// Switch-type policy for the `arbitrary` task distribution.
///
/// Preserves the legacy interconnect special case as configuration instead
/// of a hard-coded switch-type string compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArbitraryDistPolicy {
    /// The switch fabric supports arbitrary task layouts.
    #[default]
    Supported,
    /// Reject step creation requesting `arbitrary` distribution.
    Unsupported,
    /// Silently convert `arbitrary` to `block` in the node picker and log.
    Downgrade,
}

impl ArbitraryDistPolicy {
    /// Parse from the YAML string value.  Unknown values map to
    /// `Supported` with a warning, matching the permissive config style of
    /// the rest of the controller.
    fn from_str(v: &str) -> Self {
        match v {
            "supported" => ArbitraryDistPolicy::Supported,
            "unsupported" => ArbitraryDistPolicy::Unsupported,
            "downgrade" => ArbitraryDistPolicy::Downgrade,
            other => {
                warn!(value = other, "unknown arbitrary_dist value, using 'supported'");
                ArbitraryDistPolicy::Supported
            }
        }
    }
}

/// Controller-wide knobs consumed by the step manager.
///
/// Derived once at process init and passed into [`StepMgr`] — the
/// initialization-once context that replaces the original's process
/// globals.
///
/// [`StepMgr`]: crate::stepmgr::StepMgr
#[derive(Debug, Clone)]
pub struct StepmgrConfig {
    /// "Memory is a reserved resource".  When false, `mem_per_cpu` is
    /// silently forced to zero on all inputs so the memory accounting path
    /// is a no-op without callers having to check.
    pub mem_reserved: bool,

    /// Upper bound on `num_tasks / picked_nodes` for any step.
    pub max_tasks_per_node: u32,

    /// Step listings hide jobs from callers who are not the owner, an
    /// operator, or a coordinator of the job's account.
    pub private_jobs: bool,

    /// Front-end system: signals and time-limit messages address the job's
    /// batch host instead of each step node.
    pub front_end: bool,

    /// Policy for the `arbitrary` task distribution.
    pub arbitrary_dist: ArbitraryDistPolicy,
}

impl Default for StepmgrConfig {
    fn default() -> Self {
        Self {
            mem_reserved: false,
            max_tasks_per_node: default_max_tasks_per_node(),
            private_jobs: false,
            front_end: false,
            arbitrary_dist: ArbitraryDistPolicy::default(),
        }
    }
}

impl StepmgrConfig {
    /// Parse `path` into a configuration.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the YAML is
    /// structurally invalid.  Missing fields fall back to their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading stepmgr configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        let file: ConfigFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        let entry = file.stepmgr;
        let config = Self {
            mem_reserved: entry.mem_reserved,
            max_tasks_per_node: entry.max_tasks_per_node,
            private_jobs: entry.private_jobs,
            front_end: entry.front_end,
            arbitrary_dist: entry
                .arbitrary_dist
                .as_deref()
                .map(ArbitraryDistPolicy::from_str)
                .unwrap_or_default(),
        };

        info!(
            mem_reserved = config.mem_reserved,
            max_tasks_per_node = config.max_tasks_per_node,
            private_jobs = config.private_jobs,
            front_end = config.front_end,
            "stepmgr configuration loaded"
        );

        Ok(config)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
