//! Host-provided configuration for the supervised pair

use crate::process::ChildSpec;
use crate::readiness::ReadinessProbe;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which full node daemon to run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeVariant {
    #[default]
    Core,
    Liquid,
}

impl NodeVariant {
    /// Executable name of the daemon inside the base directory
    pub fn daemon_name(&self) -> &'static str {
        match self {
            NodeVariant::Core => "bitcoind",
            NodeVariant::Liquid => "liquidd",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeVariant::Core => "core",
            NodeVariant::Liquid => "liquid",
        }
    }
}

impl fmt::Display for NodeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a start request needs from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Directory holding the `tor` and node executables; must already exist
    pub base_dir: PathBuf,

    /// Selected full node daemon
    pub variant: NodeVariant,

    /// Passed to the node as `--datadir`
    pub datadir: PathBuf,

    /// Passed to the node as `--conf`
    pub conf: PathBuf,

    /// Shown once the pair is running
    pub version_label: String,

    /// Wait for Tor before spawning the node; `None` relies on spawn order only
    pub readiness: Option<ReadinessProbe>,
}

impl SupervisorConfig {
    /// Configuration with the default variant and data paths under `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let datadir = default_datadir(&base_dir);
        let conf = default_conf(&datadir);
        let variant = NodeVariant::default();

        Self {
            base_dir,
            variant,
            datadir,
            conf,
            version_label: variant.to_string(),
            readiness: Some(ReadinessProbe::default()),
        }
    }

    /// Build the child launch descriptions for this configuration
    pub fn launch_plan(&self) -> LaunchPlan {
        LaunchPlan {
            proxy: ChildSpec::tor(&self.base_dir),
            node: ChildSpec::node(&self.base_dir, self.variant, &self.datadir, &self.conf),
            version_label: self.version_label.clone(),
            readiness: self.readiness.clone(),
        }
    }
}

/// Default node data directory under the base directory
pub fn default_datadir(base_dir: &Path) -> PathBuf {
    base_dir.join(".bitcoin")
}

/// Default node configuration file inside the data directory
pub fn default_conf(datadir: &Path) -> PathBuf {
    datadir.join("bitcoin.conf")
}

/// The two children of one start request, proxy first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub proxy: ChildSpec,
    pub node: ChildSpec,
    pub version_label: String,
    pub readiness: Option<ReadinessProbe>,
}

/// Tuning for the supervisor itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// How long a terminated child may take to exit before it is killed
    pub stop_grace: Duration,

    /// How long to wait for output drains once their child is gone
    pub drain_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Persisted host preferences, loaded from a JSON file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub base_dir: Option<PathBuf>,
    pub variant: Option<NodeVariant>,
    pub datadir: Option<PathBuf>,
    pub conf: Option<PathBuf>,
    pub version_label: Option<String>,
}

impl HostSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("Invalid settings file {:?}", path))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse settings JSON")
    }
}
