//! User settings for macvm.
//!
//! Loaded from `config.toml` (see [`crate::paths`]). Every section is
//! `#[serde(default)]`, so an absent file, an empty file and a file that sets
//! a single key are all valid.
//!
//! ```toml
//! [bundle]
//! root = "~/VMs/Sequoia.bundle"
//!
//! [machine]
//! min_memory_gib = 16
//!
//! [engine]
//! kind = "simulated"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};
use url::Url;

use crate::engine::simulated::SimulatedHypervisor;
use crate::engine::vfkit::VfkitOptions;
use crate::paths::MacvmPaths;
use crate::vm::{Display, GIB, Policy};

const MIB: u64 = 1024 * 1024;

const DEFAULT_CATALOG_URL: &str = "https://api.ipsw.me/v4/device/VirtualMac2,1?type=ipsw";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Settings {
    pub bundle: BundleSettings,
    pub machine: MachineSettings,
    pub catalog: CatalogSettings,
    pub engine: EngineSettings,
}

// --- Sections ---

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct BundleSettings {
    /// Bundle directory; `~/MacVM.bundle` when unset.
    pub root: Option<PathBuf>,
    pub disk_size_gib: u64,
    /// Disk size from which the bundle counts as installed.
    pub installed_threshold_gib: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct MachineSettings {
    pub min_cpus: u32,
    pub min_memory_gib: u64,
    pub display_width: u32,
    pub display_height: u32,
    pub display_ppi: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct EngineSettings {
    pub kind: EngineKind,
    pub vfkit: VfkitSettings,
    pub simulated: SimulatedSettings,
}

/// Which virtualization engine drives the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Vfkit,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct VfkitSettings {
    pub binary: Option<PathBuf>,
    pub rest_port: u16,
    pub stop_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SimulatedSettings {
    pub install_steps: u32,
    pub step_delay_ms: u64,
    /// Guest data written by a simulated install, in MiB.
    pub payload_mib: u64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for BundleSettings {
    fn default() -> Self {
        Self {
            root: None,
            disk_size_gib: 80,
            installed_threshold_gib: 20,
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            min_cpus: 4,
            min_memory_gib: 8,
            display_width: 1920,
            display_height: 1200,
            display_ppi: 144,
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CATALOG_URL.to_string(),
        }
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            EngineKind::Vfkit
        } else {
            EngineKind::Simulated
        }
    }
}

impl Default for VfkitSettings {
    fn default() -> Self {
        let options = VfkitOptions::default();
        Self {
            binary: None,
            rest_port: options.rest_port,
            stop_timeout_secs: options.stop_timeout.as_secs(),
            poll_interval_secs: options.poll_interval.as_secs(),
        }
    }
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            install_steps: 20,
            step_delay_ms: 150,
            payload_mib: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and derived values
// ---------------------------------------------------------------------------

impl Settings {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serialize settings")
    }

    /// Read and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = match std::fs::read_to_string(path) {
            Ok(text) => {
                let parsed = Self::from_toml(&text)
                    .with_context(|| format!("parse {}", path.display()))?;
                info!(path = %path.display(), "loaded settings");
                parsed
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine.min_cpus == 0 {
            bail!("machine.min_cpus must be at least 1");
        }
        if self.machine.min_memory_gib == 0 {
            bail!("machine.min_memory_gib must be at least 1");
        }
        if self.bundle.installed_threshold_gib == 0 {
            bail!("bundle.installed_threshold_gib must be at least 1");
        }
        if self.bundle.disk_size_gib == 0 {
            bail!("bundle.disk_size_gib must be at least 1");
        }
        if self.engine.simulated.payload_mib == 0 {
            bail!("engine.simulated.payload_mib must be at least 1");
        }
        self.catalog_url()?;
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        Policy {
            min_cpus: self.machine.min_cpus,
            min_memory_bytes: self.machine.min_memory_gib * GIB,
            disk_size_bytes: self.bundle.disk_size_gib * GIB,
            installed_threshold_bytes: self.bundle.installed_threshold_gib * GIB,
            display: Display {
                width: self.machine.display_width,
                height: self.machine.display_height,
                ppi: self.machine.display_ppi,
            },
        }
    }

    /// Policy for bundles driven by `kind`. A simulated install writes far
    /// less than a real guest, so its threshold is the simulated payload.
    pub fn policy_for(&self, kind: EngineKind) -> Policy {
        let mut policy = self.policy();
        if kind == EngineKind::Simulated {
            policy.installed_threshold_bytes = self.simulated_payload_bytes();
        }
        policy
    }

    fn simulated_payload_bytes(&self) -> u64 {
        self.engine.simulated.payload_mib * MIB
    }

    pub fn catalog_url(&self) -> Result<Url> {
        Url::parse(&self.catalog.url).with_context(|| format!("catalog.url {:?}", self.catalog.url))
    }

    /// Configured bundle root with `~` expanded, or the default location.
    pub fn bundle_root(&self, paths: &MacvmPaths) -> PathBuf {
        match &self.bundle.root {
            Some(root) => paths.expand_tilde(root),
            None => paths.default_bundle(),
        }
    }

    pub fn vfkit_options(&self, paths: &MacvmPaths) -> VfkitOptions {
        let vfkit = &self.engine.vfkit;
        VfkitOptions {
            binary: vfkit.binary.as_deref().map(|b| paths.expand_tilde(b)),
            rest_port: vfkit.rest_port,
            stop_timeout: Duration::from_secs(vfkit.stop_timeout_secs),
            poll_interval: Duration::from_secs(vfkit.poll_interval_secs.max(1)),
        }
    }

    pub fn simulated_engine(&self) -> SimulatedHypervisor {
        let sim = &self.engine.simulated;
        SimulatedHypervisor::default()
            .with_install_steps(sim.install_steps)
            .with_step_delay(Duration::from_millis(sim.step_delay_ms))
            .with_install_payload(self.simulated_payload_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
