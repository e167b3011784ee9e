//! VM management module for macvm.
//!
//! Provides the bundle store, restore image acquisition, requirement
//! resolution, configuration assembly, installation and the lifecycle
//! controller, all driven through the [`orchestrator::Orchestrator`].

use std::fmt;
use std::path::PathBuf;

use url::Url;

pub mod bundle;
pub mod catalog;
pub mod configuration;
pub mod download;
pub mod error;
pub mod identity;
pub mod image;
pub mod installer;
pub mod lifecycle;
pub mod orchestrator;
pub mod progress;
pub mod requirements;

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Opaque hardware-model descriptor taken from a restore image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HardwareModel(pub Vec<u8>);

impl HardwareModel {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Minimum resources and hardware model an installation image demands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareRequirements {
    pub min_cpu: u32,
    pub min_memory_bytes: u64,
    pub hardware_model: HardwareModel,
}

/// Guest operating system version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OsVersion {
    /// Parse `"15.1"` or `"15.1.1"`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

/// A restore image listed by the catalog but not yet downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub version: OsVersion,
    pub build: String,
    pub url: Url,
    /// Size advertised by the catalog, if any.
    pub size: Option<u64>,
}

/// A restore image present in the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationImage {
    pub path: PathBuf,
    pub version: Option<OsVersion>,
    pub build: Option<String>,
    pub source_url: Option<Url>,
}

impl fmt::Display for InstallationImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.version, &self.build) {
            (Some(v), Some(b)) => write!(f, "macOS {v} (build {b})"),
            (Some(v), None) => write!(f, "macOS {v}"),
            _ => write!(f, "{}", self.path.display()),
        }
    }
}

/// A display attached to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Display {
    pub width: u32,
    pub height: u32,
    pub ppi: u32,
}

/// Policy constants applied when sizing and detecting a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// CPU floor applied on top of the image requirement.
    pub min_cpus: u32,
    /// Memory floor applied on top of the image requirement.
    pub min_memory_bytes: u64,
    /// Size of a freshly allocated primary disk.
    pub disk_size_bytes: u64,
    /// Disk size at which a bundle counts as installed.
    pub installed_threshold_bytes: u64,
    pub display: Display,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            min_cpus: 4,
            min_memory_bytes: 8 * GIB,
            disk_size_bytes: 80 * GIB,
            installed_threshold_bytes: 20 * GIB,
            display: Display {
                width: 1920,
                height: 1200,
                ppi: 144,
            },
        }
    }
}

/// The single authoritative state published to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    /// The bundle root has not been resolved yet.
    Unconfigured,
    ImageMissing,
    ImagePresent,
    Installing(f64),
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl LifecycleState {
    /// Whether a VM instance may exist in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => write!(f, "not configured"),
            Self::ImageMissing => write!(f, "image missing"),
            Self::ImagePresent => write!(f, "awaiting install"),
            Self::Installing(p) => write!(f, "installing ({:.0}%)", p * 100.0),
            Self::Installed => write!(f, "installed (stopped)"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Answer to `check-status`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub has_image: bool,
    pub is_installed: bool,
    pub state: LifecycleState,
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use bundle::{BundleLocation, BundleStatus};
pub use configuration::VmConfiguration;
pub use error::{VmError, VmResult};
pub use orchestrator::{Orchestrator, Services};
pub use progress::{ProgressReporter, ProgressStream, ProgressUpdate};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_version_parses_two_and_three_components() {
        assert_eq!(
            OsVersion::parse("15.1"),
            Some(OsVersion {
                major: 15,
                minor: 1,
                patch: 0
            })
        );
        assert_eq!(
            OsVersion::parse("14.6.1"),
            Some(OsVersion {
                major: 14,
                minor: 6,
                patch: 1
            })
        );
        assert_eq!(OsVersion::parse("15"), OsVersion::parse("15.0"));
        assert_eq!(OsVersion::parse("15.x"), None);
        assert_eq!(OsVersion::parse("1.2.3.4"), None);
    }

    #[test]
    fn os_version_orders_numerically() {
        assert!(OsVersion::parse("15.10").unwrap() > OsVersion::parse("15.9").unwrap());
        assert_eq!(OsVersion::parse("14.6.1").unwrap().to_string(), "14.6.1");
        assert_eq!(OsVersion::parse("15.0").unwrap().to_string(), "15.0");
    }

    #[test]
    fn lifecycle_state_summaries() {
        assert_eq!(LifecycleState::Running.to_string(), "running");
        assert_eq!(LifecycleState::Installed.to_string(), "installed (stopped)");
        assert_eq!(LifecycleState::Installing(0.42).to_string(), "installing (42%)");
        assert!(LifecycleState::Stopping.is_live());
        assert!(!LifecycleState::Failed("x".into()).is_live());
    }

    #[test]
    fn default_policy_floors() {
        let policy = Policy::default();
        assert_eq!(policy.min_cpus, 4);
        assert_eq!(policy.min_memory_bytes, 8 * GIB);
        assert_eq!(policy.installed_threshold_bytes, 20 * GIB);
    }
}
