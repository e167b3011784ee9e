//! Virtualization engine seam.
//!
//! The orchestrator never talks to a hypervisor directly. Everything it needs
//! from the platform goes through [`Hypervisor`] (image inspection, identity
//! and auxiliary storage creation, validation, installation, boot) and the
//! [`VmInstance`] handle returned by [`Hypervisor::start`].
//!
//! ```text
//! Hypervisor
//!     ├─► inspect_image()            → RestoreImageInfo { variants }
//!     ├─► validate(&VmConfiguration)
//!     ├─► install(&VmConfiguration, image, ProgressReporter)
//!     └─► start(&VmConfiguration)    → Started { instance, events }
//!                                          ├─► instance.stop()
//!                                          └─► events: GuestStopped | StoppedWithError
//! ```
//!
//! Two engines ship with the crate: [`vfkit::VfkitHypervisor`] (macOS only)
//! and [`simulated::SimulatedHypervisor`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::vm::configuration::VmConfiguration;
use crate::vm::progress::ProgressReporter;
use crate::vm::{HardwareModel, OsVersion};

pub mod simulated;
pub mod vfkit;

/// Errors reported by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The restore image could not be opened or parsed.
    #[error("cannot read restore image {}: {reason}", path.display())]
    UnreadableImage { path: PathBuf, reason: String },

    /// The engine has no implementation for this capability.
    #[error("{engine} engine does not support {capability}")]
    Unsupported {
        engine: &'static str,
        capability: &'static str,
    },

    /// The platform rejected a configuration.
    #[error("{0}")]
    Rejected(String),

    /// I/O against bundle files failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other engine failure.
    #[error("{0}")]
    Failed(String),
}

/// One configuration a restore image can run with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationVariant {
    /// Feature revision; higher is more capable.
    pub revision: u32,
    pub min_cpu: u32,
    pub min_memory_bytes: u64,
    pub hardware_model: HardwareModel,
    /// Whether this host can run the variant.
    pub supported_by_host: bool,
}

/// What an engine learns by opening a restore image.
#[derive(Debug, Clone, Default)]
pub struct RestoreImageInfo {
    pub version: Option<OsVersion>,
    pub build: Option<String>,
    pub variants: Vec<ConfigurationVariant>,
}

/// Notifications a running instance delivers without a caller asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// The guest shut itself down.
    GuestStopped,
    /// The host detected a failure and the instance is gone.
    StoppedWithError(String),
}

impl fmt::Display for InstanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceEvent::GuestStopped => write!(f, "guest stopped"),
            InstanceEvent::StoppedWithError(reason) => write!(f, "stopped with error: {reason}"),
        }
    }
}

/// Receiving half of an instance's notification stream.
pub type InstanceEvents = mpsc::UnboundedReceiver<InstanceEvent>;

/// A live VM created by [`Hypervisor::start`].
#[async_trait]
pub trait VmInstance: Send + Sync {
    /// Request a graceful stop and wait until it took effect.
    async fn stop(&self) -> Result<(), EngineError>;
}

/// A freshly started instance plus its notification stream.
pub struct Started {
    pub instance: Arc<dyn VmInstance>,
    pub events: InstanceEvents,
}

impl fmt::Debug for Started {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Started").finish_non_exhaustive()
    }
}

/// The platform virtualization capability.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Short engine name used in logs.
    fn name(&self) -> &'static str;

    /// Open a restore image and list the configurations it offers.
    async fn inspect_image(&self, image: &Path) -> Result<RestoreImageInfo, EngineError>;

    /// Produce a fresh, opaque machine identifier.
    fn new_machine_identifier(&self) -> Vec<u8>;

    /// Create auxiliary boot storage at `path` for `model`.
    fn create_auxiliary_storage(&self, path: &Path, model: &HardwareModel)
    -> Result<(), EngineError>;

    /// Check a configuration against platform limits.
    fn validate(&self, config: &VmConfiguration) -> Result<(), EngineError>;

    /// Install the guest from `image` onto the configuration's disk.
    async fn install(
        &self,
        config: &VmConfiguration,
        image: &Path,
        progress: ProgressReporter,
    ) -> Result<(), EngineError>;

    /// Boot an installed guest.
    async fn start(&self, config: &VmConfiguration) -> Result<Started, EngineError>;
}
