//! VM configuration assembly.
//!
//! [`ConfigurationBuilder::build`] turns hardware requirements and a bundle
//! into a validated [`VmConfiguration`]. Side effects, in order: identity
//! files, auxiliary storage, sparse primary disk. All of them are reused when
//! already present, so building twice against the same bundle is safe.
//! Async callers use [`ConfigurationBuilder::build_blocking`], which runs the
//! file work on the blocking pool.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::{EngineError, Hypervisor};
use crate::vm::bundle::{BundleLocation, create_sparse_disk};
use crate::vm::error::{VmError, VmResult};
use crate::vm::identity;
use crate::vm::{Display, HardwareModel, HardwareRequirements, Policy};

/// Boot loader flavour. Only macOS guests are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootLoaderKind {
    MacOs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    pub path: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkDevice {
    Nat,
}

/// Host audio streams wired into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioDevice {
    pub input: bool,
    pub output: bool,
}

/// Everything that ties the guest to this particular bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformIdentity {
    pub hardware_model: HardwareModel,
    pub machine_identifier: Vec<u8>,
    pub auxiliary_storage: PathBuf,
    /// Where `machine_identifier` is persisted.
    pub machine_identifier_path: PathBuf,
    /// Where `hardware_model` is persisted.
    pub hardware_model_path: PathBuf,
}

/// A complete, validated machine description. Built once per start or
/// install and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfiguration {
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub boot_loader: BootLoaderKind,
    pub platform: PlatformIdentity,
    pub displays: Vec<Display>,
    pub storage: Vec<StorageDevice>,
    pub network: Vec<NetworkDevice>,
    pub keyboard: bool,
    pub pointing_device: bool,
    pub audio: Vec<AudioDevice>,
}

impl VmConfiguration {
    /// The primary (boot) disk.
    pub fn primary_disk(&self) -> Option<&StorageDevice> {
        self.storage.first()
    }
}

/// Assembles configurations for one engine under one policy.
#[derive(Clone)]
pub struct ConfigurationBuilder {
    hypervisor: Arc<dyn Hypervisor>,
    policy: Policy,
}

impl ConfigurationBuilder {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, policy: Policy) -> Self {
        Self { hypervisor, policy }
    }

    /// [`Self::build`] on the blocking pool.
    pub async fn build_blocking(
        &self,
        location: &BundleLocation,
        requirements: &HardwareRequirements,
    ) -> VmResult<VmConfiguration> {
        let builder = self.clone();
        let location = location.clone();
        let requirements = requirements.clone();
        tokio::task::spawn_blocking(move || builder.build(&location, &requirements))
            .await
            .map_err(|e| VmError::Engine(EngineError::Failed(format!("configuration task: {e}"))))?
    }

    pub fn build(
        &self,
        location: &BundleLocation,
        requirements: &HardwareRequirements,
    ) -> VmResult<VmConfiguration> {
        let cpu_count = requirements.min_cpu.max(self.policy.min_cpus);
        let memory_bytes = requirements
            .min_memory_bytes
            .max(self.policy.min_memory_bytes);

        let identity = identity::load_or_create(
            location,
            self.hypervisor.as_ref(),
            &requirements.hardware_model,
        )?;

        if location.auxiliary_storage.exists() {
            debug!(path = %location.auxiliary_storage.display(), "reusing auxiliary storage");
        } else {
            self.hypervisor
                .create_auxiliary_storage(&location.auxiliary_storage, &identity.hardware_model)
                .map_err(|e| match e {
                    EngineError::Io(source) => VmError::storage(&location.auxiliary_storage, source),
                    other => VmError::Engine(other),
                })?;
            info!(path = %location.auxiliary_storage.display(), "created auxiliary storage");
        }

        if !location.disk.exists() {
            create_sparse_disk(&location.disk, self.policy.disk_size_bytes)
                .map_err(|e| VmError::storage(&location.disk, e))?;
        }

        let config = VmConfiguration {
            cpu_count,
            memory_bytes,
            boot_loader: BootLoaderKind::MacOs,
            platform: PlatformIdentity {
                hardware_model: identity.hardware_model,
                machine_identifier: identity.identifier,
                auxiliary_storage: location.auxiliary_storage.clone(),
                machine_identifier_path: location.machine_identifier.clone(),
                hardware_model_path: location.hardware_model.clone(),
            },
            displays: vec![self.policy.display],
            storage: vec![StorageDevice {
                path: location.disk.clone(),
                read_only: false,
            }],
            network: vec![NetworkDevice::Nat],
            keyboard: true,
            pointing_device: true,
            audio: vec![AudioDevice {
                input: true,
                output: true,
            }],
        };

        self.hypervisor.validate(&config).map_err(|e| match e {
            EngineError::Rejected(details) => VmError::InvalidConfiguration(details),
            other => VmError::InvalidConfiguration(other.to_string()),
        })?;

        info!(
            engine = self.hypervisor.name(),
            cpus = config.cpu_count,
            memory_gib = config.memory_bytes / crate::vm::GIB,
            "VM configuration built"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::simulated::SimulatedHypervisor;
    use crate::vm::GIB;

    fn requirements(cpu: u32, memory_gib: u64) -> HardwareRequirements {
        HardwareRequirements {
            min_cpu: cpu,
            min_memory_bytes: memory_gib * GIB,
            hardware_model: HardwareModel(b"sim-model".to_vec()),
        }
    }

    fn builder(engine: SimulatedHypervisor) -> ConfigurationBuilder {
        ConfigurationBuilder::new(Arc::new(engine), Policy::default())
    }

    #[test]
    fn floors_apply_to_small_requirements() {
        let tmp = tempfile::tempdir().unwrap();
        let location = BundleLocation::resolve(tmp.path()).unwrap();

        let config = builder(SimulatedHypervisor::default())
            .build(&location, &requirements(2, 4))
            .unwrap();

        assert_eq!(config.cpu_count, 4);
        assert_eq!(config.memory_bytes, 8 * GIB);
    }

    #[test]
    fn larger_requirements_win_over_floors() {
        let tmp = tempfile::tempdir().unwrap();
        let location = BundleLocation::resolve(tmp.path()).unwrap();

        let config = builder(SimulatedHypervisor::default())
            .build(&location, &requirements(6, 12))
            .unwrap();

        assert_eq!(config.cpu_count, 6);
        assert_eq!(config.memory_bytes, 12 * GIB);
    }

    #[test]
    fn build_allocates_bundle_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let location = BundleLocation::resolve(tmp.path()).unwrap();

        let config = builder(SimulatedHypervisor::default())
            .build(&location, &requirements(4, 8))
            .unwrap();

        assert_eq!(std::fs::metadata(&location.disk).unwrap().len(), 80 * GIB);
        assert!(location.auxiliary_storage.exists());
        assert!(location.machine_identifier.exists());
        assert_eq!(config.primary_disk().unwrap().path, location.disk);
        assert_eq!(config.network, vec![NetworkDevice::Nat]);
        assert_eq!(config.displays[0].width, 1920);
    }

    #[tokio::test]
    async fn blocking_build_creates_bundle_files() {
        let tmp = tempfile::tempdir().unwrap();
        let location = BundleLocation::resolve(tmp.path()).unwrap();

        let config = builder(SimulatedHypervisor::default())
            .build_blocking(&location, &requirements(4, 8))
            .await
            .unwrap();

        assert_eq!(config.primary_disk().unwrap().path, location.disk);
        assert!(location.disk.exists());
        assert!(location.auxiliary_storage.exists());
    }

    #[test]
    fn existing_disk_is_not_reallocated() {
        let tmp = tempfile::tempdir().unwrap();
        let location = BundleLocation::resolve(tmp.path()).unwrap();
        create_sparse_disk(&location.disk, 30 * GIB).unwrap();

        builder(SimulatedHypervisor::default())
            .build(&location, &requirements(4, 8))
            .unwrap();

        assert_eq!(std::fs::metadata(&location.disk).unwrap().len(), 30 * GIB);
    }

    #[test]
    fn rejected_configuration_maps_to_invalid_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let location = BundleLocation::resolve(tmp.path()).unwrap();
        let engine = SimulatedHypervisor::default().with_max_cpus(2);

        let err = builder(engine)
            .build(&location, &requirements(4, 8))
            .unwrap_err();

        assert!(matches!(err, VmError::InvalidConfiguration(_)), "got {err:?}");
    }
}
