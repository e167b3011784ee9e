//! Guest installation onto the bundle's primary disk.
//!
//! At most one installation runs per [`Installer`]. The engine does the work;
//! afterwards the bundle's own `is_installed` predicate decides whether the
//! result counts.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

use crate::engine::Hypervisor;
use crate::vm::Policy;
use crate::vm::bundle::BundleLocation;
use crate::vm::configuration::VmConfiguration;
use crate::vm::error::{VmError, VmResult};
use crate::vm::progress::ProgressReporter;

#[derive(Clone)]
pub struct Installer {
    hypervisor: Arc<dyn Hypervisor>,
    policy: Policy,
    active: Arc<AtomicBool>,
}

/// Held for the duration of one installation.
struct InstallGuard {
    active: Arc<AtomicBool>,
}

impl InstallGuard {
    fn acquire(active: &Arc<AtomicBool>) -> Option<Self> {
        active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Installer {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, policy: Policy) -> Self {
        Self {
            hypervisor,
            policy,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Install the guest from `image` using `config`.
    ///
    /// A partial bundle is left in place on failure so the caller can retry.
    pub async fn install(
        &self,
        location: &BundleLocation,
        config: &VmConfiguration,
        image: &Path,
        progress: ProgressReporter,
    ) -> VmResult<()> {
        let _guard = InstallGuard::acquire(&self.active).ok_or(VmError::AlreadyInProgress)?;

        info!(
            engine = self.hypervisor.name(),
            image = %image.display(),
            disk = %location.disk.display(),
            "installing guest"
        );

        if let Err(e) = self.hypervisor.install(config, image, progress).await {
            error!(error = %e, "installation failed");
            return Err(VmError::InstallFailed(e.to_string()));
        }

        if !location.status(&self.policy).is_installed {
            error!(disk = %location.disk.display(), "engine finished but bundle is not installed");
            return Err(VmError::InstallFailed(
                "installation finished but the disk does not look installed".into(),
            ));
        }

        info!("installation complete");
        Ok(())
    }
}
