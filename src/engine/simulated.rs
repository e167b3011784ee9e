//! In-process engine used for dry runs and tests.
//!
//! Nothing is virtualized. Installation walks a fixed number of progress
//! steps and then writes a small payload to the start of the primary disk in
//! place of a guest system. Instances are plain handles whose guest can be
//! told to shut down or crash from the outside.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::{
    ConfigurationVariant, EngineError, Hypervisor, InstanceEvent, RestoreImageInfo, Started,
    VmInstance,
};
use crate::vm::configuration::VmConfiguration;
use crate::vm::progress::ProgressReporter;
use crate::vm::{GIB, HardwareModel, OsVersion};

const ENGINE: &str = "simulated";

/// Default size of the data an install writes to the disk.
pub const DEFAULT_INSTALL_PAYLOAD: u64 = 64 * 1024 * 1024;

const PAYLOAD_CHUNK: usize = 1024 * 1024;

/// Engine double with configurable timings and failures.
#[derive(Clone)]
pub struct SimulatedHypervisor {
    variants: Vec<ConfigurationVariant>,
    version: OsVersion,
    build: String,
    max_cpus: u32,
    install_steps: u32,
    step_delay: Duration,
    start_delay: Duration,
    stop_delay: Duration,
    install_payload_bytes: u64,
    install_failure: Option<String>,
    start_failure: Option<String>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    installs: AtomicUsize,
    starts: AtomicUsize,
    current: Mutex<Option<Arc<SimulatedInstance>>>,
}

impl Default for SimulatedHypervisor {
    fn default() -> Self {
        Self {
            variants: vec![ConfigurationVariant {
                revision: 1,
                min_cpu: 2,
                min_memory_bytes: 4 * GIB,
                hardware_model: HardwareModel(b"simulated-virtualmac".to_vec()),
                supported_by_host: true,
            }],
            version: OsVersion {
                major: 15,
                minor: 1,
                patch: 0,
            },
            build: "24B83".into(),
            max_cpus: 64,
            install_steps: 10,
            step_delay: Duration::from_millis(5),
            start_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            install_payload_bytes: DEFAULT_INSTALL_PAYLOAD,
            install_failure: None,
            start_failure: None,
            shared: Arc::new(Shared::default()),
        }
    }
}

impl SimulatedHypervisor {
    pub fn with_variants(mut self, variants: Vec<ConfigurationVariant>) -> Self {
        self.variants = variants;
        self
    }

    /// Configurations asking for more CPUs than this are rejected.
    pub fn with_max_cpus(mut self, max_cpus: u32) -> Self {
        self.max_cpus = max_cpus;
        self
    }

    pub fn with_install_steps(mut self, steps: u32) -> Self {
        self.install_steps = steps.max(1);
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    /// Bytes written to the primary disk when installation succeeds. Zero
    /// leaves the disk untouched.
    pub fn with_install_payload(mut self, bytes: u64) -> Self {
        self.install_payload_bytes = bytes;
        self
    }

    /// Fail installation halfway through with `reason`.
    pub fn failing_install(mut self, reason: impl Into<String>) -> Self {
        self.install_failure = Some(reason.into());
        self
    }

    pub fn failing_start(mut self, reason: impl Into<String>) -> Self {
        self.start_failure = Some(reason.into());
        self
    }

    /// Number of `install` calls so far.
    pub fn install_count(&self) -> usize {
        self.shared.installs.load(Ordering::SeqCst)
    }

    /// Number of successful `start` calls so far.
    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    /// The most recently started instance, if any.
    pub fn current_instance(&self) -> Option<Arc<SimulatedInstance>> {
        self.shared.current.lock().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn inspect_image(&self, image: &Path) -> Result<RestoreImageInfo, EngineError> {
        let meta = tokio::fs::metadata(image)
            .await
            .map_err(|e| EngineError::UnreadableImage {
                path: image.to_path_buf(),
                reason: e.to_string(),
            })?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(EngineError::UnreadableImage {
                path: image.to_path_buf(),
                reason: "not a non-empty regular file".into(),
            });
        }

        Ok(RestoreImageInfo {
            version: Some(self.version),
            build: Some(self.build.clone()),
            variants: self.variants.clone(),
        })
    }

    fn new_machine_identifier(&self) -> Vec<u8> {
        uuid::Uuid::new_v4().as_bytes().to_vec()
    }

    fn create_auxiliary_storage(
        &self,
        path: &Path,
        model: &HardwareModel,
    ) -> Result<(), EngineError> {
        let mut contents = b"simulated-aux:".to_vec();
        contents.extend_from_slice(model.as_bytes());
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self, config: &VmConfiguration) -> Result<(), EngineError> {
        if config.cpu_count == 0 || config.cpu_count > self.max_cpus {
            return Err(EngineError::Rejected(format!(
                "cpu count {} outside 1..={}",
                config.cpu_count, self.max_cpus
            )));
        }
        if config.memory_bytes == 0 {
            return Err(EngineError::Rejected("memory size is zero".into()));
        }
        if config.primary_disk().is_none() {
            return Err(EngineError::Rejected("no boot disk attached".into()));
        }
        Ok(())
    }

    async fn install(
        &self,
        config: &VmConfiguration,
        image: &Path,
        mut progress: ProgressReporter,
    ) -> Result<(), EngineError> {
        self.shared.installs.fetch_add(1, Ordering::SeqCst);
        self.inspect_image(image).await?;
        info!(image = %image.display(), steps = self.install_steps, "simulated install started");

        let fail_at = self
            .install_failure
            .as_ref()
            .map(|_| self.install_steps.div_ceil(2));

        for step in 1..=self.install_steps {
            tokio::time::sleep(self.step_delay).await;
            if fail_at == Some(step) {
                let reason = self.install_failure.clone().unwrap_or_default();
                return Err(EngineError::Failed(reason));
            }
            progress.report(f64::from(step) / f64::from(self.install_steps));
        }

        if self.install_payload_bytes > 0 {
            let disk = config
                .primary_disk()
                .ok_or_else(|| EngineError::Rejected("no boot disk attached".into()))?;
            write_payload(&disk.path, self.install_payload_bytes).await?;
        }

        info!("simulated install finished");
        Ok(())
    }

    async fn start(&self, config: &VmConfiguration) -> Result<Started, EngineError> {
        tokio::time::sleep(self.start_delay).await;
        if let Some(reason) = &self.start_failure {
            return Err(EngineError::Failed(reason.clone()));
        }
        if let Some(disk) = config.primary_disk() {
            if !disk.path.exists() {
                return Err(EngineError::Failed(format!(
                    "boot disk {} missing",
                    disk.path.display()
                )));
            }
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let instance = Arc::new(SimulatedInstance {
            events: events_tx,
            running: AtomicBool::new(true),
            stop_delay: self.stop_delay,
        });
        if let Ok(mut slot) = self.shared.current.lock() {
            *slot = Some(Arc::clone(&instance));
        }
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        info!(cpus = config.cpu_count, "simulated instance running");

        Ok(Started {
            instance,
            events,
        })
    }
}

/// Overwrite the first `bytes` of `disk` with non-zero data so the blocks
/// are really allocated.
async fn write_payload(disk: &Path, bytes: u64) -> Result<(), EngineError> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(disk).await?;
    let chunk = vec![0xA5u8; PAYLOAD_CHUNK];
    let mut remaining = bytes;
    while remaining > 0 {
        let n = remaining.min(PAYLOAD_CHUNK as u64) as usize;
        file.write_all(&chunk[..n]).await?;
        remaining -= n as u64;
    }
    file.sync_all().await?;
    debug!(disk = %disk.display(), bytes, "simulated guest written");
    Ok(())
}

/// A simulated running guest.
pub struct SimulatedInstance {
    events: mpsc::UnboundedSender<InstanceEvent>,
    running: AtomicBool,
    stop_delay: Duration,
}

impl SimulatedInstance {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The guest powers itself off.
    pub fn guest_shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(InstanceEvent::GuestStopped);
        }
    }

    /// The host loses the instance.
    pub fn crash(&self, reason: impl Into<String>) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(InstanceEvent::StoppedWithError(reason.into()));
        }
    }
}

#[async_trait]
impl VmInstance for SimulatedInstance {
    async fn stop(&self) -> Result<(), EngineError> {
        tokio::time::sleep(self.stop_delay).await;
        // Explicit stops are answered through the return value only.
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("stop requested for an instance that already stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inspect_rejects_missing_image() {
        let engine = SimulatedHypervisor::default();
        let err = engine
            .inspect_image(Path::new("/nonexistent/RestoreImage.ipsw"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnreadableImage { .. }));
    }

    #[test]
    fn identifiers_are_unique() {
        let engine = SimulatedHypervisor::default();
        assert_ne!(engine.new_machine_identifier(), engine.new_machine_identifier());
    }

    #[tokio::test]
    async fn guest_shutdown_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let instance = SimulatedInstance {
            events: tx,
            running: AtomicBool::new(true),
            stop_delay: Duration::ZERO,
        };

        instance.guest_shutdown();
        instance.guest_shutdown();
        instance.crash("late");

        assert_eq!(rx.recv().await, Some(InstanceEvent::GuestStopped));
        assert!(rx.try_recv().is_err());
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn explicit_stop_emits_no_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let instance = SimulatedInstance {
            events: tx,
            running: AtomicBool::new(true),
            stop_delay: Duration::ZERO,
        };

        instance.stop().await.unwrap();

        assert!(!instance.is_running());
        assert!(rx.try_recv().is_err());
    }
}
