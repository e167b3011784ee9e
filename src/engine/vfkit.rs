//! macOS guest engine backed by vfkit (a Virtualization.framework CLI).
//!
//! Only macOS on Apple Silicon can run it. Elsewhere a stub is provided that
//! refuses construction, so the rest of the crate compiles unconditionally.
//!
//! ## Architecture
//!
//! ```text
//! VfkitHypervisor::start(VmConfiguration)
//!     └─► tokio::process::Command  →  vfkit child process
//!             └─► VfkitInstance { child, rest_port }
//!                     ├─► monitor task  (polls GET /vm/state, emits InstanceEvent)
//!                     └─► stop()        (PUT /vm/state {"state":"Stop"})
//! ```
//!
//! vfkit boots and stops guests but cannot run the restore flow, so
//! `install` and `create_auxiliary_storage` report `Unsupported`.
use std::path::PathBuf;
use std::time::Duration;

use crate::vm::configuration::{NetworkDevice, VmConfiguration};

/// Tunables for the vfkit engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfkitOptions {
    /// Explicit binary path. `None` searches `PATH` and Homebrew prefixes.
    pub binary: Option<PathBuf>,
    pub rest_port: u16,
    /// How long an explicit stop waits for the process before killing it.
    pub stop_timeout: Duration,
    /// Interval of the guest health check.
    pub poll_interval: Duration,
}

impl Default for VfkitOptions {
    fn default() -> Self {
        Self {
            binary: None,
            rest_port: 47_321,
            stop_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Command-line arguments that boot `config` with the REST API on
/// `rest_port`.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn vfkit_args(config: &VmConfiguration, rest_port: u16) -> Vec<String> {
    let platform = &config.platform;
    let mut args = vec![
        "--bootloader".to_string(),
        format!(
            "macos,machineIdentifierPath={},hardwareModelPath={},auxImagePath={}",
            platform.machine_identifier_path.display(),
            platform.hardware_model_path.display(),
            platform.auxiliary_storage.display()
        ),
        "--cpus".to_string(),
        config.cpu_count.to_string(),
        "--memory".to_string(),
        (config.memory_bytes / (1024 * 1024)).to_string(),
    ];

    let mut device = |spec: String| {
        args.push("--device".to_string());
        args.push(spec);
    };

    for disk in &config.storage {
        let mut spec = format!("virtio-blk,path={}", disk.path.display());
        if disk.read_only {
            spec.push_str(",readonly");
        }
        device(spec);
    }
    for net in &config.network {
        match net {
            NetworkDevice::Nat => device("virtio-net,nat".to_string()),
        }
    }
    if config.keyboard {
        device("virtio-input,keyboard".to_string());
    }
    if config.pointing_device {
        device("virtio-input,pointing".to_string());
    }
    for display in &config.displays {
        device(format!(
            "virtio-gpu,width={},height={}",
            display.width, display.height
        ));
    }

    if !config.displays.is_empty() {
        args.push("--gui".to_string());
    }
    args.push("--restful-uri".to_string());
    args.push(format!("tcp://localhost:{rest_port}"));
    args
}

// ---------------------------------------------------------------------------
// macOS implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod imp {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::process::{Child, Command};
    use tokio::sync::{Mutex, mpsc};
    use tracing::{debug, error, info, warn};

    use super::{VfkitOptions, vfkit_args};
    use crate::engine::{
        ConfigurationVariant, EngineError, Hypervisor, InstanceEvent, RestoreImageInfo, Started,
        VmInstance,
    };
    use crate::vm::configuration::VmConfiguration;
    use crate::vm::progress::ProgressReporter;
    use crate::vm::{GIB, HardwareModel};

    const ENGINE: &str = "vfkit";

    pub struct VfkitHypervisor {
        options: VfkitOptions,
    }

    impl VfkitHypervisor {
        /// Refuses hosts that cannot virtualize macOS guests.
        pub fn new(options: VfkitOptions) -> Result<Self, EngineError> {
            if !cfg!(target_arch = "aarch64") {
                return Err(EngineError::Unsupported {
                    engine: ENGINE,
                    capability: "macOS guests on Intel hosts",
                });
            }
            Ok(Self { options })
        }

        /// Resolve the `vfkit` binary from the options, `PATH`, or Homebrew.
        fn find_vfkit(&self) -> Result<PathBuf, EngineError> {
            if let Some(binary) = &self.options.binary {
                return if binary.exists() {
                    Ok(binary.clone())
                } else {
                    Err(EngineError::Failed(format!(
                        "configured vfkit binary {} does not exist",
                        binary.display()
                    )))
                };
            }

            if let Ok(path_var) = std::env::var("PATH") {
                for dir in path_var.split(':') {
                    let candidate = PathBuf::from(dir).join("vfkit");
                    if candidate.exists() {
                        return Ok(candidate);
                    }
                }
            }

            for path in ["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"] {
                if Path::new(path).exists() {
                    return Ok(PathBuf::from(path));
                }
            }

            Err(EngineError::Failed(
                "vfkit binary not found. Install it with: brew install vfkit".into(),
            ))
        }
    }

    #[async_trait]
    impl Hypervisor for VfkitHypervisor {
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

            // vfkit cannot parse restore images; every Apple Silicon host runs
            // the generic VirtualMac configuration.
            Ok(RestoreImageInfo {
                version: None,
                build: None,
                variants: vec![ConfigurationVariant {
                    revision: 2,
                    min_cpu: 4,
                    min_memory_bytes: 8 * GIB,
                    hardware_model: HardwareModel(b"VirtualMac2,1".to_vec()),
                    supported_by_host: cfg!(target_arch = "aarch64"),
                }],
            })
        }

        fn new_machine_identifier(&self) -> Vec<u8> {
            uuid::Uuid::new_v4().as_bytes().to_vec()
        }

        fn create_auxiliary_storage(
            &self,
            _path: &Path,
            _model: &HardwareModel,
        ) -> Result<(), EngineError> {
            Err(EngineError::Unsupported {
                engine: ENGINE,
                capability: "auxiliary storage creation",
            })
        }

        fn validate(&self, config: &VmConfiguration) -> Result<(), EngineError> {
            let host_cpus = std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1);
            if config.cpu_count > host_cpus {
                return Err(EngineError::Rejected(format!(
                    "{} vCPUs requested but the host has {host_cpus}",
                    config.cpu_count
                )));
            }
            if config.memory_bytes < GIB {
                return Err(EngineError::Rejected("guest memory below 1 GiB".into()));
            }
            match config.primary_disk() {
                Some(disk) if disk.path.exists() => Ok(()),
                Some(disk) => Err(EngineError::Rejected(format!(
                    "boot disk {} does not exist",
                    disk.path.display()
                ))),
                None => Err(EngineError::Rejected("no boot disk attached".into())),
            }
        }

        async fn install(
            &self,
            _config: &VmConfiguration,
            _image: &Path,
            _progress: ProgressReporter,
        ) -> Result<(), EngineError> {
            Err(EngineError::Unsupported {
                engine: ENGINE,
                capability: "installation",
            })
        }

        async fn start(&self, config: &VmConfiguration) -> Result<Started, EngineError> {
            let vfkit = self.find_vfkit()?;
            info!(path = %vfkit.display(), "Found vfkit binary");

            let rest_port = self.options.rest_port;
            let mut cmd = Command::new(&vfkit);
            cmd.args(vfkit_args(config, rest_port));

            if config.audio.iter().any(|a| a.input || a.output) {
                debug!("vfkit has no audio device; guest runs without sound");
            }

            // Keep vfkit's own output off our terminal.
            cmd.stdin(std::process::Stdio::null());
            cmd.stdout(std::process::Stdio::null());
            cmd.stderr(std::process::Stdio::null());

            let child = cmd
                .spawn()
                .map_err(|e| EngineError::Failed(format!("spawn vfkit: {e}")))?;

            info!(
                port = rest_port,
                cpus = config.cpu_count,
                memory_gib = config.memory_bytes / GIB,
                "VM spawned"
            );

            let (events_tx, events) = mpsc::unbounded_channel();
            let instance = Arc::new(VfkitInstance {
                child: Arc::new(Mutex::new(Some(child))),
                rest_port,
                stopping: Arc::new(AtomicBool::new(false)),
                stop_timeout: self.options.stop_timeout,
            });

            spawn_monitor(&instance, self.options.poll_interval, events_tx);

            Ok(Started { instance, events })
        }
    }

    /// A running vfkit process.
    ///
    /// Dropping this value does NOT stop the child process.
    pub struct VfkitInstance {
        child: Arc<Mutex<Option<Child>>>,
        rest_port: u16,
        stopping: Arc<AtomicBool>,
        stop_timeout: Duration,
    }

    #[async_trait]
    impl VmInstance for VfkitInstance {
        /// Ask vfkit to stop the guest, then wait for the process to exit.
        /// The process is killed if the request fails or the wait times out.
        async fn stop(&self) -> Result<(), EngineError> {
            self.stopping.store(true, Ordering::SeqCst);

            let url = format!("http://localhost:{}/vm/state", self.rest_port);
            let stop_result = reqwest::Client::new()
                .put(&url)
                .json(&serde_json::json!({"state": "Stop"}))
                .timeout(Duration::from_secs(10))
                .send()
                .await;

            match stop_result {
                Ok(resp) => info!(
                    port = self.rest_port,
                    status = resp.status().as_u16(),
                    "VM stop request sent"
                ),
                Err(e) => {
                    warn!(port = self.rest_port, error = %e, "REST stop failed, killing vfkit");
                    if let Some(child) = self.child.lock().await.as_mut() {
                        let _ = child.kill().await;
                    }
                }
            }

            let deadline = tokio::time::Instant::now() + self.stop_timeout;
            loop {
                {
                    let mut guard = self.child.lock().await;
                    let Some(child) = guard.as_mut() else {
                        return Ok(());
                    };
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            info!(exit_status = ?status, "VM process exited");
                            guard.take();
                            return Ok(());
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Error waiting for VM process");
                            self.stopping.store(false, Ordering::SeqCst);
                            return Err(EngineError::Io(e));
                        }
                    }

                    if tokio::time::Instant::now() >= deadline {
                        warn!(timeout = ?self.stop_timeout, "VM did not exit in time, killing");
                        let _ = child.kill().await;
                        guard.take();
                        return Ok(());
                    }
                }

                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Poll the process and `GET /vm/state` until the guest goes away, then
    /// report how it went. Polling pauses while an explicit stop runs and
    /// ends once the stop has reaped the process, so explicit stops are not
    /// reported. A stop that gives up resumes polling.
    fn spawn_monitor(
        instance: &Arc<VfkitInstance>,
        poll_interval: Duration,
        events: mpsc::UnboundedSender<InstanceEvent>,
    ) {
        let child = Arc::clone(&instance.child);
        let stopping = Arc::clone(&instance.stopping);
        let rest_port = instance.rest_port;

        tokio::spawn(async move {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new());
            let url = format!("http://localhost:{rest_port}/vm/state");

            loop {
                tokio::time::sleep(poll_interval).await;

                {
                    let mut guard = child.lock().await;
                    let Some(proc) = guard.as_mut() else {
                        debug!(port = rest_port, "monitor exiting, process reaped");
                        return;
                    };
                    if stopping.load(Ordering::SeqCst) {
                        continue;
                    }
                    match proc.try_wait() {
                        Ok(Some(status)) => {
                            guard.take();
                            let event = if status.success() {
                                InstanceEvent::GuestStopped
                            } else {
                                InstanceEvent::StoppedWithError(format!("vfkit exited with {status}"))
                            };
                            info!(port = rest_port, %event, "VM process exited");
                            let _ = events.send(event);
                            return;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(port = rest_port, error = %e, "try_wait error in monitor");
                        }
                    }
                }

                match client.get(&url).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        let body: serde_json::Value = resp.json().await.unwrap_or_default();
                        let state = body["state"].as_str().unwrap_or_default();
                        debug!(port = rest_port, %state, "VM health-check OK");
                        if state.contains("Error") {
                            let _ = events.send(InstanceEvent::StoppedWithError(format!(
                                "vfkit reports {state}"
                            )));
                            return;
                        }
                    }
                    Ok(resp) => {
                        warn!(port = rest_port, http_status = resp.status().as_u16(), "VM health-check non-2xx");
                    }
                    Err(e) => {
                        // The REST endpoint may not be up while the guest boots.
                        debug!(port = rest_port, error = %e, "VM health-check failed");
                    }
                }
            }
        });
    }

}

// ---------------------------------------------------------------------------
// Non-macOS stub
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
mod imp {
    use std::path::Path;

    use async_trait::async_trait;

    use super::VfkitOptions;
    use crate::engine::{EngineError, Hypervisor, RestoreImageInfo, Started};
    use crate::vm::HardwareModel;
    use crate::vm::configuration::VmConfiguration;
    use crate::vm::progress::ProgressReporter;

    fn unsupported() -> EngineError {
        EngineError::Unsupported {
            engine: "vfkit",
            capability: "hosts other than macOS",
        }
    }

    /// Placeholder engine; construction always fails off macOS.
    pub struct VfkitHypervisor {
        _private: (),
    }

    impl VfkitHypervisor {
        pub fn new(_options: VfkitOptions) -> Result<Self, EngineError> {
            Err(unsupported())
        }
    }

    #[async_trait]
    impl Hypervisor for VfkitHypervisor {
        fn name(&self) -> &'static str {
            "vfkit"
        }

        async fn inspect_image(&self, _image: &Path) -> Result<RestoreImageInfo, EngineError> {
            Err(unsupported())
        }

        fn new_machine_identifier(&self) -> Vec<u8> {
            uuid::Uuid::new_v4().as_bytes().to_vec()
        }

        fn create_auxiliary_storage(
            &self,
            _path: &Path,
            _model: &HardwareModel,
        ) -> Result<(), EngineError> {
            Err(unsupported())
        }

        fn validate(&self, _config: &VmConfiguration) -> Result<(), EngineError> {
            Err(unsupported())
        }

        async fn install(
            &self,
            _config: &VmConfiguration,
            _image: &Path,
            _progress: ProgressReporter,
        ) -> Result<(), EngineError> {
            Err(unsupported())
        }

        async fn start(&self, _config: &VmConfiguration) -> Result<Started, EngineError> {
            Err(unsupported())
        }
    }
}

// ---------------------------------------------------------------------------
// Re-export the platform-appropriate symbols
// ---------------------------------------------------------------------------

pub use imp::VfkitHypervisor;
