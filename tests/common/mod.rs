//! Shared fixtures for the integration tests: a scripted catalog, a counting
//! in-memory transport and helpers for seeding bundles.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use url::Url;

use macvm::engine::simulated::SimulatedHypervisor;
use macvm::vm::bundle::{BundleLocation, create_sparse_disk};
use macvm::vm::catalog::ImageCatalog;
use macvm::vm::download::Transport;
use macvm::vm::{ImageDescriptor, LifecycleState, OsVersion, Orchestrator, Policy, Services};
use macvm::vm::ProgressReporter;

/// Size of the fake restore image.
pub const IMAGE_BYTES: u64 = 64 * 1024;

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub enum FakeCatalog {
    Lists(ImageDescriptor),
    Empty,
    Unreachable,
}

impl FakeCatalog {
    pub fn with_image() -> Self {
        FakeCatalog::Lists(descriptor())
    }
}

pub fn descriptor() -> ImageDescriptor {
    ImageDescriptor {
        version: OsVersion::parse("15.1").unwrap(),
        build: "24B83".into(),
        url: Url::parse("https://updates.example/UniversalMac_15.1_24B83_Restore.ipsw").unwrap(),
        size: Some(IMAGE_BYTES),
    }
}

#[async_trait]
impl ImageCatalog for FakeCatalog {
    async fn latest_supported(&self) -> Result<Option<ImageDescriptor>> {
        match self {
            FakeCatalog::Lists(d) => Ok(Some(d.clone())),
            FakeCatalog::Empty => Ok(None),
            FakeCatalog::Unreachable => bail!("connection refused"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Writes `IMAGE_BYTES` of zeros in eight chunks, reporting after each.
#[derive(Default)]
pub struct FakeTransport {
    calls: AtomicUsize,
    /// Fail after this many chunks on the first call.
    fail_first_after: Option<usize>,
    chunk_delay: Duration,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first_after(chunks: usize) -> Self {
        Self {
            fail_first_after: Some(chunks),
            ..Self::default()
        }
    }

    pub fn slow(chunk_delay: Duration) -> Self {
        Self {
            chunk_delay,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch(
        &self,
        _url: &Url,
        destination: &Path,
        expected: Option<u64>,
        progress: &mut ProgressReporter,
    ) -> Result<u64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut file = tokio::fs::File::create(destination).await?;
        let chunk = vec![0u8; (IMAGE_BYTES / 8) as usize];
        let mut written = 0u64;
        progress.report(0.0);

        for n in 0..8 {
            if call == 0 && self.fail_first_after == Some(n) {
                bail!("connection reset after {written} bytes");
            }
            tokio::time::sleep(self.chunk_delay).await;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.report_bytes(written, expected);
        }
        file.flush().await?;
        Ok(written)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator fixtures
// ---------------------------------------------------------------------------

pub const MIB: u64 = 1024 * 1024;

/// Guest data a finished simulated install leaves on the disk.
pub const INSTALL_PAYLOAD: u64 = 8 * MIB;

/// Full-size sparse disks with a threshold a simulated install can reach.
pub fn test_policy() -> Policy {
    Policy {
        installed_threshold_bytes: 4 * MIB,
        ..Policy::default()
    }
}

pub fn fast_engine() -> SimulatedHypervisor {
    SimulatedHypervisor::default()
        .with_install_steps(5)
        .with_step_delay(Duration::from_millis(1))
        .with_install_payload(INSTALL_PAYLOAD)
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub engine: SimulatedHypervisor,
    pub transport: Arc<FakeTransport>,
    pub location: BundleLocation,
    _tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new(engine: SimulatedHypervisor) -> Self {
        Self::with_parts(engine, FakeCatalog::with_image(), FakeTransport::new())
    }

    pub fn with_parts(
        engine: SimulatedHypervisor,
        catalog: FakeCatalog,
        transport: FakeTransport,
    ) -> Self {
        Self::build(engine, catalog, transport, test_policy())
    }

    /// A bundle with an image, judged by `policy`.
    pub fn with_policy(engine: SimulatedHypervisor, policy: Policy) -> Self {
        let harness = Self::build(engine, FakeCatalog::with_image(), FakeTransport::new(), policy);
        seed_image(&harness.location);
        harness
    }

    fn build(
        engine: SimulatedHypervisor,
        catalog: FakeCatalog,
        transport: FakeTransport,
        policy: Policy,
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("MacVM.bundle");
        let transport = Arc::new(transport);
        let services = Services {
            hypervisor: Arc::new(engine.clone()),
            catalog: Arc::new(catalog),
            transport: transport.clone(),
        };
        let orchestrator = Orchestrator::spawn(&root, policy, services);
        Self {
            location: BundleLocation::at(&root),
            orchestrator,
            engine,
            transport,
            _tmp: tmp,
        }
    }

    /// A bundle that already holds an image.
    pub fn with_image(engine: SimulatedHypervisor) -> Self {
        let harness = Self::new(engine);
        seed_image(&harness.location);
        harness
    }

    /// A bundle that already holds an installed guest.
    pub fn installed(engine: SimulatedHypervisor) -> Self {
        let harness = Self::new(engine);
        seed_installed(&harness.location);
        harness
    }

    /// Wait until the published state satisfies `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&LifecycleState) -> bool) -> LifecycleState {
        let mut rx = self.orchestrator.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for state")
            .expect("orchestrator gone");
        state.clone()
    }
}

pub fn seed_image(location: &BundleLocation) {
    std::fs::create_dir_all(&location.root).unwrap();
    std::fs::write(&location.image, vec![1u8; IMAGE_BYTES as usize]).unwrap();
}

pub fn seed_installed(location: &BundleLocation) {
    seed_image(location);
    create_sparse_disk(&location.disk, test_policy().disk_size_bytes).unwrap();
    let mut disk = std::fs::OpenOptions::new().write(true).open(&location.disk).unwrap();
    std::io::Write::write_all(&mut disk, &vec![0x5Au8; INSTALL_PAYLOAD as usize]).unwrap();
    disk.sync_all().unwrap();
    std::fs::write(&location.auxiliary_storage, b"aux").unwrap();
}

/// Drain every transition received so far.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<LifecycleState>) -> Vec<LifecycleState> {
    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    seen
}
