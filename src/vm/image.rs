//! Installation image acquisition.
//!
//! ```text
//! ensure_acquired(location)
//!     ├─► image present?  → inspect metadata, no transport work
//!     └─► latest_supported() → download() → RestoreImage.ipsw
//! ```
//!
//! Downloads land in `RestoreImage.ipsw.part` and are renamed into place only
//! once complete, so a failed transfer never leaves a file at the final path.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::Hypervisor;
use crate::vm::bundle::BundleLocation;
use crate::vm::catalog::ImageCatalog;
use crate::vm::download::Transport;
use crate::vm::error::{VmError, VmResult};
use crate::vm::progress::ProgressReporter;
use crate::vm::{ImageDescriptor, InstallationImage};

/// Obtains the restore image for a bundle.
#[derive(Clone)]
pub struct ImageAcquirer {
    catalog: Arc<dyn ImageCatalog>,
    transport: Arc<dyn Transport>,
    hypervisor: Arc<dyn Hypervisor>,
}

impl ImageAcquirer {
    pub fn new(
        catalog: Arc<dyn ImageCatalog>,
        transport: Arc<dyn Transport>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        Self {
            catalog,
            transport,
            hypervisor,
        }
    }

    /// Ask the catalog for the most capable image this host can use.
    pub async fn acquire_latest(&self) -> VmResult<ImageDescriptor> {
        match self.catalog.latest_supported().await {
            Ok(Some(descriptor)) => {
                info!(
                    version = %descriptor.version,
                    build = %descriptor.build,
                    url = %descriptor.url,
                    "latest supported restore image"
                );
                Ok(descriptor)
            }
            Ok(None) => Err(VmError::NoCompatibleImage(
                "catalog lists no image this host can use".into(),
            )),
            Err(e) => Err(VmError::NoCompatibleImage(format!(
                "catalog unreachable: {e:#}"
            ))),
        }
    }

    /// Stream `descriptor` to `destination`.
    ///
    /// On success the file is complete and the last reported progress is
    /// exactly 1.0. On failure nothing is left at `destination` or at the
    /// partial path.
    pub async fn download(
        &self,
        descriptor: &ImageDescriptor,
        destination: &Path,
        progress: &mut ProgressReporter,
    ) -> VmResult<InstallationImage> {
        let partial = destination.with_extension("ipsw.part");

        let fetched = self
            .transport
            .fetch(&descriptor.url, &partial, descriptor.size, progress)
            .await;

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(e) => {
                discard(&partial).await;
                return Err(VmError::DownloadFailed(format!("{e:#}")));
            }
        };

        if let Err(e) = tokio::fs::rename(&partial, destination).await {
            discard(&partial).await;
            return Err(VmError::DownloadFailed(format!(
                "move {} into place: {e}",
                partial.display()
            )));
        }

        progress.complete();
        info!(bytes, path = %destination.display(), "restore image downloaded");

        Ok(InstallationImage {
            path: destination.to_path_buf(),
            version: Some(descriptor.version),
            build: Some(descriptor.build.clone()),
            source_url: Some(descriptor.url.clone()),
        })
    }

    /// Return the bundle's image, downloading it first if absent.
    pub async fn ensure_acquired(
        &self,
        location: &BundleLocation,
        progress: &mut ProgressReporter,
    ) -> VmResult<InstallationImage> {
        if location.image.is_file() {
            info!(path = %location.image.display(), "restore image already present");
            let image = self.load_existing(&location.image).await;
            progress.complete();
            return Ok(image);
        }

        let descriptor = self.acquire_latest().await?;
        self.download(&descriptor, &location.image, progress).await
    }

    /// Validate a user-supplied image and copy it into the bundle.
    ///
    /// An image already present in the bundle wins; the source is ignored.
    pub async fn import(
        &self,
        location: &BundleLocation,
        source: &Path,
    ) -> VmResult<InstallationImage> {
        if location.image.is_file() {
            info!(path = %location.image.display(), "restore image already present, skipping import");
            return Ok(self.load_existing(&location.image).await);
        }

        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| VmError::storage(source, e))?;
        if !meta.is_file() || meta.len() == 0 {
            return Err(VmError::UnsupportedConfiguration(format!(
                "{} is not a non-empty regular file",
                source.display()
            )));
        }

        let info = self
            .hypervisor
            .inspect_image(source)
            .await
            .map_err(|e| VmError::UnsupportedConfiguration(e.to_string()))?;

        let partial = location.partial_image();
        if let Err(e) = tokio::fs::copy(source, &partial).await {
            discard(&partial).await;
            return Err(VmError::storage(&partial, e));
        }
        tokio::fs::rename(&partial, &location.image)
            .await
            .map_err(|e| VmError::storage(&location.image, e))?;

        info!(source = %source.display(), "imported restore image");
        Ok(InstallationImage {
            path: location.image.clone(),
            version: info.version,
            build: info.build,
            source_url: None,
        })
    }

    /// Metadata for an image already on disk. Inspection failures are not
    /// fatal here; requirement resolution reports them properly later.
    async fn load_existing(&self, path: &Path) -> InstallationImage {
        let (version, build) = match self.hypervisor.inspect_image(path).await {
            Ok(info) => (info.version, info.build),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read restore image metadata");
                (None, None)
            }
        };
        InstallationImage {
            path: path.to_path_buf(),
            version,
            build,
            source_url: None,
        }
    }
}

async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => warn!(path = %partial.display(), "discarded partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %partial.display(), error = %e, "failed to remove partial download"),
    }
}
