//! On-disk VM bundle layout.
//!
//! A bundle is one directory holding every persisted artifact of the guest:
//!
//! ```text
//! ~/MacVM.bundle/
//!   RestoreImage.ipsw     -- installation image
//!   Disk.img              -- sparse primary disk
//!   AuxiliaryStorage      -- boot-trust storage, paired with HardwareModel
//!   MachineIdentifier     -- persisted identity, never regenerated
//!   HardwareModel         -- hardware-model blob
//! ```
//!
//! Presence and size of these files are the only persisted state. Disk size
//! means bytes actually allocated: a freshly created sparse disk is large in
//! length but holds nothing until a guest has been written to it.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::vm::Policy;
use crate::vm::error::{VmError, VmResult};

pub const IMAGE_FILE: &str = "RestoreImage.ipsw";
pub const DISK_FILE: &str = "Disk.img";
pub const AUXILIARY_STORAGE_FILE: &str = "AuxiliaryStorage";
pub const MACHINE_IDENTIFIER_FILE: &str = "MachineIdentifier";
pub const HARDWARE_MODEL_FILE: &str = "HardwareModel";

/// Resolved paths of one bundle. Every path is a function of `root`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleLocation {
    pub root: PathBuf,
    pub image: PathBuf,
    pub disk: PathBuf,
    pub auxiliary_storage: PathBuf,
    pub machine_identifier: PathBuf,
    pub hardware_model: PathBuf,
}

/// Derived from file presence and size, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleStatus {
    pub has_image: bool,
    pub is_installed: bool,
}

impl BundleLocation {
    /// Derive the bundle paths without touching the filesystem.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            image: root.join(IMAGE_FILE),
            disk: root.join(DISK_FILE),
            auxiliary_storage: root.join(AUXILIARY_STORAGE_FILE),
            machine_identifier: root.join(MACHINE_IDENTIFIER_FILE),
            hardware_model: root.join(HARDWARE_MODEL_FILE),
            root,
        }
    }

    /// Derive the bundle paths and create `root` if it is missing.
    ///
    /// Fails with [`VmError::Storage`] when `root` exists but is not a
    /// directory, or cannot be created.
    pub fn resolve(root: impl Into<PathBuf>) -> VmResult<Self> {
        let location = Self::at(root);
        ensure_dir(&location.root)?;
        Ok(location)
    }

    /// Current `has_image` / `is_installed` predicates. Read-only.
    pub fn status(&self, policy: &Policy) -> BundleStatus {
        let has_image = self.image.is_file();
        let disk_allocated = fs::metadata(&self.disk)
            .map(|m| allocated_bytes(&m))
            .unwrap_or(0);
        let is_installed =
            disk_allocated >= policy.installed_threshold_bytes && self.auxiliary_storage.exists();

        debug!(
            root = %self.root.display(),
            has_image,
            is_installed,
            disk_allocated,
            "bundle status"
        );

        BundleStatus {
            has_image,
            is_installed,
        }
    }

    /// Partial-download path next to the image.
    pub fn partial_image(&self) -> PathBuf {
        self.image.with_extension("ipsw.part")
    }
}

/// Bytes the file occupies on disk, holes excluded.
#[cfg(unix)]
fn allocated_bytes(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;

    // st_blocks is always in 512-byte units.
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(meta: &fs::Metadata) -> u64 {
    meta.len()
}

fn ensure_dir(root: &Path) -> VmResult<()> {
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(VmError::storage(
                root,
                io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
            ));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(VmError::storage(root, e)),
    }

    fs::create_dir_all(root).map_err(|e| VmError::storage(root, e))?;
    info!(root = %root.display(), "created VM bundle");
    Ok(())
}

/// Allocate a sparse disk image of `size_bytes` at `path`.
///
/// The file only consumes real blocks once the guest writes to them.
pub fn create_sparse_disk(path: &Path, size_bytes: u64) -> io::Result<()> {
    let file = File::create_new(path)?;
    file.set_len(size_bytes)?;
    file.sync_all()?;
    info!(
        path = %path.display(),
        size_gib = size_bytes / crate::vm::GIB,
        "created sparse disk image"
    );
    Ok(())
}

/// Write `bytes` to `path` and flush them to stable storage before returning.
pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::GIB;

    #[test]
    fn paths_are_derived_from_root() {
        let loc = BundleLocation::at("/tmp/vm.bundle");
        assert_eq!(loc.image, PathBuf::from("/tmp/vm.bundle/RestoreImage.ipsw"));
        assert_eq!(loc.disk, PathBuf::from("/tmp/vm.bundle/Disk.img"));
        assert_eq!(loc.auxiliary_storage, PathBuf::from("/tmp/vm.bundle/AuxiliaryStorage"));
        assert_eq!(loc.machine_identifier, PathBuf::from("/tmp/vm.bundle/MachineIdentifier"));
        assert_eq!(loc.hardware_model, PathBuf::from("/tmp/vm.bundle/HardwareModel"));
    }

    #[test]
    fn resolve_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested").join("vm.bundle");

        let first = BundleLocation::resolve(&root).unwrap();
        let second = BundleLocation::resolve(&root).unwrap();

        assert_eq!(first, second);
        assert!(root.is_dir());
    }

    #[test]
    fn resolve_rejects_regular_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("not-a-dir");
        fs::write(&root, b"x").unwrap();

        let err = BundleLocation::resolve(&root).unwrap_err();
        assert!(matches!(err, VmError::Storage { .. }), "got {err:?}");
    }

    #[test]
    fn fresh_bundle_has_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let loc = BundleLocation::resolve(tmp.path()).unwrap();
        assert_eq!(loc.status(&Policy::default()), BundleStatus::default());
    }

    const MIB: u64 = 1024 * 1024;

    fn small_threshold() -> Policy {
        Policy {
            installed_threshold_bytes: MIB,
            ..Policy::default()
        }
    }

    fn write_guest_data(path: &Path, bytes: u64) {
        use std::io::Write;

        let mut file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.write_all(&vec![0x5Au8; bytes as usize]).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn installed_requires_written_disk_and_aux_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let loc = BundleLocation::resolve(tmp.path()).unwrap();
        let policy = small_threshold();

        create_sparse_disk(&loc.disk, 8 * MIB).unwrap();
        write_guest_data(&loc.disk, 2 * MIB);
        assert!(!loc.status(&policy).is_installed, "aux storage still missing");

        fs::write(&loc.auxiliary_storage, b"aux").unwrap();
        assert!(loc.status(&policy).is_installed);
    }

    #[test]
    fn freshly_allocated_disk_is_not_installed() {
        let tmp = tempfile::tempdir().unwrap();
        let loc = BundleLocation::resolve(tmp.path()).unwrap();
        let policy = Policy::default();
        create_sparse_disk(&loc.disk, policy.disk_size_bytes).unwrap();
        fs::write(&loc.auxiliary_storage, b"aux").unwrap();

        assert!(!loc.status(&policy).is_installed);
    }

    #[test]
    fn too_little_guest_data_is_not_installed() {
        let tmp = tempfile::tempdir().unwrap();
        let loc = BundleLocation::resolve(tmp.path()).unwrap();
        create_sparse_disk(&loc.disk, 80 * GIB).unwrap();
        write_guest_data(&loc.disk, MIB / 4);
        fs::write(&loc.auxiliary_storage, b"aux").unwrap();

        assert!(!loc.status(&small_threshold()).is_installed);
    }

    #[test]
    fn create_sparse_disk_refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Disk.img");
        create_sparse_disk(&path, 1024).unwrap();
        assert!(create_sparse_disk(&path, 2048).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), 1024);
    }
}
