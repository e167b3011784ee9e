//! Standard locations used by macvm.
//!
//! - Config:  `~/.config/macvm/config.toml`  (or `$XDG_CONFIG_HOME/macvm/`)
//! - Logs:    `~/Library/Logs/macvm/` on macOS, XDG data dir elsewhere
//! - Bundle:  `~/MacVM.bundle/`
//!
//! Only the bundle root is created eagerly, by the bundle store itself.

use std::path::{Path, PathBuf};

const APP_NAME: &str = "macvm";
const DEFAULT_BUNDLE: &str = "MacVM.bundle";

/// All resolved application paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacvmPaths {
    pub home: PathBuf,
    /// Directory holding `config.toml`.
    pub config: PathBuf,
    pub logs: PathBuf,
}

impl MacvmPaths {
    /// Resolve all paths from `$HOME`. Does not touch the filesystem.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::from_home(home))
    }

    pub fn from_home(home: PathBuf) -> Self {
        Self {
            config: resolve_config_dir(&home),
            logs: resolve_log_dir(&home),
            home,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    pub fn default_bundle(&self) -> PathBuf {
        self.home.join(DEFAULT_BUNDLE)
    }

    /// Expand a leading `~` against this home directory.
    pub fn expand_tilde(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("~") {
            Ok(rest) => self.home.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

/// Keep the multi-gigabyte bundle out of Time Machine backups.
#[cfg(target_os = "macos")]
pub async fn exclude_from_backups(path: &Path) {
    use tokio::process::Command;
    use tracing::{info, warn};
    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            info!("TM-excluded: {}", path.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("tmutil addexclusion failed for {}: {}", path.display(), stderr.trim());
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}

#[cfg(not(target_os = "macos"))]
pub async fn exclude_from_backups(path: &Path) {
    tracing::debug!(path = %path.display(), "no backup exclusion on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_home() {
        let paths = MacvmPaths::from_home(PathBuf::from("/Users/alice"));
        assert_eq!(paths.default_bundle(), PathBuf::from("/Users/alice/MacVM.bundle"));
        assert!(paths.config_file().ends_with("macvm/config.toml"));
        assert!(paths.logs.to_string_lossy().contains("macvm"));
    }

    #[test]
    fn tilde_expands_only_at_the_start() {
        let paths = MacvmPaths::from_home(PathBuf::from("/Users/alice"));
        assert_eq!(
            paths.expand_tilde(Path::new("~/VMs/Sonoma.bundle")),
            PathBuf::from("/Users/alice/VMs/Sonoma.bundle")
        );
        assert_eq!(paths.expand_tilde(Path::new("/abs/~x")), PathBuf::from("/abs/~x"));
    }

    #[tokio::test]
    async fn backup_exclusion_of_missing_path_only_warns() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("gone.bundle");
        tokio::time::timeout(std::time::Duration::from_secs(10), exclude_from_backups(&missing))
            .await
            .expect("exclusion finished");
    }
}
