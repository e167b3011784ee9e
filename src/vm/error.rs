//! Error taxonomy shared by every VM component.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;

/// Result alias used throughout the `vm` module.
pub type VmResult<T> = Result<T, VmError>;

/// Everything that can go wrong while acquiring, configuring, installing or
/// running the guest.
#[derive(Debug, Error)]
pub enum VmError {
    /// The bundle path cannot be used.
    #[error("bundle storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The catalog has no image usable on this host, or could not be queried.
    #[error("no compatible installation image: {0}")]
    NoCompatibleImage(String),

    /// The image transfer failed; the partial file has been discarded.
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// The host cannot run any configuration the image offers.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The platform rejected the assembled device graph.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Installation ended without a usable disk. The bundle may be re-installed.
    #[error("installation failed: {0}")]
    InstallFailed(String),

    /// An install or acquisition is already running against this bundle.
    #[error("operation already in progress")]
    AlreadyInProgress,

    /// The command is not valid in the current lifecycle state.
    #[error("cannot {command} while {state}")]
    InvalidTransition { command: &'static str, state: String },

    /// The running instance failed (explicit stop error or start failure).
    #[error("instance error: {0}")]
    Instance(String),

    /// The virtualization engine failed outside the cases above.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The orchestrator task is gone.
    #[error("orchestrator has shut down")]
    Shutdown,
}

impl VmError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_transition(command: &'static str, state: impl ToString) -> Self {
        Self::InvalidTransition {
            command,
            state: state.to_string(),
        }
    }
}
