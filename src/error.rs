use std::io;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Transport failure that outlived its retry budget.
    #[error("network error fetching {url} after {attempts} attempt(s): {message}")]
    Network {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("checksum mismatch for {url} (expected {expected}, got {actual})")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// Recovery after a failed health check did not restore a healthy level.
    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("invalid update manifest: {0}")]
    ManifestFormat(String),

    #[error("{context}: {source}")]
    LocalIo {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid artifact url '{0}'")]
    InvalidUrl(String),

    #[error("process control error: {0}")]
    ProcessControl(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl UpdateError {
    pub fn local_io(context: impl Into<String>, source: io::Error) -> Self {
        Self::LocalIo {
            context: context.into(),
            source,
        }
    }

    pub fn io_at(action: &str, path: &Path, source: io::Error) -> Self {
        Self::local_io(format!("failed {} {}", action, path.display()), source)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::HealthCheck(_) => "health_check",
            Self::Rollback(_) => "rollback",
            Self::ManifestFormat(_) => "manifest_format",
            Self::LocalIo { .. } => "local_io",
            Self::InvalidUrl(_) => "invalid_url",
            Self::ProcessControl(_) => "process_control",
            Self::Snapshot(_) => "snapshot",
        }
    }
}

impl From<git2::Error> for UpdateError {
    fn from(err: git2::Error) -> Self {
        Self::Snapshot(err.message().to_string())
    }
}

pub type UpdateResult<T> = std::result::Result<T, UpdateError>;
