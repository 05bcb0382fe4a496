//! Crate-wide error taxonomy.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

/// The error kinds produced by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum OriError {
    #[error("object {id} not found")]
    NotFound { id: String },

    #[error("branch {name:?} not found")]
    BranchNotFound { name: String },

    #[error("snapshot {name:?} not found")]
    SnapshotNotFound { name: String },

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("signature verification failed: {0}")]
    VerifyFailure(String),

    #[error("unsupported on-disk version {found}, expected at most {expected}")]
    Unsupported { found: u32, expected: u32 },
}

impl OriError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// POSIX exit code a thin CLI host should return for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } | Self::BranchNotFound { .. } | Self::SnapshotNotFound { .. } => 1,
            _ => 1,
        }
    }

    /// Errno hint a FUSE adapter should translate this error to.
    pub fn errno_hint(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::BranchNotFound { .. } | Self::SnapshotNotFound { .. } => {
                "ENOENT"
            }
            Self::Conflict(_) => "EEXIST",
            _ => "EIO",
        }
    }
}

pub type OriResult<T> = Result<T, OriError>;


/// Wraps an [`io::Error`] with the path that was being operated on, the way
/// `file_util` context helpers do it in the examples this crate is modeled on.
pub(crate) trait IoResultExt<T> {
    fn with_path(self, path: impl AsRef<Path>) -> OriResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_path(self, path: impl AsRef<Path>) -> OriResult<T> {
        self.map_err(|source| OriError::Io {
            path: path.as_ref().to_owned(),
            source,
        })
    }
}
