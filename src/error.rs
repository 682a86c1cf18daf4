//! Error taxonomy for the reconciliation engine.
//!
//! Filesystem and index failures carry enough context to be reported
//! without a backtrace. The orchestrator and the CLI wrap these in
//! [`anyhow::Error`] at their boundaries.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors produced by the reconciliation engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A filesystem read, write, rename or removal failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote snapshot could not be obtained. Fatal for the run.
    #[error("failed to fetch remote snapshot from {url}: {message}")]
    Fetch { url: String, message: String },

    /// Regenerated metadata does not satisfy the metadata contract.
    #[error("invalid metadata for {item}: {reason}")]
    Validation { item: String, reason: String },

    /// A directory merge overwrote files that already existed at the destination.
    #[error("merging {from} into {to} overwrote {} file(s)", overwritten.len())]
    Collision {
        from: String,
        to: String,
        overwritten: Vec<PathBuf>,
    },

    /// The metadata generator failed or returned unusable output.
    #[error("metadata generation failed: {0}")]
    Generation(String),

    /// A sidecar document could not be parsed or serialized.
    #[error("sidecar {path}: {message}")]
    Sidecar { path: PathBuf, message: String },

    /// The derived index could not be read or written.
    #[error("index error: {0}")]
    Index(#[from] sqlx::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this failure only affects a single item and may be skipped
    /// while the rest of the batch proceeds.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            SyncError::Validation { .. }
                | SyncError::Generation(_)
                | SyncError::Sidecar { .. }
                | SyncError::Collision { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Attach a path to an [`std::io::Result`].
pub trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| SyncError::io(path, e))
    }
}

/// Run a filesystem operation, retrying it once before surfacing the error.
pub fn retry_once<T>(mut op: impl FnMut() -> std::io::Result<T>) -> std::io::Result<T> {
    match op() {
        Ok(v) => Ok(v),
        Err(first) => {
            tracing::debug!(error = %first, "filesystem operation failed, retrying once");
            op()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_local_classification() {
        let v = SyncError::Validation {
            item: "a".into(),
            reason: "missing title".into(),
        };
        assert!(v.is_item_local());

        let f = SyncError::Fetch {
            url: "x".into(),
            message: "y".into(),
        };
        assert!(!f.is_item_local());
    }

    #[test]
    fn retry_once_recovers_from_single_failure() {
        let mut calls = 0;
        let out = retry_once(|| {
            calls += 1;
            if calls == 1 {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "flaky"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls, 2);
    }

    #[test]
    fn collision_message_counts_files() {
        let err = SyncError::Collision {
            from: "old".into(),
            to: "new".into(),
            overwritten: vec![PathBuf::from("prompt.md")],
        };
        assert_eq!(err.to_string(), "merging old into new overwrote 1 file(s)");
    }
}
