//! Applying a change list to the local working copy.
//!
//! Every change is a whole-entry replace or delete; there is no byte-level
//! patching. Applying the same list twice leaves the tree unchanged the
//! second time. The remote root is only ever read.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{retry_once, IoContext, Result, SyncError};
use crate::models::{Change, ChangeKind};

pub fn apply(local_root: &Path, remote_root: &Path, changes: &[Change]) -> Result<()> {
    for change in changes {
        let local = local_root.join(&change.path);
        let remote = remote_root.join(&change.path);

        match change.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                tracing::debug!(path = %change.path, kind = %change.kind, "copying from snapshot");
                replace_with_copy(&remote, &local)?;
            }
            ChangeKind::Deleted => {
                tracing::debug!(path = %change.path, "removing");
                remove_path(&local)?;
            }
        }
    }
    Ok(())
}

/// Replace `dest` with a copy of `src`, file or directory.
pub(crate) fn replace_with_copy(src: &Path, dest: &Path) -> Result<()> {
    let src_meta = fs::metadata(src).at(src)?;

    if let Ok(dest_meta) = fs::symlink_metadata(dest) {
        // An existing entry of the other type has to go first.
        if dest_meta.is_dir() != src_meta.is_dir() {
            remove_path(dest)?;
        }
    }

    if src_meta.is_dir() {
        copy_dir(src, dest)
    } else {
        copy_file(src, dest)
    }
}

pub(crate) fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        retry_once(|| fs::create_dir_all(parent)).at(parent)?;
    }
    retry_once(|| fs::copy(src, dest)).at(dest)?;
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    retry_once(|| fs::create_dir_all(dest)).at(dest)?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            SyncError::io(path, e.into())
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            if target.is_file() {
                remove_path(&target)?;
            }
            retry_once(|| fs::create_dir_all(&target)).at(&target)?;
        } else {
            if target.is_dir() {
                remove_path(&target)?;
            }
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove a file or a directory subtree. An absent path is not an error.
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SyncError::io(path, e)),
    };

    let result = retry_once(|| {
        if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    });
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io(path, e)),
    }
}
