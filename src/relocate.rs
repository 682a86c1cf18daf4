//! Moving an item to the slug its regenerated metadata asserts.
//!
//! When the destination is free the item directory is renamed. When it is
//! taken, the old directory is merged into it: every file is copied over,
//! same-named files are overwritten, and the old directory is removed.
//! Overwrites lose the destination's previous bytes, so each overwritten
//! path is reported and logged.
//!
//! The merge is not atomic. If the process dies between copy and removal
//! both directories remain; calling [`reconcile`] again re-runs the merge
//! and finishes the job.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use walkdir::WalkDir;

use crate::apply::{copy_file, remove_path};
use crate::error::{retry_once, IoContext, Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocateOutcome {
    /// Old and new slug are the same.
    Unchanged,
    /// Destination was free; the directory was renamed.
    Renamed,
    /// Destination existed; files were merged into it.
    Merged { overwritten: Vec<PathBuf> },
    /// Only the destination exists: an earlier run already finished.
    AlreadyMoved,
}

pub fn reconcile(root: &Path, old_slug: &str, new_slug: &str) -> Result<RelocateOutcome> {
    if old_slug == new_slug {
        return Ok(RelocateOutcome::Unchanged);
    }

    let old_dir = root.join(old_slug);
    let new_dir = root.join(new_slug);

    if !old_dir.is_dir() {
        if new_dir.is_dir() {
            tracing::debug!(from = old_slug, to = new_slug, "already relocated");
            return Ok(RelocateOutcome::AlreadyMoved);
        }
        return Err(SyncError::io(
            &old_dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "item directory not found"),
        ));
    }

    if !new_dir.exists() {
        tracing::info!(from = old_slug, to = new_slug, "renaming item directory");
        retry_once(|| fs::rename(&old_dir, &new_dir)).at(&old_dir)?;
        return Ok(RelocateOutcome::Renamed);
    }

    tracing::warn!(
        from = old_slug,
        to = new_slug,
        "destination already exists, merging contents"
    );
    let overwritten = merge_into(&old_dir, &new_dir)?;
    remove_path(&old_dir)?;

    if !overwritten.is_empty() {
        let collision = SyncError::Collision {
            from: old_slug.to_string(),
            to: new_slug.to_string(),
            overwritten: overwritten.clone(),
        };
        for path in &overwritten {
            tracing::warn!(path = %path.display(), "overwritten during merge");
        }
        tracing::warn!("{}", collision);
    }

    Ok(RelocateOutcome::Merged { overwritten })
}

/// Copy every file of `src` into `dest`, returning the relative paths that
/// already existed at the destination.
fn merge_into(src: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut overwritten = Vec::new();
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            SyncError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if target.is_dir() {
            remove_path(&target)?;
            overwritten.push(rel.to_path_buf());
        } else if target.exists() {
            overwritten.push(rel.to_path_buf());
        }
        copy_file(entry.path(), &target)?;
    }
    Ok(overwritten)
}

/// Serializes relocations that target the same destination slug.
///
/// Relocations onto different slugs proceed in parallel.
#[derive(Debug, Clone, Default)]
pub struct SlugLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SlugLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, slug: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(slug.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }
}

/// [`reconcile`] under the destination slug's lock.
pub async fn reconcile_locked(
    locks: &SlugLocks,
    root: &Path,
    old_slug: &str,
    new_slug: &str,
) -> Result<RelocateOutcome> {
    let _guard = locks.lock(new_slug).await;
    reconcile(root, old_slug, new_slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn renames_when_destination_is_free() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "old-name/prompt.md", "p");
        write(tmp.path(), "old-name/metadata.yml", "m");

        let outcome = reconcile(tmp.path(), "old-name", "new-name").unwrap();
        assert_eq!(outcome, RelocateOutcome::Renamed);
        assert!(!tmp.path().join("old-name").exists());
        assert_eq!(
            fs::read_to_string(tmp.path().join("new-name/prompt.md")).unwrap(),
            "p"
        );
        assert_eq!(
            fs::read_to_string(tmp.path().join("new-name/metadata.yml")).unwrap(),
            "m"
        );
    }

    #[test]
    fn merges_into_existing_destination_overwriting() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "old-name/prompt.md", "from old");
        write(tmp.path(), "old-name/metadata.yml", "old meta");
        write(tmp.path(), "new-name/prompt.md", "from new");
        write(tmp.path(), "new-name/notes.txt", "untouched");

        let outcome = reconcile(tmp.path(), "old-name", "new-name").unwrap();
        assert_eq!(
            outcome,
            RelocateOutcome::Merged {
                overwritten: vec![PathBuf::from("prompt.md")]
            }
        );
        assert!(!tmp.path().join("old-name").exists());
        let new = tmp.path().join("new-name");
        assert_eq!(fs::read_to_string(new.join("prompt.md")).unwrap(), "from old");
        assert_eq!(fs::read_to_string(new.join("metadata.yml")).unwrap(), "old meta");
        assert_eq!(fs::read_to_string(new.join("notes.txt")).unwrap(), "untouched");
    }

    #[test]
    fn rerun_after_interrupted_merge_completes() {
        let tmp = TempDir::new().unwrap();
        // Copy finished, removal of the old directory did not.
        write(tmp.path(), "old-name/prompt.md", "p");
        write(tmp.path(), "new-name/prompt.md", "p");

        reconcile(tmp.path(), "old-name", "new-name").unwrap();
        assert!(!tmp.path().join("old-name").exists());

        let again = reconcile(tmp.path(), "old-name", "new-name").unwrap();
        assert_eq!(again, RelocateOutcome::AlreadyMoved);
    }

    #[test]
    fn same_slug_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            reconcile(tmp.path(), "a", "a").unwrap(),
            RelocateOutcome::Unchanged
        );
    }

    #[test]
    fn missing_both_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(reconcile(tmp.path(), "x", "y").is_err());
    }

    #[tokio::test]
    async fn concurrent_merges_onto_same_slug_both_land() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "first/a.md", "1");
        write(tmp.path(), "second/b.md", "2");

        let locks = SlugLocks::new();
        let root = tmp.path().to_path_buf();
        let (l1, l2) = (locks.clone(), locks.clone());
        let (r1, r2) = (root.clone(), root.clone());
        let t1 = tokio::spawn(async move { reconcile_locked(&l1, &r1, "first", "shared").await });
        let t2 = tokio::spawn(async move { reconcile_locked(&l2, &r2, "second", "shared").await });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let shared = tmp.path().join("shared");
        assert!(shared.join("a.md").exists());
        assert!(shared.join("b.md").exists());
        assert!(!tmp.path().join("first").exists());
        assert!(!tmp.path().join("second").exists());
    }
}
