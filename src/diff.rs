//! Directory tree diffing.
//!
//! Compares a local working copy against a remote snapshot without using
//! version-control metadata. The traversal is an explicit worklist over
//! directory levels, so memory is bounded by the width of the trees rather
//! than by recursion depth.
//!
//! # Policy
//!
//! | Remote entry | Local entry | Result |
//! |--------------|-------------|--------|
//! | file | absent | `added` |
//! | directory | absent | `added` for every file below it (or the directory itself when its subtree holds no files) |
//! | file | file | `modified` if size or fingerprint differ |
//! | directory | directory | descend |
//! | file | directory, or the reverse | `modified` at this level, not descended |
//! | absent | anything | `deleted` at this level (whole subtree) |
//!
//! The output is sorted lexically by path.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{IoContext, Result, SyncError};
use crate::fingerprint::fingerprint_file;
use crate::models::Change;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryType {
    File,
    Dir,
}

/// Diff two trees with no exclusions.
pub fn diff(local_root: &Path, remote_root: &Path) -> Result<Vec<Change>> {
    TreeDiffer::new().diff(local_root, remote_root)
}

/// Tree differ with an optional set of excluded relative paths.
#[derive(Debug, Clone)]
pub struct TreeDiffer {
    exclude: GlobSet,
}

impl Default for TreeDiffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeDiffer {
    pub fn new() -> Self {
        Self {
            exclude: GlobSet::empty(),
        }
    }

    /// Build a differ ignoring relative paths matching any of `patterns`
    /// on both sides.
    pub fn with_excludes(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            exclude: build_globset(patterns)?,
        })
    }

    fn excluded(&self, rel: &str) -> bool {
        self.exclude.is_match(rel)
    }

    pub fn diff(&self, local_root: &Path, remote_root: &Path) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        let mut worklist: VecDeque<String> = VecDeque::new();
        worklist.push_back(String::new());

        while let Some(prefix) = worklist.pop_front() {
            let local_dir = local_root.join(&prefix);
            let remote_dir = remote_root.join(&prefix);
            let local = list_dir(&local_dir)?;
            let remote = list_dir(&remote_dir)?;

            for (name, remote_type) in &remote {
                let rel = join_rel(&prefix, name);
                if self.excluded(&rel) {
                    continue;
                }

                match (local.get(name), remote_type) {
                    (None, EntryType::File) => changes.push(Change::added(rel)),
                    (None, EntryType::Dir) => {
                        self.expand_added(&remote_dir.join(name), &rel, &mut changes)?
                    }
                    (Some(EntryType::Dir), EntryType::Dir) => worklist.push_back(rel),
                    (Some(EntryType::File), EntryType::File) => {
                        if files_differ(&local_dir.join(name), &remote_dir.join(name))? {
                            changes.push(Change::modified(rel));
                        }
                    }
                    (Some(_), _) => {
                        tracing::debug!(path = %rel, "entry changed type, replacing subtree");
                        changes.push(Change::modified(rel));
                    }
                }
            }

            for name in local.keys() {
                if remote.contains_key(name) {
                    continue;
                }
                let rel = join_rel(&prefix, name);
                if !self.excluded(&rel) {
                    changes.push(Change::deleted(rel));
                }
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    /// Report every file under a directory that only exists remotely.
    fn expand_added(&self, dir: &Path, rel: &str, changes: &mut Vec<Change>) -> Result<()> {
        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                SyncError::io(path, e.into())
            })?;
            let sub = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            let entry_rel = if sub.as_os_str().is_empty() {
                rel.to_string()
            } else {
                join_rel(rel, &to_slash(sub))
            };
            if self.excluded(&entry_rel) {
                continue;
            }

            if entry.file_type().is_file() {
                changes.push(Change::added(entry_rel));
            } else if entry.file_type().is_dir() && is_empty_dir(entry.path())? {
                changes.push(Change::added(entry_rel));
            }
        }
        Ok(())
    }
}

/// List a directory level. A missing directory lists as empty.
fn list_dir(dir: &Path) -> Result<BTreeMap<String, EntryType>> {
    let mut out = BTreeMap::new();
    let reader = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(SyncError::io(dir, e)),
    };

    for entry in reader {
        let entry = entry.at(dir)?;
        let path = entry.path();
        // Follow symlinks so a linked file compares by content.
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let kind = if meta.is_dir() {
            EntryType::Dir
        } else {
            EntryType::File
        };
        out.insert(entry.file_name().to_string_lossy().into_owned(), kind);
    }
    Ok(out)
}

fn files_differ(local: &Path, remote: &Path) -> Result<bool> {
    let local_len = fs::metadata(local).at(local)?.len();
    let remote_len = fs::metadata(remote).at(remote)?.len();
    if local_len != remote_len {
        return Ok(true);
    }
    Ok(fingerprint_file(local)? != fingerprint_file(remote)?)
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    Ok(fs::read_dir(dir).at(dir)?.next().is_none())
}

fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::Config(format!("invalid exclude glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Config(format!("invalid exclude globs: {}", e)))
}
