//! Core data models shared by the differ, the reconcilers and the index.
//!
//! These types describe the items of a prompt library, the changes flowing
//! from an upstream snapshot into the working copy, and the rows of the
//! derived index.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change between the local and the remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Operation label used in change summaries.
    pub fn operation(&self) -> &'static str {
        match self {
            ChangeKind::Added => "Add",
            ChangeKind::Modified => "Modify",
            ChangeKind::Deleted => "Delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A single entry of a tree diff. `path` is relative to the diffed roots
/// and always uses `/` as separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
}

impl Change {
    pub fn added(path: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Added,
            path: path.into(),
        }
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Modified,
            path: path.into(),
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            path: path.into(),
        }
    }

    /// First path component, i.e. the item directory for a prompts tree.
    pub fn top_level(&self) -> &str {
        self.path.split('/').next().unwrap_or(&self.path)
    }
}

/// 128-bit content digest, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A variable placeholder declared by a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub role: String,
    #[serde(default, alias = "optional")]
    pub optional_for_user: bool,
}

/// Reference from a prompt variable to a reusable fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRef {
    pub name: String,
    pub category: String,
    pub variable: String,
}

/// Validated sidecar metadata of a content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    pub primary_category: String,
    #[serde(default)]
    pub subcategories: Vec<String>,
    pub directory: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub one_line_description: String,
    pub description: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragments: Option<Vec<FragmentRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// One row of the derived index as read back from SQLite.
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub id: String,
    pub directory: String,
    pub title: String,
    pub primary_category: String,
    pub one_line_description: String,
    pub description: String,
    pub content: String,
    pub content_hash: Option<String>,
    pub tags: Vec<String>,
    pub subcategories: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_component() {
        assert_eq!(Change::added("a/prompt.md").top_level(), "a");
        assert_eq!(Change::deleted("loose.md").top_level(), "loose.md");
    }

    #[test]
    fn fingerprint_hex_is_32_chars() {
        let fp = Fingerprint::from_bytes([0xab; 16]);
        assert_eq!(fp.to_hex().len(), 32);
        assert!(fp.to_hex().starts_with("abab"));
    }

    #[test]
    fn change_kind_labels() {
        assert_eq!(ChangeKind::Added.operation(), "Add");
        assert_eq!(ChangeKind::Modified.to_string(), "modified");
    }
}
