//! Metadata sidecar documents.
//!
//! A sidecar is a YAML mapping stored next to an item's content file. This
//! module validates untyped documents against the [`Metadata`] contract,
//! renders metadata back to YAML, and sanitizes documents into a stable
//! layout: two-space indentation, known keys in canonical order, any other
//! keys afterwards in lexical order. Sanitizing never drops a key.

use serde_yaml::{Mapping, Value};
use std::io::Write;
use std::path::Path;

use crate::error::{IoContext, Result, SyncError};
use crate::models::Metadata;

/// Key carrying the persisted content fingerprint.
pub const CONTENT_HASH_KEY: &str = "content_hash";

const CANONICAL_KEYS: &[&str] = &[
    "title",
    "primary_category",
    "subcategories",
    "directory",
    "tags",
    "one_line_description",
    "description",
    "variables",
    "fragments",
    CONTENT_HASH_KEY,
];

const REQUIRED_STRINGS: &[&str] = &[
    "title",
    "primary_category",
    "directory",
    "one_line_description",
    "description",
];

const REQUIRED_LISTS: &[&str] = &["subcategories", "tags", "variables"];

/// Check an untyped document against the metadata contract, returning the
/// first violation found.
pub fn check_metadata(value: &Value) -> std::result::Result<(), String> {
    let map = value
        .as_mapping()
        .ok_or_else(|| "document is not a mapping".to_string())?;

    for key in REQUIRED_STRINGS {
        match map.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) => return Err(format!("{} is empty", key)),
            Some(_) => return Err(format!("{} is not a string", key)),
            None => return Err(format!("{} is missing", key)),
        }
    }

    for key in REQUIRED_LISTS {
        match map.get(*key) {
            Some(Value::Sequence(_)) => {}
            Some(_) => return Err(format!("{} is not a list", key)),
            None => return Err(format!("{} is missing", key)),
        }
    }

    if let Some(Value::Sequence(vars)) = map.get("variables") {
        for (i, var) in vars.iter().enumerate() {
            let name = var.get("name").and_then(Value::as_str);
            let role = var.get("role").and_then(Value::as_str);
            if name.is_none() || role.is_none() {
                return Err(format!("variables[{}] needs string name and role", i));
            }
        }
    }

    match map.get("fragments") {
        None | Some(Value::Null) | Some(Value::Sequence(_)) => {}
        Some(_) => return Err("fragments is not a list".to_string()),
    }

    Ok(())
}

pub fn is_valid_metadata(value: &Value) -> bool {
    check_metadata(value).is_ok()
}

/// Turn generator output into typed metadata, rejecting anything that does
/// not satisfy the contract or names an unusable directory.
pub fn metadata_from_value(item: &str, value: Value) -> Result<Metadata> {
    let invalid = |reason: String| SyncError::Validation {
        item: item.to_string(),
        reason,
    };

    check_metadata(&value).map_err(invalid)?;
    let mut metadata: Metadata =
        serde_yaml::from_value(value).map_err(|e| invalid(e.to_string()))?;

    metadata.directory = metadata.directory.trim().to_string();
    if !is_valid_slug(&metadata.directory) {
        return Err(invalid(format!(
            "directory '{}' is not a single path component",
            metadata.directory
        )));
    }
    Ok(metadata)
}

/// A slug must name exactly one directory beneath the prompts root.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug != "."
        && slug != ".."
        && !slug.contains('/')
        && !slug.contains('\\')
        && !slug.contains('\0')
}

/// Parse an on-disk sidecar for indexing. Only `title` and
/// `primary_category` are mandatory; other fields default when absent.
pub fn parse_lenient(text: &str) -> std::result::Result<Metadata, String> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    let Value::Mapping(mut map) = value else {
        return Err("document is not a mapping".to_string());
    };

    for key in ["title", "primary_category"] {
        match map.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            _ => return Err(format!("{} is missing or empty", key)),
        }
    }
    for key in ["directory", "one_line_description", "description"] {
        if !matches!(map.get(key), Some(Value::String(_))) {
            map.insert(Value::from(key), Value::from(""));
        }
    }
    for key in REQUIRED_LISTS {
        if !matches!(map.get(*key), Some(Value::Sequence(_))) {
            map.insert(Value::from(*key), Value::Sequence(Vec::new()));
        }
    }
    if matches!(map.get(CONTENT_HASH_KEY), Some(v) if !v.is_string()) {
        map.remove(CONTENT_HASH_KEY);
    }

    serde_yaml::from_value(Value::Mapping(map)).map_err(|e| e.to_string())
}

/// Render metadata as a sanitized YAML document.
pub fn render_metadata(metadata: &Metadata) -> Result<String> {
    let value = serde_yaml::to_value(metadata).map_err(|e| SyncError::Sidecar {
        path: metadata.directory.clone().into(),
        message: e.to_string(),
    })?;
    dump(&canonicalize(value)).map_err(|message| SyncError::Sidecar {
        path: metadata.directory.clone().into(),
        message,
    })
}

/// Re-serialize a YAML document in the stable layout.
pub fn sanitize(text: &str) -> std::result::Result<String, String> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
    if !value.is_mapping() {
        return Err("document is not a mapping".to_string());
    }
    dump(&canonicalize(value))
}

fn dump(value: &Value) -> std::result::Result<String, String> {
    serde_yaml::to_string(value).map_err(|e| e.to_string())
}

fn canonicalize(value: Value) -> Value {
    let Value::Mapping(mut map) = value else {
        return value;
    };

    let mut ordered = Mapping::new();
    for key in CANONICAL_KEYS {
        if let Some(v) = map.remove(*key) {
            ordered.insert(Value::from(*key), v);
        }
    }

    let mut rest: Vec<(Value, Value)> = map.into_iter().collect();
    rest.sort_by_key(|(k, _)| key_sort_string(k));
    for (k, v) in rest {
        ordered.insert(k, v);
    }
    Value::Mapping(ordered)
}

fn key_sort_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}

/// Find the persisted fingerprint by scanning for its line, so that a
/// sidecar which no longer parses as YAML can still be gated. Only
/// unindented lines are top-level keys; indented ones belong to nested
/// values such as block scalars.
pub fn read_content_hash(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| line.strip_prefix("content_hash:"))
        .map(|v| v.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|v| !v.is_empty())
}

/// Replace the fingerprint line in place, or append one. The value is
/// quoted so an all-digit hash still parses as a string.
pub fn set_content_hash_line(text: &str, hash: &str) -> String {
    let replacement = format!("{}: '{}'", CONTENT_HASH_KEY, hash);
    let mut replaced = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            if !replaced && line.starts_with("content_hash:") {
                replaced = true;
                replacement.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(replacement);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Whole-file replace through a temporary file in the same directory.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).at(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).at(dir)?;
    tmp.write_all(contents.as_bytes()).at(tmp.path())?;
    tmp.persist(path).map_err(|e| SyncError::io(path, e.error))?;
    Ok(())
}
