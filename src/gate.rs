//! Content-hash gate in front of metadata regeneration.
//!
//! Regeneration calls an external model and is slow and costly, so it only
//! runs when an item's content drifted from the fingerprint recorded in its
//! sidecar. The gate decides; it never regenerates anything itself.

use std::path::Path;

use crate::error::{IoContext, Result, SyncError};
use crate::fingerprint::fingerprint_file;
use crate::models::Fingerprint;
use crate::sidecar;

/// Why the gate decided the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    Forced,
    MissingSidecar,
    MissingHash,
    HashMismatch,
    UpToDate,
}

#[derive(Debug, Clone, Copy)]
pub struct GateDecision {
    pub regenerate: bool,
    pub reason: GateReason,
    pub fingerprint: Fingerprint,
}

/// Decide whether the item needs regeneration and return the fresh
/// fingerprint of its content file. Only reading the content file can fail;
/// an unreadable sidecar counts as a missing one.
pub fn should_regenerate(
    content_path: &Path,
    sidecar_path: &Path,
    force: bool,
) -> Result<(bool, Fingerprint)> {
    let decision = evaluate(content_path, sidecar_path, force)?;
    Ok((decision.regenerate, decision.fingerprint))
}

pub fn evaluate(content_path: &Path, sidecar_path: &Path, force: bool) -> Result<GateDecision> {
    let fingerprint = fingerprint_file(content_path)?;
    let decide = |reason: GateReason| GateDecision {
        regenerate: reason != GateReason::UpToDate,
        reason,
        fingerprint,
    };

    if force {
        tracing::info!(content = %content_path.display(), "forcing metadata regeneration");
        return Ok(decide(GateReason::Forced));
    }

    let text = match std::fs::read_to_string(sidecar_path) {
        Ok(t) => t,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    sidecar = %sidecar_path.display(),
                    error = %e,
                    "unreadable sidecar, treating as missing"
                );
            } else {
                tracing::info!(sidecar = %sidecar_path.display(), "sidecar missing, update needed");
            }
            return Ok(decide(GateReason::MissingSidecar));
        }
    };

    let decision = match sidecar::read_content_hash(&text) {
        None => {
            tracing::info!(sidecar = %sidecar_path.display(), "no content hash recorded, update needed");
            decide(GateReason::MissingHash)
        }
        Some(stored) if stored != fingerprint.to_hex() => {
            tracing::info!(content = %content_path.display(), "content hash mismatch, update needed");
            decide(GateReason::HashMismatch)
        }
        Some(_) => {
            tracing::debug!(content = %content_path.display(), "content hash matches");
            decide(GateReason::UpToDate)
        }
    };
    Ok(decision)
}

/// Record `fingerprint` in the sidecar, preserving every other field.
///
/// The hash line is rewritten (or appended) textually first, then the
/// document is sanitized. If the document did not parse to begin with, the
/// line edit is still written so the next run can gate on it. A document
/// that parsed before the edit is never replaced by one that does not.
pub fn persist_fingerprint(sidecar_path: &Path, fingerprint: &Fingerprint) -> Result<()> {
    let text = std::fs::read_to_string(sidecar_path).at(sidecar_path)?;
    let edited = sidecar::set_content_hash_line(&text, &fingerprint.to_hex());

    let output = match sidecar::sanitize(&edited) {
        Ok(clean) => clean,
        Err(message) if sidecar::sanitize(&text).is_ok() => {
            return Err(SyncError::Sidecar {
                path: sidecar_path.to_path_buf(),
                message: format!("recording content hash would break the document: {}", message),
            });
        }
        Err(message) => {
            tracing::warn!(
                sidecar = %sidecar_path.display(),
                error = %message,
                "sidecar does not parse, writing hash without sanitizing"
            );
            edited
        }
    };

    sidecar::write_atomic(sidecar_path, &output)?;
    tracing::debug!(sidecar = %sidecar_path.display(), "content hash updated");
    Ok(())
}
