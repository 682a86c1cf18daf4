//! Content fingerprints.
//!
//! A fingerprint is the MD5 digest of a file's bytes, the same value that
//! libraries already carry in their `content_hash` lines. It is only ever
//! compared for equality.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{IoContext, Result};
use crate::models::Fingerprint;

pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    finish(hasher)
}

/// Fingerprint a file without loading it into memory at once.
pub fn fingerprint_file(path: &Path) -> Result<Fingerprint> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(finish(hasher))
}

fn finish(hasher: Md5) -> Fingerprint {
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    Fingerprint::from_bytes(out)
}
