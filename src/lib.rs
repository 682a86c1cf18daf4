//! # prompt-sync
//!
//! Incremental, idempotent reconciliation of a prompt library.
//!
//! A library is a tree of item directories, each holding one content file
//! (`prompt.md`) and one metadata sidecar (`metadata.yml`). The same library
//! lives in three places that have to agree: an upstream git repository, a
//! local working copy, and a SQLite index derived from the working copy.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  fetch   ┌──────────┐  diff + apply  ┌──────────────┐
//! │ upstream │────────▶│ snapshot │──────────────▶│ working copy │
//! └──────────┘          └──────────┘                └──────┬───────┘
//!                                                          │ gate → generate → relocate
//!                                                          ▼
//!                                                   ┌──────────────┐
//!                                                   │ SQLite index │
//!                                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`fingerprint`] | Content fingerprints |
//! | [`diff`] | Directory tree diffing |
//! | [`apply`] | Applying a change list to the working copy |
//! | [`sidecar`] | Metadata documents: validation, rendering, sanitizing |
//! | [`gate`] | Content-hash gate in front of regeneration |
//! | [`relocate`] | Moving or merging an item into its canonical slug |
//! | [`regenerate`] | Per-item regeneration pipeline |
//! | [`index`] | Derived SQLite index |
//! | [`sync`] | Orchestration of a full sync run |
//! | [`generator`] | Metadata generation collaborator |
//! | [`remote`] | Git collaborator |
//! | [`summary`] | Change summaries and confirmation |
//! | [`stats`] | Library status |
//! | [`config`] | TOML configuration |
//! | [`error`] | Error taxonomy |
//! | [`logging`] | Tracing setup |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod apply;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod gate;
pub mod generator;
pub mod index;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod regenerate;
pub mod relocate;
pub mod remote;
pub mod sidecar;
pub mod stats;
pub mod summary;
pub mod sync;
