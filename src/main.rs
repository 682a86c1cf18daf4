//! # prompt-sync CLI (`psync`)
//!
//! Keeps a local prompt library in step with its upstream repository and
//! with the SQLite index built from it.
//!
//! ## Usage
//!
//! ```bash
//! psync --config ./config/psync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `psync init` | Create the library directories and the index schema |
//! | `psync sync` | Pull upstream changes, regenerate metadata, rebuild the index |
//! | `psync regenerate` | Run the metadata gate over every item |
//! | `psync index` | Rebuild the index from the filesystem |
//! | `psync status` | Show index counts, incomplete items and working copy state |
//! | `psync push` | Commit and push local library changes |
//!
//! ## Examples
//!
//! ```bash
//! # Preview what an upstream sync would change
//! psync sync --dry-run
//!
//! # Sync from an explicit repository without asking for confirmation
//! psync sync --url https://github.com/acme/prompts.git --force
//!
//! # Regenerate metadata for everything, ignoring recorded hashes
//! psync regenerate --force
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use prompt_sync::config::{self, Config};
use prompt_sync::generator::create_generator;
use prompt_sync::regenerate::Regenerator;
use prompt_sync::remote::{GitRemote, RemoteRepository};
use prompt_sync::summary::DialoguerConfirm;
use prompt_sync::sync::{print_report, SyncOptions, SyncOrchestrator};
use prompt_sync::{db, index, logging, migrate, sidecar, stats};

/// prompt-sync: incremental reconciliation of a prompt library.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/psync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "psync",
    about = "Incremental reconciliation of a prompt library across upstream, working copy and index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/psync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the library directories and the index schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Pull upstream changes into the working copy.
    ///
    /// Fetches a snapshot of the remote repository, shows the changes per
    /// tracked root and applies them after confirmation. Changed items go
    /// through the metadata gate, then the index is rebuilt.
    Sync {
        /// Repository URL, overriding `remote.url` and `REMOTE_REPOSITORY`.
        #[arg(long)]
        url: Option<String>,

        /// Apply without asking for confirmation.
        #[arg(long)]
        force: bool,

        /// Show the change summary without applying anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Regenerate metadata for the whole library.
    ///
    /// Items whose content still matches the recorded fingerprint are
    /// skipped unless `--force` is given. A loose content file at the top
    /// of the prompts directory is moved into its own item directory.
    Regenerate {
        /// Regenerate every item regardless of its recorded fingerprint.
        #[arg(long)]
        force: bool,

        /// Only these item directories.
        slugs: Vec<String>,
    },

    /// Rebuild the index from the prompts directory.
    Index,

    /// Show index counts, incomplete items and working copy state.
    Status,

    /// Commit the prompts and fragments directories and push them.
    Push {
        /// Branch to push to. Defaults to `remote.branch`.
        #[arg(long)]
        branch: Option<String>,

        /// Commit message.
        #[arg(long, short, default_value = "Update prompt library")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => {
            for dir in [cfg.library.prompts_dir(), cfg.library.fragments_dir()] {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            migrate::run_migrations(&cfg).await?;
            println!("Library initialized at {}", cfg.library.root.display());
        }
        Commands::Sync {
            url,
            force,
            dry_run,
        } => {
            let cfg = Arc::new(cfg);
            let orchestrator = SyncOrchestrator::new(
                Arc::clone(&cfg),
                Arc::new(GitRemote::from_config(&cfg)),
                create_generator(&cfg)?,
                Arc::new(DialoguerConfirm),
            );
            let report = orchestrator
                .run_with(&SyncOptions {
                    force,
                    dry_run,
                    url,
                })
                .await?;
            print_report(&report);
        }
        Commands::Regenerate { force, slugs } => {
            run_regenerate(cfg, force, slugs).await?;
        }
        Commands::Index => {
            let pool = db::connect(&cfg).await?;
            migrate::create_schema(&pool).await?;
            let report =
                index::rebuild_index(&pool, &cfg.library.prompts_dir(), &cfg.library).await;
            pool.close().await;
            let report = report?;
            println!("index");
            println!("  upserted: {}", report.upserted);
            println!("  pruned: {}", report.pruned);
            println!("  skipped: {}", report.skipped.len());
            println!("ok");
        }
        Commands::Status => {
            stats::run_status(&cfg, &GitRemote::from_config(&cfg)).await?;
        }
        Commands::Push { branch, message } => {
            let branch = branch.unwrap_or_else(|| cfg.remote.branch.clone());
            GitRemote::from_config(&cfg)
                .push(&cfg.library.root, &branch, &message)
                .await?;
            println!("Pushed to {}", branch);
        }
    }

    Ok(())
}

async fn run_regenerate(cfg: Config, force: bool, slugs: Vec<String>) -> anyhow::Result<()> {
    let force = force || cfg.sync.force_regenerate;
    if let Some(bad) = slugs.iter().find(|s| !sidecar::is_valid_slug(s)) {
        anyhow::bail!("'{}' is not an item directory name", bad);
    }
    if !cfg.generator.is_enabled() {
        tracing::warn!("generator disabled, items that need new metadata will fail");
    }
    let cfg = Arc::new(cfg);
    let regenerator = Regenerator::new(Arc::clone(&cfg), create_generator(&cfg)?);

    let report = if slugs.is_empty() {
        regenerator.process_all(force).await?
    } else {
        regenerator.process_items(slugs, force).await
    };

    let pool = db::connect(&cfg).await?;
    migrate::create_schema(&pool).await?;
    let indexed = index::rebuild_index(&pool, &cfg.library.prompts_dir(), &cfg.library).await;
    pool.close().await;
    let indexed = indexed?;

    println!("regenerate");
    println!("  regenerated: {}", report.regenerated());
    println!("  relocated: {}", report.relocated());
    println!("  up to date: {}", report.skipped());
    println!("  failed: {}", report.failed());
    println!("  indexed: {}", indexed.upserted);
    println!("  pruned: {}", indexed.pruned);

    if report.failed() > 0 {
        anyhow::bail!("{} item(s) failed", report.failed());
    }
    println!("ok");
    Ok(())
}
