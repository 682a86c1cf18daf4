//! Sync orchestration.
//!
//! One run moves through these states:
//!
//! ```text
//! Idle → Fetching → Diffing → AwaitingConfirmation → Applying → Reconciling → Done
//!                      │               │
//!                      └── no changes, └── declined ──────────────────────────▶ Done
//! ```
//!
//! `Failed` is reachable from every state. A failed fetch or apply ends the
//! run; per-item regeneration failures do not. The fetch workspace is a
//! temporary directory that is removed when the run ends, whatever the
//! outcome.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::apply::apply;
use crate::config::Config;
use crate::diff::TreeDiffer;
use crate::generator::MetadataGenerator;
use crate::index::{rebuild_index, IndexReport};
use crate::regenerate::{affected_items, RegenerationReport, Regenerator};
use crate::remote::RemoteRepository;
use crate::summary::{render_summary, Confirm, RootChanges};
use crate::{db, migrate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Diffing,
    AwaitingConfirmation,
    Applying,
    Reconciling,
    Done,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Skip confirmation.
    pub force: bool,
    /// Stop after printing the summary.
    pub dry_run: bool,
    /// Overrides `remote.url`.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Every state the run entered, in order.
    pub states: Vec<SyncState>,
    pub changes: Vec<RootChanges>,
    pub applied: bool,
    pub declined: bool,
    pub regeneration: RegenerationReport,
    pub index: Option<IndexReport>,
}

impl SyncReport {
    pub fn final_state(&self) -> SyncState {
        self.states.last().copied().unwrap_or_default()
    }

    pub fn total_changes(&self) -> usize {
        self.changes.iter().map(|r| r.changes.len()).sum()
    }

    fn enter(&mut self, state: SyncState) {
        tracing::debug!(?state, "sync state");
        self.states.push(state);
    }
}

pub struct SyncOrchestrator {
    config: Arc<Config>,
    remote: Arc<dyn RemoteRepository>,
    generator: Arc<dyn MetadataGenerator>,
    confirm: Arc<dyn Confirm>,
}

impl SyncOrchestrator {
    pub fn new(
        config: Arc<Config>,
        remote: Arc<dyn RemoteRepository>,
        generator: Arc<dyn MetadataGenerator>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            config,
            remote,
            generator,
            confirm,
        }
    }

    pub async fn run(&self, force: bool) -> Result<SyncReport> {
        self.run_with(&SyncOptions {
            force,
            ..SyncOptions::default()
        })
        .await
    }

    pub async fn run_with(&self, options: &SyncOptions) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        report.enter(SyncState::Idle);

        match self.execute(options, &mut report).await {
            Ok(()) => {
                report.enter(SyncState::Done);
                Ok(report)
            }
            Err(e) => {
                let from = report.final_state();
                report.enter(SyncState::Failed);
                tracing::error!(?from, error = %e, "sync failed");
                Err(e)
            }
        }
    }

    /// Fetch and diff without touching the working copy.
    pub async fn has_pending_changes(&self) -> Result<bool> {
        let url = self.remote_url(None)?;
        let workspace = workspace()?;
        let snapshot = self.remote.fetch(&url, workspace.path()).await?;
        let roots = self.diff_roots(&snapshot)?;
        workspace
            .close()
            .context("removing fetch workspace")?;
        Ok(roots.iter().any(|r| !r.changes.is_empty()))
    }

    async fn execute(&self, options: &SyncOptions, report: &mut SyncReport) -> Result<()> {
        let url = self.remote_url(options.url.as_deref())?;
        // Dropping the guard removes the directory on every early return.
        let workspace = workspace()?;

        report.enter(SyncState::Fetching);
        let snapshot = self.remote.fetch(&url, workspace.path()).await?;

        report.enter(SyncState::Diffing);
        report.changes = self.diff_roots(&snapshot)?;
        if report.total_changes() == 0 {
            println!("Already up to date.");
            workspace.close().context("removing fetch workspace")?;
            return Ok(());
        }

        print!("{}", render_summary(&report.changes));
        if options.dry_run {
            println!("(dry run, nothing applied)");
            workspace.close().context("removing fetch workspace")?;
            return Ok(());
        }

        if !options.force {
            report.enter(SyncState::AwaitingConfirmation);
            if !self.confirm.confirm("Apply these changes?")? {
                tracing::info!("sync declined");
                report.declined = true;
                workspace.close().context("removing fetch workspace")?;
                return Ok(());
            }
        }

        report.enter(SyncState::Applying);
        let library = &self.config.library;
        for root in &report.changes {
            if root.changes.is_empty() {
                continue;
            }
            tracing::info!(root = %root.root, changes = root.changes.len(), "applying");
            apply(
                &library.root.join(&root.root),
                &snapshot.join(&root.root),
                &root.changes,
            )
            .with_context(|| format!("applying changes to {}", root.root))?;
        }
        report.applied = true;
        workspace.close().context("removing fetch workspace")?;

        report.enter(SyncState::Reconciling);
        let prompts_dir = library.prompts_dir();
        let prompt_changes = report
            .changes
            .iter()
            .find(|r| r.root == library.prompts_subdir)
            .map(|r| r.changes.as_slice())
            .unwrap_or_default();
        let items = affected_items(&prompts_dir, &library.prompt_file, prompt_changes);
        let regenerator = Regenerator::new(Arc::clone(&self.config), Arc::clone(&self.generator));
        report.regeneration = regenerator
            .process_items(items, self.config.sync.force_regenerate)
            .await;

        let pool = db::connect(&self.config).await?;
        migrate::create_schema(&pool).await?;
        let indexed = rebuild_index(&pool, &prompts_dir, library).await;
        pool.close().await;
        report.index = Some(indexed?);

        Ok(())
    }

    fn remote_url(&self, override_url: Option<&str>) -> Result<String> {
        match override_url.or(self.config.remote.url.as_deref()) {
            Some(url) if !url.trim().is_empty() => Ok(url.to_string()),
            _ => bail!("No remote repository configured. Set remote.url or REMOTE_REPOSITORY, or pass --url."),
        }
    }

    fn diff_roots(&self, snapshot: &Path) -> Result<Vec<RootChanges>> {
        let library = &self.config.library;
        let differ = TreeDiffer::with_excludes(&self.config.sync.exclude_globs)?;
        let mut roots = Vec::new();
        for root in [&library.prompts_subdir, &library.fragments_subdir] {
            let changes = differ.diff(&library.root.join(root), &snapshot.join(root))?;
            tracing::info!(root = %root, changes = changes.len(), "diffed");
            roots.push(RootChanges::new(root.clone(), changes));
        }
        Ok(roots)
    }
}

fn workspace() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("psync-")
        .tempdir()
        .context("creating fetch workspace")
}

/// Print a run report the way the other commands print their summaries.
pub fn print_report(report: &SyncReport) {
    println!("sync");
    println!("  changes: {}", report.total_changes());
    if report.declined {
        println!("  declined: nothing applied");
    }
    if report.applied {
        let regen = &report.regeneration;
        println!("  regenerated: {}", regen.regenerated());
        println!("  relocated: {}", regen.relocated());
        println!("  up to date: {}", regen.skipped());
        if regen.orphaned() > 0 {
            println!("  orphaned: {}", regen.orphaned());
        }
        if regen.failed() > 0 {
            println!("  failed: {}", regen.failed());
        }
    }
    if let Some(index) = &report.index {
        println!("  indexed: {}", index.upserted);
        println!("  pruned: {}", index.pruned);
    }
    println!("ok");
}
