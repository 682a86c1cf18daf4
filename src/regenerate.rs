//! Per-item metadata regeneration.
//!
//! For every item the pipeline runs the content-hash gate, asks the
//! generator for fresh metadata when the gate says so, validates it, writes
//! the sidecar with the new fingerprint and then moves the item to the slug
//! the metadata asserts. An up-to-date item whose sidecar names another
//! slug is moved without regenerating, which completes an interrupted move. Items are processed as tokio tasks bounded by a
//! semaphore sized by `sync.max_parallel`. A failing item is reported and
//! skipped; it never stops the batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::{IoContext, Result};
use crate::generator::MetadataGenerator;
use crate::models::{Change, ChangeKind, Fingerprint, Metadata};
use crate::relocate::{self, RelocateOutcome, SlugLocks};
use crate::{gate, index, sidecar};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Content matches the recorded fingerprint.
    Skipped,
    /// Directory without a content file.
    Orphaned,
    Regenerated,
    /// Regenerated and moved to a new slug.
    Relocated {
        to: String,
        overwritten: Vec<PathBuf>,
    },
    /// Up to date, moved to the slug its sidecar already named.
    Moved {
        to: String,
        overwritten: Vec<PathBuf>,
    },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub slug: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegenerationReport {
    pub items: Vec<ItemReport>,
}

impl RegenerationReport {
    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.outcome)).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped))
    }

    /// Regenerated items, relocated ones included.
    pub fn regenerated(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Regenerated | ItemOutcome::Relocated { .. }))
    }

    /// Items that changed slug, whether or not they were regenerated.
    pub fn relocated(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Relocated { .. } | ItemOutcome::Moved { .. }))
    }

    pub fn orphaned(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Orphaned))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    pub fn merge(&mut self, other: RegenerationReport) {
        self.items.extend(other.items);
        self.items.sort_by(|a, b| a.slug.cmp(&b.slug));
    }
}

/// Runs the regeneration pipeline over a set of item slugs.
#[derive(Clone)]
pub struct Regenerator {
    config: Arc<Config>,
    generator: Arc<dyn MetadataGenerator>,
    locks: SlugLocks,
}

impl Regenerator {
    pub fn new(config: Arc<Config>, generator: Arc<dyn MetadataGenerator>) -> Self {
        Self {
            config,
            generator,
            locks: SlugLocks::new(),
        }
    }

    /// Process the given item slugs with bounded parallelism.
    pub async fn process_items(&self, slugs: Vec<String>, force: bool) -> RegenerationReport {
        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_parallel.max(1)));
        let mut tasks = JoinSet::new();

        for slug in slugs {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => match this.process_item(&slug, force).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            if e.is_item_local() {
                                tracing::warn!(slug = %slug, error = %e, "item failed, skipping");
                            } else {
                                tracing::error!(slug = %slug, error = %e, "item failed, skipping");
                            }
                            ItemOutcome::Failed(e.to_string())
                        }
                    },
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                };
                ItemReport { slug, outcome }
            });
        }

        let mut report = RegenerationReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(item) => report.items.push(item),
                Err(e) => tracing::error!(error = %e, "regeneration task panicked"),
            }
        }
        report.items.sort_by(|a, b| a.slug.cmp(&b.slug));
        report
    }

    /// Regenerate the whole library: adopt a loose top-level content file,
    /// then gate every item directory.
    pub async fn process_all(&self, force: bool) -> Result<RegenerationReport> {
        let mut report = RegenerationReport::default();
        if let Some(adopted) = self.adopt_loose_prompt().await {
            report.items.push(adopted);
        }

        let slugs: Vec<String> = index::item_dirs(&self.config.library.prompts_dir())?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        tracing::info!(items = slugs.len(), force, "regenerating library");

        report.merge(self.process_items(slugs, force).await);
        Ok(report)
    }

    async fn process_item(&self, slug: &str, force: bool) -> Result<ItemOutcome> {
        let layout = &self.config.library;
        let prompts_dir = layout.prompts_dir();
        let dir = prompts_dir.join(slug);
        let content_path = dir.join(&layout.prompt_file);
        let sidecar_path = dir.join(&layout.metadata_file);

        if !content_path.is_file() {
            tracing::warn!(slug, "no {} in item directory", layout.prompt_file);
            return Ok(ItemOutcome::Orphaned);
        }

        let decision = gate::evaluate(&content_path, &sidecar_path, force)?;
        if !decision.regenerate {
            return self.complete_pending_move(slug, &sidecar_path).await;
        }

        let content = std::fs::read_to_string(&content_path).at(&content_path)?;
        let metadata = self.generate(slug, &content).await?;
        let target = metadata.directory.clone();

        // The sidecar is written before the move, so a failed move is
        // finished by the next run without regenerating.
        self.write_sidecar(&dir, &metadata, &decision.fingerprint)?;
        let moved = relocate::reconcile_locked(&self.locks, &prompts_dir, slug, &target).await?;

        Ok(match moved {
            RelocateOutcome::Unchanged => ItemOutcome::Regenerated,
            RelocateOutcome::Renamed | RelocateOutcome::AlreadyMoved => ItemOutcome::Relocated {
                to: target,
                overwritten: Vec::new(),
            },
            RelocateOutcome::Merged { overwritten } => ItemOutcome::Relocated {
                to: target,
                overwritten,
            },
        })
    }

    /// Move an up-to-date item to the slug its sidecar names, if that
    /// differs from where it lives.
    async fn complete_pending_move(&self, slug: &str, sidecar_path: &Path) -> Result<ItemOutcome> {
        let target = std::fs::read_to_string(sidecar_path)
            .ok()
            .and_then(|text| sidecar::parse_lenient(&text).ok())
            .map(|metadata| metadata.directory.trim().to_string())
            .filter(|target| target != slug && sidecar::is_valid_slug(target));
        let Some(target) = target else {
            return Ok(ItemOutcome::Skipped);
        };

        tracing::info!(slug, to = %target, "sidecar names another directory, moving item");
        let prompts_dir = self.config.library.prompts_dir();
        let moved = relocate::reconcile_locked(&self.locks, &prompts_dir, slug, &target).await?;
        let overwritten = match moved {
            RelocateOutcome::Merged { overwritten } => overwritten,
            _ => Vec::new(),
        };
        Ok(ItemOutcome::Moved {
            to: target,
            overwritten,
        })
    }

    /// Move a content file sitting directly in the prompts root into the
    /// directory its generated metadata names.
    async fn adopt_loose_prompt(&self) -> Option<ItemReport> {
        let layout = &self.config.library;
        let loose = layout.prompts_dir().join(&layout.prompt_file);
        if !loose.is_file() {
            return None;
        }
        tracing::info!(path = %loose.display(), "adopting loose content file");

        let outcome = match self.adopt(&loose).await {
            Ok(slug) => ItemOutcome::Relocated {
                to: slug,
                overwritten: Vec::new(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "could not adopt loose content file");
                ItemOutcome::Failed(e.to_string())
            }
        };
        Some(ItemReport {
            slug: layout.prompt_file.clone(),
            outcome,
        })
    }

    async fn adopt(&self, loose: &Path) -> Result<String> {
        let layout = &self.config.library;
        let content = std::fs::read_to_string(loose).at(loose)?;
        let fingerprint = crate::fingerprint::fingerprint(content.as_bytes());
        let metadata = self.generate(&layout.prompt_file, &content).await?;

        let _guard = self.locks.lock(&metadata.directory).await;
        let dir = layout.prompts_dir().join(&metadata.directory);
        std::fs::create_dir_all(&dir).at(&dir)?;
        let dest = dir.join(&layout.prompt_file);
        if dest.exists() {
            tracing::warn!(path = %dest.display(), "overwriting existing content file");
        }
        std::fs::rename(loose, &dest).at(loose)?;
        self.write_sidecar(&dir, &metadata, &fingerprint)?;
        Ok(metadata.directory)
    }

    async fn generate(&self, item: &str, content: &str) -> Result<Metadata> {
        tracing::info!(item, generator = self.generator.name(), "generating metadata");
        let value = self.generator.generate(content).await?;
        sidecar::metadata_from_value(item, value)
    }

    fn write_sidecar(
        &self,
        dir: &Path,
        metadata: &Metadata,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let path = dir.join(&self.config.library.metadata_file);
        let mut metadata = metadata.clone();
        metadata.content_hash = None;
        let rendered = sidecar::render_metadata(&metadata)?;
        sidecar::write_atomic(&path, &rendered)?;
        gate::persist_fingerprint(&path, fingerprint)
    }
}

/// Item directories under `prompts_dir` whose content file was added or
/// modified, or that were replaced as a whole. Sidecar-only changes do not
/// count.
pub fn affected_items(prompts_dir: &Path, prompt_file: &str, changes: &[Change]) -> Vec<String> {
    let mut slugs: Vec<String> = changes
        .iter()
        .filter(|c| c.kind != ChangeKind::Deleted)
        .filter(|c| {
            let slug = c.top_level();
            c.path == slug || c.path == format!("{}/{}", slug, prompt_file)
        })
        .map(|c| c.top_level().to_string())
        .filter(|slug| prompts_dir.join(slug).is_dir())
        .collect();
    slugs.sort();
    slugs.dedup();
    slugs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Maps content text to the slug its metadata should assert.
    struct MapGenerator {
        slugs: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl MapGenerator {
        fn new(pairs: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                slugs: pairs
                    .iter()
                    .map(|(c, s)| (c.to_string(), s.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MetadataGenerator for MapGenerator {
        fn name(&self) -> &str {
            "map"
        }

        async fn generate(&self, content: &str) -> Result<serde_yaml::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(slug) = self.slugs.get(content) else {
                return Err(SyncError::Generation(format!("no answer for {}", content)));
            };
            let doc = format!(
                "title: {slug}\nprimary_category: Testing\nsubcategories: []\ndirectory: {slug}\ntags: [t]\none_line_description: one\ndescription: long\nvariables: []\n"
            );
            Ok(serde_yaml::from_str(&doc).unwrap())
        }
    }

    fn setup() -> (TempDir, Arc<Config>) {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(Config::minimal(tmp.path()));
        fs::create_dir_all(config.library.prompts_dir()).unwrap();
        (tmp, config)
    }

    fn write_item(prompts: &Path, slug: &str, content: &str) {
        fs::create_dir_all(prompts.join(slug)).unwrap();
        fs::write(prompts.join(slug).join("prompt.md"), content).unwrap();
    }

    #[tokio::test]
    async fn regenerates_missing_sidecar_and_skips_on_rerun() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "alpha", "alpha body");
        let generator = MapGenerator::new(&[("alpha body", "alpha")]);
        let regen = Regenerator::new(config.clone(), generator.clone());

        let report = regen.process_items(vec!["alpha".into()], false).await;
        assert_eq!(report.regenerated(), 1);
        let text = fs::read_to_string(prompts.join("alpha/metadata.yml")).unwrap();
        assert!(text.starts_with("title: alpha\n"));
        assert!(sidecar::read_content_hash(&text).is_some());

        let again = regen.process_items(vec!["alpha".into()], false).await;
        assert_eq!(again.skipped(), 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn relocates_to_generated_slug() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "old-name", "renamed body");
        let regen = Regenerator::new(config.clone(), MapGenerator::new(&[("renamed body", "new-name")]));

        let report = regen.process_items(vec!["old-name".into()], false).await;
        assert_eq!(
            report.items[0].outcome,
            ItemOutcome::Relocated {
                to: "new-name".into(),
                overwritten: vec![]
            }
        );
        assert!(!prompts.join("old-name").exists());
        assert!(prompts.join("new-name/prompt.md").is_file());
        assert!(prompts.join("new-name/metadata.yml").is_file());
    }

    #[tokio::test]
    async fn failing_item_does_not_stop_batch() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "good", "good body");
        write_item(&prompts, "bad", "unknown body");
        fs::create_dir_all(prompts.join("empty")).unwrap();
        let regen = Regenerator::new(config.clone(), MapGenerator::new(&[("good body", "good")]));

        let report = regen
            .process_items(vec!["bad".into(), "empty".into(), "good".into()], false)
            .await;
        assert_eq!(report.regenerated(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.orphaned(), 1);
        assert!(!prompts.join("bad/metadata.yml").exists());
    }

    #[tokio::test]
    async fn invalid_generated_slug_is_rejected() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "item", "escape body");
        let regen = Regenerator::new(config.clone(), MapGenerator::new(&[("escape body", "../outside")]));

        let report = regen.process_items(vec!["item".into()], false).await;
        assert_eq!(report.failed(), 1);
        assert!(prompts.join("item/prompt.md").is_file());
    }

    #[tokio::test]
    async fn process_all_adopts_loose_prompt() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        fs::write(prompts.join("prompt.md"), "loose body").unwrap();
        write_item(&prompts, "existing", "existing body");
        let regen = Regenerator::new(
            config.clone(),
            MapGenerator::new(&[("loose body", "adopted"), ("existing body", "existing")]),
        );

        let report = regen.process_all(false).await.unwrap();
        assert!(!prompts.join("prompt.md").exists());
        assert_eq!(
            fs::read_to_string(prompts.join("adopted/prompt.md")).unwrap(),
            "loose body"
        );
        assert!(prompts.join("adopted/metadata.yml").is_file());
        assert_eq!(report.failed(), 0);
        assert_eq!(report.items.len(), 3);
    }

    #[tokio::test]
    async fn up_to_date_item_is_moved_to_the_slug_its_sidecar_names() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "old-name", "moved body");
        let hash = crate::fingerprint::fingerprint(b"moved body").to_hex();
        fs::write(
            prompts.join("old-name/metadata.yml"),
            format!(
                "title: t\nprimary_category: Testing\nsubcategories: []\ndirectory: new-name\ntags: []\none_line_description: one\ndescription: long\nvariables: []\ncontent_hash: '{hash}'\n"
            ),
        )
        .unwrap();
        let generator = MapGenerator::new(&[]);
        let regen = Regenerator::new(config.clone(), generator.clone());

        let report = regen.process_items(vec!["old-name".into()], false).await;
        assert_eq!(
            report.items[0].outcome,
            ItemOutcome::Moved {
                to: "new-name".into(),
                overwritten: vec![]
            }
        );
        assert_eq!(report.relocated(), 1);
        assert_eq!(report.regenerated(), 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(!prompts.join("old-name").exists());
        assert!(prompts.join("new-name/prompt.md").is_file());

        let again = regen.process_items(vec!["new-name".into()], false).await;
        assert_eq!(again.skipped(), 1);
    }

    #[tokio::test]
    async fn sidecar_is_written_before_the_move() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "old-name", "blocked body");
        // A file where the destination directory should go makes the move fail.
        fs::write(prompts.join("new-name"), "not a directory").unwrap();
        let generator = MapGenerator::new(&[("blocked body", "new-name")]);
        let regen = Regenerator::new(config.clone(), generator.clone());

        let report = regen.process_items(vec!["old-name".into()], false).await;
        assert_eq!(report.failed(), 1);
        let text = fs::read_to_string(prompts.join("old-name/metadata.yml")).unwrap();
        assert!(text.contains("directory: new-name"));
        assert!(sidecar::read_content_hash(&text).is_some());

        fs::remove_file(prompts.join("new-name")).unwrap();
        let retry = regen.process_items(vec!["old-name".into()], false).await;
        assert_eq!(retry.relocated(), 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(prompts.join("new-name/metadata.yml").is_file());
    }

    #[test]
    fn affected_items_follow_content_file_changes() {
        let (_tmp, config) = setup();
        let prompts = config.library.prompts_dir();
        for slug in ["a", "b", "flip", "meta-only", "nested"] {
            fs::create_dir_all(prompts.join(slug)).unwrap();
        }
        fs::write(prompts.join("README.md"), "x").unwrap();

        let changes = vec![
            Change::modified("a/prompt.md"),
            Change::added("b/metadata.yml"),
            Change::added("b/prompt.md"),
            Change::deleted("c"),
            Change::modified("flip"),
            Change::modified("meta-only/metadata.yml"),
            Change::added("nested/extra/prompt.md"),
            Change::added("README.md"),
        ];
        assert_eq!(
            affected_items(&prompts, "prompt.md", &changes),
            vec!["a", "b", "flip"]
        );
    }
}
