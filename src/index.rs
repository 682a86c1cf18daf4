//! Derived SQLite index over the prompts tree.
//!
//! The index is a projection of the filesystem: one row per item directory,
//! keyed by a UUID assigned on first insertion and looked up by slug. A
//! rebuild walks every item directory, upserts its row and child rows, then
//! deletes every row whose slug no longer has a directory. The whole rebuild
//! runs in a single transaction, so readers see either the old index or the
//! new one.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::config::LibraryConfig;
use crate::error::{IoContext, Result, SyncError};
use crate::models::{IndexRow, Metadata};
use crate::sidecar;

/// Outcome of one index rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub upserted: usize,
    pub pruned: usize,
    /// Item directories that exist but could not be indexed.
    pub skipped: Vec<String>,
}

/// An item directory read from disk, ready to upsert.
#[derive(Debug)]
struct ScannedItem {
    slug: String,
    metadata: Metadata,
    content: String,
}

#[derive(Debug, Default)]
struct Scan {
    items: Vec<ScannedItem>,
    present: BTreeSet<String>,
    skipped: Vec<String>,
}

pub async fn rebuild_index(
    pool: &SqlitePool,
    prompts_dir: &Path,
    layout: &LibraryConfig,
) -> Result<IndexReport> {
    let scan = scan_items(prompts_dir, layout)?;
    let now = chrono::Utc::now().timestamp();

    let mut tx = pool.begin().await?;

    let mut upserted = 0;
    for item in &scan.items {
        upsert_item(&mut tx, item, now).await?;
        upserted += 1;
    }

    // Prune only after every upsert so a renamed item is never missing.
    let indexed: Vec<String> = sqlx::query_scalar("SELECT directory FROM prompts")
        .fetch_all(&mut *tx)
        .await?;
    let mut pruned = 0;
    for slug in indexed {
        if scan.present.contains(&slug) {
            continue;
        }
        tracing::info!(slug = %slug, "pruning index row without directory");
        delete_row(&mut tx, &slug).await?;
        pruned += 1;
    }

    tx.commit().await?;

    tracing::info!(upserted, pruned, skipped = scan.skipped.len(), "index rebuilt");
    Ok(IndexReport {
        upserted,
        pruned,
        skipped: scan.skipped,
    })
}

fn scan_items(prompts_dir: &Path, layout: &LibraryConfig) -> Result<Scan> {
    let mut scan = Scan::default();
    for dir in item_dirs(prompts_dir)? {
        let slug = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        scan.present.insert(slug.clone());

        let content_path = dir.join(&layout.prompt_file);
        let sidecar_path = dir.join(&layout.metadata_file);
        match (content_path.is_file(), sidecar_path.is_file()) {
            (true, true) => {}
            (has_content, has_sidecar) => {
                tracing::warn!(
                    slug = %slug,
                    has_content,
                    has_sidecar,
                    "orphaned item directory, not indexed"
                );
                scan.skipped.push(slug);
                continue;
            }
        }

        let content = fs::read_to_string(&content_path).at(&content_path)?;
        let text = fs::read_to_string(&sidecar_path).at(&sidecar_path)?;
        match sidecar::parse_lenient(&text) {
            Ok(metadata) => scan.items.push(ScannedItem {
                slug,
                metadata,
                content,
            }),
            Err(message) => {
                tracing::warn!(
                    sidecar = %sidecar_path.display(),
                    error = %message,
                    "unparseable sidecar, not indexed"
                );
                scan.skipped.push(slug);
            }
        }
    }
    Ok(scan)
}

/// Every non-hidden directory directly below `prompts_dir`, sorted.
pub fn item_dirs(prompts_dir: &Path) -> Result<Vec<PathBuf>> {
    let reader = match fs::read_dir(prompts_dir) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SyncError::io(prompts_dir, e)),
    };

    let mut dirs = Vec::new();
    for entry in reader {
        let entry = entry.at(prompts_dir)?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_dir() && !hidden {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn upsert_item(tx: &mut Transaction<'_, Sqlite>, item: &ScannedItem, now: i64) -> Result<()> {
    let existing_id: Option<String> =
        sqlx::query_scalar("SELECT id FROM prompts WHERE directory = ?")
            .bind(&item.slug)
            .fetch_optional(&mut **tx)
            .await?;
    let id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let m = &item.metadata;

    sqlx::query(
        r#"
        INSERT INTO prompts (id, directory, title, primary_category, one_line_description, description, content, content_hash, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(directory) DO UPDATE SET
            title = excluded.title,
            primary_category = excluded.primary_category,
            one_line_description = excluded.one_line_description,
            description = excluded.description,
            content = excluded.content,
            content_hash = excluded.content_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&id)
    .bind(&item.slug)
    .bind(&m.title)
    .bind(&m.primary_category)
    .bind(&m.one_line_description)
    .bind(&m.description)
    .bind(&item.content)
    .bind(&m.content_hash)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    delete_children(tx, &id).await?;

    for (pos, name) in m.subcategories.iter().enumerate() {
        sqlx::query("INSERT INTO prompt_subcategories (prompt_id, position, name) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(pos as i64)
            .bind(name)
            .execute(&mut **tx)
            .await?;
    }
    for (pos, name) in m.tags.iter().enumerate() {
        sqlx::query("INSERT INTO prompt_tags (prompt_id, position, name) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(pos as i64)
            .bind(name)
            .execute(&mut **tx)
            .await?;
    }
    for (pos, var) in m.variables.iter().enumerate() {
        sqlx::query(
            "INSERT INTO prompt_variables (prompt_id, position, name, role, optional_for_user) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(pos as i64)
        .bind(&var.name)
        .bind(&var.role)
        .bind(var.optional_for_user)
        .execute(&mut **tx)
        .await?;
    }
    for (pos, frag) in m.fragments.iter().flatten().enumerate() {
        sqlx::query(
            "INSERT INTO prompt_fragments (prompt_id, position, name, category, variable) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(pos as i64)
        .bind(&frag.name)
        .bind(&frag.category)
        .bind(&frag.variable)
        .execute(&mut **tx)
        .await?;
    }

    tracing::debug!(slug = %item.slug, id = %id, "indexed");
    Ok(())
}

async fn delete_children(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<()> {
    for table in [
        "prompt_subcategories",
        "prompt_tags",
        "prompt_variables",
        "prompt_fragments",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE prompt_id = ?", table))
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn delete_row(tx: &mut Transaction<'_, Sqlite>, slug: &str) -> Result<()> {
    let id: Option<String> = sqlx::query_scalar("SELECT id FROM prompts WHERE directory = ?")
        .bind(slug)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(id) = id {
        delete_children(tx, &id).await?;
        sqlx::query("DELETE FROM prompts WHERE id = ?")
            .bind(&id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Look up one indexed item by slug.
pub async fn get_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<IndexRow>> {
    let row = sqlx::query(
        "SELECT id, directory, title, primary_category, one_line_description, description, content, content_hash, created_at, updated_at FROM prompts WHERE directory = ?",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let id: String = row.get("id");

    let tags: Vec<String> =
        sqlx::query_scalar("SELECT name FROM prompt_tags WHERE prompt_id = ? ORDER BY position")
            .bind(&id)
            .fetch_all(pool)
            .await?;
    let subcategories: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM prompt_subcategories WHERE prompt_id = ? ORDER BY position",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    Ok(Some(IndexRow {
        id,
        directory: row.get("directory"),
        title: row.get("title"),
        primary_category: row.get("primary_category"),
        one_line_description: row.get("one_line_description"),
        description: row.get("description"),
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        tags,
        subcategories,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

pub async fn list_slugs(pool: &SqlitePool) -> Result<Vec<String>> {
    let slugs = sqlx::query_scalar("SELECT directory FROM prompts ORDER BY directory")
        .fetch_all(pool)
        .await?;
    Ok(slugs)
}

/// Row counts per primary category, largest first.
pub async fn counts_by_category(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT primary_category, COUNT(*) AS n FROM prompts GROUP BY primary_category ORDER BY n DESC, primary_category ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("primary_category"), row.get("n")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Config, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::create_schema(&pool).await.unwrap();
        (tmp, config, pool)
    }

    fn write_item(prompts: &Path, slug: &str, title: &str, tags: &str) {
        let dir = prompts.join(slug);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("prompt.md"), format!("Body of {}", title)).unwrap();
        fs::write(
            dir.join("metadata.yml"),
            format!(
                "title: {title}\nprimary_category: Coding\nsubcategories: [review]\ndirectory: {slug}\ntags: {tags}\none_line_description: one\ndescription: long\nvariables:\n  - name: CODE\n    role: input\n    optional_for_user: false\ncontent_hash: abc\n"
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn indexes_items_with_children() {
        let (_tmp, config, pool) = setup().await;
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "code-review", "Code Review", "[code, review]");

        let report = rebuild_index(&pool, &prompts, &config.library).await.unwrap();
        assert_eq!(report.upserted, 1);
        assert_eq!(report.pruned, 0);

        let row = get_by_slug(&pool, "code-review").await.unwrap().unwrap();
        assert_eq!(row.title, "Code Review");
        assert_eq!(row.tags, vec!["code", "review"]);
        assert_eq!(row.subcategories, vec!["review"]);
        assert_eq!(row.content, "Body of Code Review");
        assert_eq!(row.content_hash.as_deref(), Some("abc"));
        assert!(Uuid::parse_str(&row.id).is_ok());
    }

    #[tokio::test]
    async fn stale_row_is_pruned() {
        let (_tmp, config, pool) = setup().await;
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "keep", "Keep", "[]");
        write_item(&prompts, "gone", "Gone", "[]");
        rebuild_index(&pool, &prompts, &config.library).await.unwrap();

        fs::remove_dir_all(prompts.join("gone")).unwrap();
        let report = rebuild_index(&pool, &prompts, &config.library).await.unwrap();

        assert_eq!(report.pruned, 1);
        assert_eq!(list_slugs(&pool).await.unwrap(), vec!["keep"]);
        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prompt_variables")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(orphans, 1);
    }

    #[tokio::test]
    async fn rebuild_keeps_id_and_replaces_children() {
        let (_tmp, config, pool) = setup().await;
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "item", "First", "[a, b, c]");
        rebuild_index(&pool, &prompts, &config.library).await.unwrap();
        let first = get_by_slug(&pool, "item").await.unwrap().unwrap();

        write_item(&prompts, "item", "Second", "[z]");
        rebuild_index(&pool, &prompts, &config.library).await.unwrap();
        let second = get_by_slug(&pool, "item").await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "Second");
        assert_eq!(second.tags, vec!["z"]);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn orphan_directories_are_skipped_but_not_pruned() {
        let (_tmp, config, pool) = setup().await;
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "item", "Item", "[]");
        rebuild_index(&pool, &prompts, &config.library).await.unwrap();

        fs::remove_file(prompts.join("item/prompt.md")).unwrap();
        fs::create_dir_all(prompts.join("empty")).unwrap();
        let report = rebuild_index(&pool, &prompts, &config.library).await.unwrap();

        assert_eq!(report.skipped, vec!["empty", "item"]);
        assert_eq!(report.pruned, 0);
        assert!(get_by_slug(&pool, "item").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn counts_group_by_category() {
        let (_tmp, config, pool) = setup().await;
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "a", "A", "[]");
        write_item(&prompts, "b", "B", "[]");
        rebuild_index(&pool, &prompts, &config.library).await.unwrap();
        assert_eq!(
            counts_by_category(&pool).await.unwrap(),
            vec![("Coding".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn missing_prompts_dir_prunes_everything() {
        let (_tmp, config, pool) = setup().await;
        let prompts = config.library.prompts_dir();
        write_item(&prompts, "a", "A", "[]");
        rebuild_index(&pool, &prompts, &config.library).await.unwrap();
        fs::remove_dir_all(&prompts).unwrap();

        let report = rebuild_index(&pool, &prompts, &config.library).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(list_slugs(&pool).await.unwrap().is_empty());
    }
}
