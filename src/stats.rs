//! Library status overview.
//!
//! Summarizes what is indexed (rows per category, last rebuild), which item
//! directories are incomplete, and whether the working copy holds changes
//! that have not been committed. Used by `psync status`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::remote::RemoteRepository;
use crate::{db, index, migrate};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryStatus {
    pub indexed: i64,
    pub by_category: Vec<(String, i64)>,
    pub last_indexed: Option<i64>,
    /// Item directories missing their content file or sidecar.
    pub orphans: Vec<String>,
    /// `None` when the working copy is not a git checkout.
    pub uncommitted: Option<bool>,
}

pub async fn collect_status(
    config: &Config,
    pool: &SqlitePool,
    remote: &dyn RemoteRepository,
) -> Result<LibraryStatus> {
    let indexed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prompts")
        .fetch_one(pool)
        .await?;
    let last_indexed: Option<i64> = sqlx::query_scalar("SELECT MAX(updated_at) FROM prompts")
        .fetch_one(pool)
        .await?;
    let by_category = index::counts_by_category(pool).await?;

    let layout = &config.library;
    let mut orphans = Vec::new();
    for dir in index::item_dirs(&layout.prompts_dir())? {
        let complete =
            dir.join(&layout.prompt_file).is_file() && dir.join(&layout.metadata_file).is_file();
        if !complete {
            if let Some(name) = dir.file_name() {
                orphans.push(name.to_string_lossy().into_owned());
            }
        }
    }

    let uncommitted = match remote.has_uncommitted_changes(&layout.root).await {
        Ok(dirty) => Some(dirty),
        Err(e) => {
            tracing::debug!(error = %e, "could not read working copy status");
            None
        }
    };

    Ok(LibraryStatus {
        indexed,
        by_category,
        last_indexed,
        orphans,
        uncommitted,
    })
}

/// Run the status command and print a summary.
pub async fn run_status(config: &Config, remote: &dyn RemoteRepository) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::create_schema(&pool).await?;
    let status = collect_status(config, &pool, remote).await;
    pool.close().await;
    let status = status?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Prompt Library Status");
    println!("=====================");
    println!();
    println!("  Library:     {}", config.library.root.display());
    println!("  Database:    {} ({})", config.db.path.display(), format_bytes(db_size));
    println!("  Indexed:     {}", status.indexed);
    println!(
        "  Last index:  {}",
        status
            .last_indexed
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "  Working copy: {}",
        match status.uncommitted {
            Some(true) => "uncommitted changes",
            Some(false) => "clean",
            None => "not a git checkout",
        }
    );

    if !status.by_category.is_empty() {
        println!();
        println!("  By category:");
        println!("  {:<32} {:>6}", "CATEGORY", "ITEMS");
        println!("  {}", "-".repeat(39));
        for (category, count) in &status.by_category {
            println!("  {:<32} {:>6}", category, count);
        }
    }

    if !status.orphans.is_empty() {
        println!();
        println!("  Incomplete item directories:");
        for slug in &status.orphans {
            println!("    {}", slug);
        }
    }

    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
