use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every index table if it does not exist yet.
pub async fn create_schema(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
    // One row per item directory
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompts (
            id TEXT PRIMARY KEY,
            directory TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            primary_category TEXT NOT NULL,
            one_line_description TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL,
            content_hash TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompt_subcategories (
            prompt_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (prompt_id, position),
            FOREIGN KEY (prompt_id) REFERENCES prompts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompt_tags (
            prompt_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (prompt_id, position),
            FOREIGN KEY (prompt_id) REFERENCES prompts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompt_variables (
            prompt_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            optional_for_user INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (prompt_id, position),
            FOREIGN KEY (prompt_id) REFERENCES prompts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompt_fragments (
            prompt_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            variable TEXT NOT NULL,
            PRIMARY KEY (prompt_id, position),
            FOREIGN KEY (prompt_id) REFERENCES prompts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_prompts_category ON prompts(primary_category)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_prompt_tags_name ON prompt_tags(name)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_prompts_updated_at ON prompts(updated_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
