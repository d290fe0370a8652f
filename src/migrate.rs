use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::models::NoticeType;

/// `srt init`: create the schema and seed lookup rows.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;

    println!("initialized {}", config.db.path.display());
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation. Safe to run at the start of every pipeline run.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notice_types (
            code TEXT PRIMARY KEY,
            description TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS solicitations (
            id TEXT PRIMARY KEY,
            notice_id TEXT NOT NULL UNIQUE,
            solicitation_number TEXT,
            title TEXT NOT NULL,
            notice_type TEXT NOT NULL REFERENCES notice_types(code),
            posted_date TEXT NOT NULL,
            updated_date TEXT,
            naics_code TEXT,
            agency TEXT NOT NULL,
            office TEXT NOT NULL,
            hierarchy_degraded INTEGER NOT NULL DEFAULT 0,
            ui_link TEXT,
            raw_json TEXT NOT NULL,
            compliant INTEGER,
            needs_retry INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            solicitation_id TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            filename TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            content_type TEXT,
            text TEXT,
            status TEXT NOT NULL,
            status_detail TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(solicitation_id, fingerprint),
            FOREIGN KEY (solicitation_id) REFERENCES solicitations(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS models (
            version TEXT PRIMARY KEY,
            estimator TEXT NOT NULL,
            params_json TEXT NOT NULL DEFAULT '{}',
            registered_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            model_version TEXT NOT NULL,
            label TEXT NOT NULL,
            confidence REAL NOT NULL,
            decision_score REAL,
            predicted_at INTEGER NOT NULL,
            validation TEXT,
            trained INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, model_version),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (model_version) REFERENCES models(version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_solicitations (
            notice_id TEXT PRIMARY KEY,
            raw_json TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_solicitation ON documents(solicitation_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_predictions_document ON predictions(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_solicitations_posted ON solicitations(posted_date DESC)",
    )
    .execute(pool)
    .await?;

    for notice_type in NoticeType::ALL {
        sqlx::query("INSERT OR IGNORE INTO notice_types (code, description) VALUES (?, ?)")
            .bind(notice_type.code())
            .bind(notice_type.description())
            .execute(pool)
            .await?;
    }

    Ok(())
}
