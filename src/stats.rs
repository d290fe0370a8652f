//! Database statistics and review health.
//!
//! Summarises what the pipeline has stored: solicitations, documents by
//! extraction status, predictions by model and label, the pending queue, and
//! whether enough human validations have accumulated to warrant retraining.
//! Used by `srt stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Prediction counts for one model version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStats {
    pub version: String,
    pub compliant: i64,
    pub non_compliant: i64,
    pub indeterminate: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub solicitations: i64,
    pub compliant_solicitations: i64,
    pub needing_retry: i64,
    pub degraded_hierarchy: i64,
    pub documents: i64,
    /// `(status, count)`, most frequent first.
    pub documents_by_status: Vec<(String, i64)>,
    pub models: Vec<ModelStats>,
    pub pending: i64,
    pub validated: i64,
    pub trained: i64,
    pub last_ingest_ts: Option<i64>,
}

impl Stats {
    /// Validated-but-untrained predictions beyond `threshold` mean the model
    /// should be retrained.
    pub fn revalidation_due(&self, threshold: i64) -> bool {
        self.validated - self.trained > threshold
    }
}

pub async fn collect_stats(pool: &SqlitePool) -> Result<Stats> {
    let count = move |sql: &'static str| async move {
        let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
        Ok::<i64, sqlx::Error>(n)
    };

    let solicitations = count("SELECT COUNT(*) FROM solicitations").await?;
    let compliant_solicitations =
        count("SELECT COUNT(*) FROM solicitations WHERE compliant = 1").await?;
    let needing_retry = count("SELECT COUNT(*) FROM solicitations WHERE needs_retry = 1").await?;
    let degraded_hierarchy =
        count("SELECT COUNT(*) FROM solicitations WHERE hierarchy_degraded = 1").await?;
    let documents = count("SELECT COUNT(*) FROM documents").await?;
    let pending = count("SELECT COUNT(*) FROM pending_solicitations").await?;
    let validated = count("SELECT COUNT(*) FROM predictions WHERE validation IS NOT NULL").await?;
    let trained = count("SELECT COUNT(*) FROM predictions WHERE trained = 1").await?;

    let last_ingest_ts: Option<i64> = sqlx::query_scalar("SELECT MAX(updated_at) FROM solicitations")
        .fetch_one(pool)
        .await?;

    let documents_by_status = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM documents GROUP BY status ORDER BY n DESC, status",
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
    .collect();

    let model_rows = sqlx::query(
        r#"
        SELECT
            m.version,
            COALESCE(SUM(p.label = 'compliant'), 0) AS compliant,
            COALESCE(SUM(p.label = 'non-compliant'), 0) AS non_compliant,
            COALESCE(SUM(p.label = 'indeterminate'), 0) AS indeterminate
        FROM models m
        LEFT JOIN predictions p ON p.model_version = m.version
        GROUP BY m.version
        ORDER BY m.registered_at DESC, m.version
        "#,
    )
    .fetch_all(pool)
    .await?;

    let models = model_rows
        .iter()
        .map(|row| ModelStats {
            version: row.get("version"),
            compliant: row.get("compliant"),
            non_compliant: row.get("non_compliant"),
            indeterminate: row.get("indeterminate"),
        })
        .collect();

    Ok(Stats {
        solicitations,
        compliant_solicitations,
        needing_retry,
        degraded_hierarchy,
        documents,
        documents_by_status,
        models,
        pending,
        validated,
        trained,
        last_ingest_ts,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("SRT Database Stats");
    println!("==================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!(
        "  Last ingest:    {}",
        stats
            .last_ingest_ts
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Solicitations:  {}", stats.solicitations);
    println!("    compliant:    {}", stats.compliant_solicitations);
    println!("    needs retry:  {}", stats.needing_retry);
    println!("    fallback org: {}", stats.degraded_hierarchy);
    println!("  Pending queue:  {}", stats.pending);
    println!("  Documents:      {}", stats.documents);
    for (status, n) in &stats.documents_by_status {
        println!("    {:<22} {:>6}", status, n);
    }

    if !stats.models.is_empty() {
        println!();
        println!("  By model:");
        println!(
            "  {:<24} {:>10} {:>14} {:>14}",
            "VERSION", "COMPLIANT", "NON-COMPLIANT", "INDETERMINATE"
        );
        println!("  {}", "-".repeat(66));
        for m in &stats.models {
            println!(
                "  {:<24} {:>10} {:>14} {:>14}",
                m.version, m.compliant, m.non_compliant, m.indeterminate
            );
        }
    }

    let threshold = config.review.revalidation_threshold;
    println!();
    println!(
        "  Validated:      {} ({} used in training)",
        stats.validated, stats.trained
    );
    if stats.revalidation_due(threshold) {
        println!(
            "  Retraining due: {} validated predictions not yet trained on (threshold {})",
            stats.validated - stats.trained,
            threshold
        );
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return crate::get::format_ts_iso(ts);
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
        crate::get::format_ts_iso(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[test]
    fn bytes_are_humanised() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn revalidation_threshold_is_exclusive() {
        let mut stats = Stats {
            solicitations: 0,
            compliant_solicitations: 0,
            needing_retry: 0,
            degraded_hierarchy: 0,
            documents: 0,
            documents_by_status: vec![],
            models: vec![],
            pending: 0,
            validated: 1500,
            trained: 500,
            last_ingest_ts: None,
        };
        assert!(!stats.revalidation_due(1000));
        stats.validated = 1501;
        assert!(stats.revalidation_due(1000));
    }

    #[tokio::test]
    async fn empty_database_has_zero_counts() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::migrate(&pool).await.unwrap();
        let stats = collect_stats(&pool).await.unwrap();
        assert_eq!(stats.solicitations, 0);
        assert_eq!(stats.pending, 0);
        assert!(stats.models.is_empty());
        assert!(stats.documents_by_status.is_empty());
        assert_eq!(stats.last_ingest_ts, None);
    }
}
