//! Solicitation retrieval by notice id.
//!
//! Fetches a stored solicitation with its documents and every prediction
//! made for them. Used by `srt get`.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Serialize)]
pub struct SolicitationResponse {
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub title: String,
    pub notice_type: String,
    pub posted_date: String,
    pub updated_date: Option<String>,
    pub naics_code: Option<String>,
    pub agency: String,
    pub office: String,
    pub hierarchy_degraded: bool,
    pub ui_link: Option<String>,
    pub compliant: Option<bool>,
    pub needs_retry: bool,
    pub updated_at: String, // ISO8601
    pub documents: Vec<DocumentResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub filename: String,
    pub fingerprint: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub status: String,
    pub status_detail: Option<String>,
    pub text_chars: usize,
    pub predictions: Vec<PredictionResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResponse {
    pub model_version: String,
    pub label: String,
    pub confidence: f64,
    pub validation: Option<String>,
    pub predicted_at: String, // ISO8601
}

pub async fn get_solicitation(pool: &SqlitePool, notice_id: &str) -> Result<SolicitationResponse> {
    let row = sqlx::query(
        r#"
        SELECT id, notice_id, solicitation_number, title, notice_type, posted_date,
               updated_date, naics_code, agency, office, hierarchy_degraded, ui_link,
               compliant, needs_retry, updated_at
        FROM solicitations WHERE notice_id = ?
        "#,
    )
    .bind(notice_id)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => row,
        None => bail!("solicitation not found: {}", notice_id),
    };
    let solicitation_id: String = row.get("id");

    let doc_rows = sqlx::query(
        r#"
        SELECT id, filename, fingerprint, size_bytes, content_type, status, status_detail,
               LENGTH(text) AS text_chars
        FROM documents WHERE solicitation_id = ?
        ORDER BY filename, fingerprint
        "#,
    )
    .bind(&solicitation_id)
    .fetch_all(pool)
    .await?;

    let mut documents = Vec::with_capacity(doc_rows.len());
    for doc in &doc_rows {
        let doc_id: String = doc.get("id");
        let predictions = sqlx::query(
            r#"
            SELECT model_version, label, confidence, validation, predicted_at
            FROM predictions WHERE document_id = ?
            ORDER BY predicted_at
            "#,
        )
        .bind(&doc_id)
        .fetch_all(pool)
        .await?
        .iter()
        .map(|p| PredictionResponse {
            model_version: p.get("model_version"),
            label: p.get("label"),
            confidence: p.get("confidence"),
            validation: p.get("validation"),
            predicted_at: format_ts_iso(p.get("predicted_at")),
        })
        .collect();

        let text_chars: Option<i64> = doc.get("text_chars");
        documents.push(DocumentResponse {
            filename: doc.get("filename"),
            fingerprint: doc.get("fingerprint"),
            size_bytes: doc.get("size_bytes"),
            content_type: doc.get("content_type"),
            status: doc.get("status"),
            status_detail: doc.get("status_detail"),
            text_chars: text_chars.unwrap_or(0).max(0) as usize,
            predictions,
        });
    }

    let compliant: Option<i64> = row.get("compliant");
    Ok(SolicitationResponse {
        notice_id: row.get("notice_id"),
        solicitation_number: row.get("solicitation_number"),
        title: row.get("title"),
        notice_type: row.get("notice_type"),
        posted_date: row.get("posted_date"),
        updated_date: row.get("updated_date"),
        naics_code: row.get("naics_code"),
        agency: row.get("agency"),
        office: row.get("office"),
        hierarchy_degraded: row.get("hierarchy_degraded"),
        ui_link: row.get("ui_link"),
        compliant: compliant.map(|c| c != 0),
        needs_retry: row.get("needs_retry"),
        updated_at: format_ts_iso(row.get("updated_at")),
        documents,
    })
}

/// CLI entry point: look up the solicitation and print it to stdout.
pub async fn run_get(config: &Config, notice_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = get_solicitation(&pool, notice_id).await;
    pool.close().await;
    let sol = result?;

    println!("--- Solicitation ---");
    println!("notice_id:    {}", sol.notice_id);
    println!("title:        {}", sol.title);
    if let Some(ref number) = sol.solicitation_number {
        println!("number:       {}", number);
    }
    println!("type:         {}", sol.notice_type);
    println!("posted:       {}", sol.posted_date);
    if let Some(ref updated) = sol.updated_date {
        println!("updated:      {}", updated);
    }
    println!("naics:        {}", sol.naics_code.as_deref().unwrap_or("-"));
    println!(
        "agency:       {}{}",
        sol.agency,
        if sol.hierarchy_degraded { " (unresolved)" } else { "" }
    );
    println!("office:       {}", sol.office);
    if let Some(ref link) = sol.ui_link {
        println!("link:         {}", link);
    }
    println!(
        "compliant:    {}",
        match sol.compliant {
            Some(true) => "yes",
            Some(false) => "no",
            None => "unknown",
        }
    );
    if sol.needs_retry {
        println!("attachments:  unavailable, will retry");
    }
    println!("stored_at:    {}", sol.updated_at);
    println!();

    println!("--- Documents ({}) ---", sol.documents.len());
    for doc in &sol.documents {
        println!(
            "{}  [{}]  {} chars",
            doc.filename, doc.status, doc.text_chars
        );
        if let Some(ref detail) = doc.status_detail {
            println!("  detail: {}", detail);
        }
        for p in &doc.predictions {
            println!(
                "  {} {} ({:.2}){}",
                p.model_version,
                p.label,
                p.confidence,
                p.validation
                    .as_deref()
                    .map(|v| format!(", validated {}", v))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
