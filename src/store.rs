//! Durable store for solicitations, documents and predictions.
//!
//! The [`Store`] trait is the seam between the pipeline and the database so
//! tests can substitute a fake. [`SqliteStore`] is the production backend.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`register_model`](Store::register_model) | Record the model version used by a run |
//! | [`known_documents`](Store::known_documents) | What a rerun can skip for a notice |
//! | [`commit_bundle`](Store::commit_bundle) | Write one solicitation atomically |
//! | [`enqueue_pending`](Store::enqueue_pending) | Mark notices as dispatched, counting attempts |
//! | [`pending`](Store::pending) | Notices dispatched but never committed |

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    CommitReport, ExtractionStatus, KnownDocument, ModelInfo, SolicitationBundle,
    SolicitationSummary,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert the model row if this version is new.
    async fn register_model(&self, model: &ModelInfo) -> Result<(), StoreError>;

    /// Documents already stored for `notice_id`, keyed by fingerprint.
    async fn known_documents(
        &self,
        notice_id: &str,
    ) -> Result<HashMap<String, KnownDocument>, StoreError>;

    /// Upsert the solicitation, its documents and predictions, refresh the
    /// compliance rollup and settle the pending entry, all in one transaction.
    async fn commit_bundle(&self, bundle: &SolicitationBundle) -> Result<CommitReport, StoreError>;

    /// Record a dispatch for each notice. A notice already pending has its
    /// attempt count bumped.
    async fn enqueue_pending(&self, summaries: &[SolicitationSummary]) -> Result<(), StoreError>;

    /// Pending notices in enqueue order. Entries that already used
    /// `max_attempts` dispatches are dropped from the queue; their
    /// solicitation row keeps `needs_retry` set.
    async fn pending(&self, max_attempts: u32) -> Result<Vec<SolicitationSummary>, StoreError>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn register_model(&self, model: &ModelInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO models (version, estimator, params_json, registered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(version) DO NOTHING
            "#,
        )
        .bind(&model.version)
        .bind(&model.estimator)
        .bind(serde_json::to_string(&model.params)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn known_documents(
        &self,
        notice_id: &str,
    ) -> Result<HashMap<String, KnownDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT d.fingerprint, d.status, d.text, p.model_version
            FROM documents d
            JOIN solicitations s ON s.id = d.solicitation_id
            LEFT JOIN predictions p ON p.document_id = d.id
            WHERE s.notice_id = ?
            "#,
        )
        .bind(notice_id)
        .fetch_all(&self.pool)
        .await?;

        let mut known: HashMap<String, KnownDocument> = HashMap::new();
        for row in rows {
            let fingerprint: String = row.get("fingerprint");
            let status_raw: String = row.get("status");
            let status = status_raw.parse::<ExtractionStatus>().map_err(StoreError::Other)?;
            let text: Option<String> = row.get("text");
            let version: Option<String> = row.get("model_version");

            let entry = known.entry(fingerprint).or_insert_with(|| KnownDocument {
                status,
                text,
                predicted_versions: Vec::new(),
            });
            entry.predicted_versions.extend(version);
        }
        Ok(known)
    }

    async fn commit_bundle(&self, bundle: &SolicitationBundle) -> Result<CommitReport, StoreError> {
        let summary = &bundle.summary;
        let now = Utc::now().timestamp();
        let mut report = CommitReport::default();
        let mut tx = self.pool.begin().await?;

        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM solicitations WHERE notice_id = ?")
                .bind(&summary.notice_id)
                .fetch_optional(&mut *tx)
                .await?;
        let solicitation_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        sqlx::query(
            r#"
            INSERT INTO solicitations (id, notice_id, solicitation_number, title, notice_type,
                                       posted_date, updated_date, naics_code, agency, office,
                                       hierarchy_degraded, ui_link, raw_json, needs_retry,
                                       created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(notice_id) DO UPDATE SET
                solicitation_number = excluded.solicitation_number,
                title = excluded.title,
                notice_type = excluded.notice_type,
                posted_date = excluded.posted_date,
                updated_date = excluded.updated_date,
                naics_code = excluded.naics_code,
                agency = excluded.agency,
                office = excluded.office,
                hierarchy_degraded = excluded.hierarchy_degraded,
                ui_link = excluded.ui_link,
                raw_json = excluded.raw_json,
                needs_retry = excluded.needs_retry,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&solicitation_id)
        .bind(&summary.notice_id)
        .bind(&summary.solicitation_number)
        .bind(&summary.title)
        .bind(summary.notice_type.code())
        .bind(summary.posted_date.to_string())
        .bind(summary.updated_date.map(|d| d.to_string()))
        .bind(&summary.naics_code)
        .bind(&bundle.hierarchy.agency)
        .bind(&bundle.hierarchy.office)
        .bind(bundle.hierarchy.degraded)
        .bind(&summary.ui_link)
        .bind(serde_json::to_string(&summary.raw)?)
        .bind(bundle.needs_retry)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let doc_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT fingerprint, id FROM documents WHERE solicitation_id = ?")
                .bind(&solicitation_id)
                .fetch_all(&mut *tx)
                .await?;
        let existing_docs: HashMap<String, String> = doc_rows.into_iter().collect();

        let mut doc_ids: HashMap<&str, String> = HashMap::new();
        for doc in &bundle.documents {
            if doc_ids.contains_key(doc.fingerprint.as_str()) {
                continue;
            }
            let (doc_id, is_new) = match existing_docs.get(&doc.fingerprint) {
                Some(id) => (id.clone(), false),
                None => (Uuid::new_v4().to_string(), true),
            };

            // a successful extraction is never overwritten
            sqlx::query(
                r#"
                INSERT INTO documents (id, solicitation_id, fingerprint, filename, size_bytes,
                                       content_type, text, status, status_detail,
                                       created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(solicitation_id, fingerprint) DO UPDATE SET
                    filename = excluded.filename,
                    content_type = excluded.content_type,
                    text = excluded.text,
                    status = excluded.status,
                    status_detail = excluded.status_detail,
                    updated_at = excluded.updated_at
                WHERE documents.status != 'success'
                "#,
            )
            .bind(&doc_id)
            .bind(&solicitation_id)
            .bind(&doc.fingerprint)
            .bind(&doc.filename)
            .bind(doc.size_bytes)
            .bind(&doc.content_type)
            .bind(&doc.text)
            .bind(doc.status.as_str())
            .bind(&doc.status_detail)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if is_new {
                report.documents_inserted += 1;
            }
            doc_ids.insert(doc.fingerprint.as_str(), doc_id);
        }

        for prediction in &bundle.predictions {
            let doc_id = match doc_ids.get(prediction.fingerprint.as_str()) {
                Some(id) => id.as_str(),
                None => match existing_docs.get(&prediction.fingerprint) {
                    Some(id) => id.as_str(),
                    None => {
                        return Err(StoreError::Other(format!(
                            "prediction for unknown document {}",
                            prediction.fingerprint
                        )))
                    }
                },
            };

            let c = &prediction.classification;
            let result = sqlx::query(
                r#"
                INSERT INTO predictions (id, document_id, model_version, label, confidence,
                                         decision_score, predicted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(document_id, model_version) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(doc_id)
            .bind(&prediction.model_version)
            .bind(c.label.as_str())
            .bind(c.confidence)
            .bind(c.decision_score)
            .bind(prediction.predicted_at.timestamp())
            .execute(&mut *tx)
            .await?;
            report.predictions_inserted += result.rows_affected();
        }

        sqlx::query(
            r#"
            UPDATE solicitations SET compliant = (
                SELECT CASE
                    WHEN SUM(p.label = 'non-compliant') > 0 THEN 0
                    WHEN SUM(p.label = 'compliant') > 0 THEN 1
                    ELSE NULL
                END
                FROM predictions p
                JOIN documents d ON d.id = p.document_id
                WHERE d.solicitation_id = ? AND p.model_version = ?
            )
            WHERE id = ?
            "#,
        )
        .bind(&solicitation_id)
        .bind(&bundle.model_version)
        .bind(&solicitation_id)
        .execute(&mut *tx)
        .await?;

        if !bundle.needs_retry {
            sqlx::query("DELETE FROM pending_solicitations WHERE notice_id = ?")
                .bind(&summary.notice_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(
            notice_id = %summary.notice_id,
            documents = report.documents_inserted,
            predictions = report.predictions_inserted,
            "committed solicitation"
        );
        Ok(report)
    }

    async fn enqueue_pending(&self, summaries: &[SolicitationSummary]) -> Result<(), StoreError> {
        if summaries.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for summary in summaries {
            sqlx::query(
                r#"
                INSERT INTO pending_solicitations (notice_id, raw_json, enqueued_at)
                VALUES (?, ?, ?)
                ON CONFLICT(notice_id) DO UPDATE SET
                    raw_json = excluded.raw_json,
                    attempts = pending_solicitations.attempts + 1
                "#,
            )
            .bind(&summary.notice_id)
            .bind(serde_json::to_string(&summary.raw)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending(&self, max_attempts: u32) -> Result<Vec<SolicitationSummary>, StoreError> {
        let exhausted: Vec<(String, i64)> = sqlx::query_as(
            "DELETE FROM pending_solicitations WHERE attempts >= ? RETURNING notice_id, attempts",
        )
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;
        for (notice_id, attempts) in exhausted {
            warn!(notice_id, attempts, "giving up on pending solicitation");
        }

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT notice_id, raw_json FROM pending_solicitations ORDER BY enqueued_at, notice_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (notice_id, raw_json) in rows {
            let parsed = serde_json::from_str::<Value>(&raw_json)
                .map_err(|e| e.to_string())
                .and_then(|v| SolicitationSummary::from_payload(&v).map_err(|e| e.to_string()));
            match parsed {
                Ok(summary) => out.push(summary),
                Err(e) => warn!(notice_id, "unreadable pending entry: {}", e),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Classification, ComplianceLabel, DocumentRecord, HierarchyResolution, PredictionRecord,
    };
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::migrate(&pool).await.unwrap();
        let store = SqliteStore::new(pool);
        store
            .register_model(&ModelInfo {
                version: "v1".into(),
                estimator: "LogisticRegression".into(),
                params: json!({"C": 1.0}),
            })
            .await
            .unwrap();
        store
    }

    fn summary(id: &str) -> SolicitationSummary {
        SolicitationSummary::from_payload(&json!({
            "noticeId": id,
            "title": "Help desk",
            "postedDate": "2024-03-01",
            "naicsCode": "541512",
            "type": "Combined Synopsis/Solicitation"
        }))
        .unwrap()
    }

    fn doc(fp: &str, status: ExtractionStatus, text: Option<&str>) -> DocumentRecord {
        DocumentRecord {
            fingerprint: fp.into(),
            filename: format!("{}.pdf", fp),
            size_bytes: 10,
            content_type: Some("application/pdf".into()),
            text: text.map(str::to_string),
            status,
            status_detail: None,
        }
    }

    fn prediction(fp: &str, label: ComplianceLabel) -> PredictionRecord {
        PredictionRecord {
            fingerprint: fp.into(),
            model_version: "v1".into(),
            classification: Classification {
                label,
                confidence: 0.9,
                decision_score: Some(2.0),
            },
            predicted_at: Utc::now(),
        }
    }

    fn bundle(
        id: &str,
        documents: Vec<DocumentRecord>,
        predictions: Vec<PredictionRecord>,
    ) -> SolicitationBundle {
        SolicitationBundle {
            summary: summary(id),
            hierarchy: HierarchyResolution {
                agency: "GSA".into(),
                office: "FAS".into(),
                degraded: false,
            },
            documents,
            predictions,
            needs_retry: false,
            model_version: "v1".into(),
        }
    }

    async fn count(store: &SqliteStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn recommitting_a_bundle_is_idempotent() {
        let store = store().await;
        let b = bundle(
            "N1",
            vec![doc("aa", ExtractionStatus::Success, Some("Section 508"))],
            vec![prediction("aa", ComplianceLabel::Compliant)],
        );

        let first = store.commit_bundle(&b).await.unwrap();
        assert_eq!(first.documents_inserted, 1);
        assert_eq!(first.predictions_inserted, 1);

        let second = store.commit_bundle(&b).await.unwrap();
        assert_eq!(second, CommitReport::default());
        assert_eq!(count(&store, "solicitations").await, 1);
        assert_eq!(count(&store, "documents").await, 1);
        assert_eq!(count(&store, "predictions").await, 1);
    }

    #[tokio::test]
    async fn successful_text_is_not_overwritten() {
        let store = store().await;
        store
            .commit_bundle(&bundle(
                "N1",
                vec![doc("aa", ExtractionStatus::Success, Some("original"))],
                vec![],
            ))
            .await
            .unwrap();
        store
            .commit_bundle(&bundle(
                "N1",
                vec![doc("aa", ExtractionStatus::Timeout, None)],
                vec![],
            ))
            .await
            .unwrap();

        let known = store.known_documents("N1").await.unwrap();
        assert_eq!(known["aa"].status, ExtractionStatus::Success);
        assert_eq!(known["aa"].text.as_deref(), Some("original"));
    }

    #[tokio::test]
    async fn failed_extraction_is_upgraded_on_rerun() {
        let store = store().await;
        store
            .commit_bundle(&bundle(
                "N1",
                vec![doc("aa", ExtractionStatus::Timeout, None)],
                vec![],
            ))
            .await
            .unwrap();
        store
            .commit_bundle(&bundle(
                "N1",
                vec![doc("aa", ExtractionStatus::Success, Some("later"))],
                vec![],
            ))
            .await
            .unwrap();
        let known = store.known_documents("N1").await.unwrap();
        assert_eq!(known["aa"].status, ExtractionStatus::Success);
    }

    #[tokio::test]
    async fn compliant_rollup_follows_predictions() {
        let store = store().await;
        store
            .commit_bundle(&bundle(
                "N1",
                vec![
                    doc("aa", ExtractionStatus::Success, Some("a")),
                    doc("bb", ExtractionStatus::Success, Some("b")),
                ],
                vec![
                    prediction("aa", ComplianceLabel::Compliant),
                    prediction("bb", ComplianceLabel::NonCompliant),
                ],
            ))
            .await
            .unwrap();
        store
            .commit_bundle(&bundle(
                "N2",
                vec![doc("cc", ExtractionStatus::Success, Some("c"))],
                vec![prediction("cc", ComplianceLabel::Compliant)],
            ))
            .await
            .unwrap();
        store.commit_bundle(&bundle("N3", vec![], vec![])).await.unwrap();

        let rollup = |id: &'static str| {
            let pool = store.pool().clone();
            async move {
                let compliant: Option<i64> =
                    sqlx::query_scalar("SELECT compliant FROM solicitations WHERE notice_id = ?")
                        .bind(id)
                        .fetch_one(&pool)
                        .await
                        .unwrap();
                compliant
            }
        };
        assert_eq!(rollup("N1").await, Some(0));
        assert_eq!(rollup("N2").await, Some(1));
        assert_eq!(rollup("N3").await, None);
    }

    #[tokio::test]
    async fn pending_queue_settles_on_commit_unless_retry_needed() {
        let store = store().await;
        store
            .enqueue_pending(&[summary("N1"), summary("N2")])
            .await
            .unwrap();
        assert_eq!(store.pending(5).await.unwrap().len(), 2);

        store.commit_bundle(&bundle("N1", vec![], vec![])).await.unwrap();
        let mut retry = bundle("N2", vec![], vec![]);
        retry.needs_retry = true;
        store.commit_bundle(&retry).await.unwrap();

        let pending = store.pending(5).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].notice_id, "N2");
    }

    #[tokio::test]
    async fn pending_entry_leaves_queue_after_max_attempts() {
        let store = store().await;
        let mut stuck = bundle("N1", vec![], vec![]);
        stuck.needs_retry = true;

        // first dispatch from a fetch, then two resumed dispatches
        for _ in 0..3 {
            store.enqueue_pending(&[summary("N1")]).await.unwrap();
            store.commit_bundle(&stuck).await.unwrap();
        }
        let attempts: i64 =
            sqlx::query_scalar("SELECT attempts FROM pending_solicitations WHERE notice_id = 'N1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(attempts, 3);

        assert_eq!(store.pending(4).await.unwrap().len(), 1);
        assert!(store.pending(3).await.unwrap().is_empty());
        assert_eq!(count(&store, "pending_solicitations").await, 0);

        let needs_retry: bool =
            sqlx::query_scalar("SELECT needs_retry FROM solicitations WHERE notice_id = 'N1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert!(needs_retry);
    }

    #[tokio::test]
    async fn prediction_without_document_is_rejected_and_rolled_back() {
        let store = store().await;
        let b = bundle("N1", vec![], vec![prediction("zz", ComplianceLabel::Compliant)]);
        assert!(matches!(
            store.commit_bundle(&b).await,
            Err(StoreError::Other(_))
        ));
        assert_eq!(count(&store, "solicitations").await, 0);
    }

    #[tokio::test]
    async fn known_documents_lists_predicted_versions() {
        let store = store().await;
        store
            .commit_bundle(&bundle(
                "N1",
                vec![
                    doc("aa", ExtractionStatus::Success, Some("a")),
                    doc("bb", ExtractionStatus::UnsupportedFormat, None),
                ],
                vec![prediction("aa", ComplianceLabel::Compliant)],
            ))
            .await
            .unwrap();
        let known = store.known_documents("N1").await.unwrap();
        assert_eq!(known.len(), 2);
        assert_eq!(known["aa"].predicted_versions, vec!["v1".to_string()]);
        assert!(known["bb"].predicted_versions.is_empty());
        assert!(store.known_documents("other").await.unwrap().is_empty());
    }
}
