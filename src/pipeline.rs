//! Ingestion pipeline orchestration.
//!
//! Drives one run: fetch → (per solicitation) resolve hierarchy → retrieve
//! archive → (per document) extract → classify → commit. Document failures
//! become recorded statuses, solicitation failures are logged and counted,
//! and only fatal configuration problems stop the run before it starts.
//!
//! Solicitations run on a semaphore-bounded task set; documents within a
//! solicitation have their own bound. Every dispatched notice is written to
//! the pending queue first and removed in the same transaction that commits
//! it, so anything cut off by the run timeout is picked up by the next run.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveRetriever, ArchiveSource, Retrieval, UnpackedFile};
use crate::classify::{Classifier, ComplianceModel, LinearTextModel};
use crate::config::Config;
use crate::db;
use crate::error::StoreError;
use crate::extract::{Decoder, Extractor, Format};
use crate::fetcher::{Fetcher, NaicsFilter, OpportunitySource};
use crate::hierarchy::{HierarchyResolver, HierarchySource};
use crate::migrate;
use crate::models::{
    DateWindow, DocumentRecord, ExtractionStatus, KnownDocument, PredictionRecord,
    SolicitationBundle, SolicitationSummary,
};
use crate::persist::PersistenceCoordinator;
use crate::retry::RetryPolicy;
use crate::sam::SamClient;
use crate::store::{SqliteStore, Store};

/// Process-scoped collaborators, shared read-only by every worker.
#[derive(Clone)]
pub struct Collaborators {
    pub opportunities: Arc<dyn OpportunitySource>,
    pub archives: Arc<dyn ArchiveSource>,
    pub hierarchy: Arc<dyn HierarchySource>,
    pub model: Arc<dyn ComplianceModel>,
    pub store: Arc<dyn Store>,
    /// Replaces the built-in format decoders when set.
    pub decoder: Option<Arc<Decoder>>,
}

/// Tunables for one pipeline, normally taken from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub naics: Vec<String>,
    pub page_size: u32,
    pub retry: RetryPolicy,
    pub work_dir: Option<PathBuf>,
    pub max_entry_bytes: u64,
    pub extraction_timeout: Duration,
    pub documents_per_solicitation: usize,
    pub workers: usize,
    pub run_timeout: Duration,
    pub max_pending_attempts: u32,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            naics: config.filter.naics.clone(),
            page_size: config.upstream.page_size,
            retry: RetryPolicy::new(
                config.upstream.max_retries,
                Duration::from_millis(config.upstream.backoff_base_ms),
            ),
            work_dir: config.archive.work_dir.clone(),
            max_entry_bytes: config.archive.max_entry_bytes,
            extraction_timeout: config.extraction.timeout(),
            documents_per_solicitation: config.extraction.max_concurrent,
            workers: config.pipeline.workers,
            run_timeout: Duration::from_secs(config.pipeline.run_timeout_secs),
            max_pending_attempts: config.pipeline.max_pending_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every solicitation committed; document-level degradation allowed.
    Success,
    /// A solicitation failed outright or the run timed out.
    PartialFailure,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub model_version: String,
    pub solicitations_dispatched: usize,
    pub solicitations_processed: usize,
    pub solicitations_failed: usize,
    pub solicitations_needing_retry: usize,
    pub documents_extracted: usize,
    pub documents_reused: usize,
    pub documents_failed: usize,
    pub predictions: u64,
    pub filtered: usize,
    pub malformed: usize,
    pub fetch_warnings: usize,
    pub timed_out: bool,
}

impl RunSummary {
    pub fn outcome(&self) -> RunOutcome {
        if self.solicitations_failed > 0 || self.timed_out {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }

    /// Dispatched but neither committed nor failed; cut off by the timeout
    /// and left on the pending queue.
    pub fn abandoned(&self) -> usize {
        self.solicitations_dispatched
            .saturating_sub(self.solicitations_processed + self.solicitations_failed)
    }

    pub fn print(&self, window: &DateWindow) {
        println!("run {}", window);
        println!("  model: {}", self.model_version);
        println!(
            "  solicitations: {} processed, {} failed, {} awaiting attachments",
            self.solicitations_processed, self.solicitations_failed, self.solicitations_needing_retry
        );
        println!(
            "  documents: {} extracted, {} reused, {} failed",
            self.documents_extracted, self.documents_reused, self.documents_failed
        );
        println!("  predictions: {}", self.predictions);
        println!("  filtered (naics): {}", self.filtered);
        if self.malformed > 0 {
            println!("  malformed records: {}", self.malformed);
        }
        if self.fetch_warnings > 0 {
            println!("  pagination ended early: {} time(s)", self.fetch_warnings);
        }
        if self.timed_out {
            println!("  timed out: {} solicitation(s) left pending", self.abandoned());
        }
        match self.outcome() {
            RunOutcome::Success => println!("ok"),
            RunOutcome::PartialFailure => println!("partial failure"),
        }
    }
}

/// What one solicitation task produced.
#[derive(Debug, Clone, Default)]
struct Processed {
    documents_extracted: usize,
    documents_reused: usize,
    documents_failed: usize,
    predictions: u64,
    needs_retry: bool,
}

type SolicitationTasks = JoinSet<(String, Result<Processed, StoreError>)>;

/// How long a timed-out run waits for tasks that are already finishing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct Pipeline {
    fetcher: Fetcher,
    worker: Arc<Worker>,
    store: Arc<dyn Store>,
    workers: usize,
    run_timeout: Duration,
    max_pending_attempts: u32,
}

impl Pipeline {
    pub fn new(collab: Collaborators, settings: PipelineSettings) -> Self {
        let fetcher = Fetcher::new(
            collab.opportunities,
            NaicsFilter::new(settings.naics),
            settings.retry,
            settings.page_size,
        );
        let worker = Worker {
            hierarchy: HierarchyResolver::new(collab.hierarchy, settings.retry),
            archives: ArchiveRetriever::new(
                collab.archives,
                settings.retry,
                settings.work_dir,
                settings.max_entry_bytes,
            ),
            extractor: match collab.decoder {
                Some(decoder) => Extractor::with_decoder(settings.extraction_timeout, decoder),
                None => Extractor::new(settings.extraction_timeout),
            },
            classifier: Classifier::new(collab.model),
            persist: PersistenceCoordinator::new(collab.store.clone()),
            documents_per_solicitation: settings.documents_per_solicitation.max(1),
        };
        Self {
            fetcher,
            worker: Arc::new(worker),
            store: collab.store,
            workers: settings.workers.max(1),
            run_timeout: settings.run_timeout,
            max_pending_attempts: settings.max_pending_attempts.max(1),
        }
    }

    /// Build the production pipeline. Every failure here is fatal-config.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.upstream.api_key()?;
        let client = Arc::new(SamClient::new(&config.upstream, api_key)?);

        let model = LinearTextModel::load(&config.model.path)
            .with_context(|| format!("loading model from {}", config.model.path.display()))?;

        let pool = db::connect(config).await?;
        migrate::migrate(&pool)
            .await
            .context("preparing database schema")?;

        let collab = Collaborators {
            opportunities: client.clone(),
            archives: client.clone(),
            hierarchy: client,
            model: Arc::new(model),
            store: Arc::new(SqliteStore::new(pool)),
            decoder: None,
        };
        Ok(Self::new(collab, PipelineSettings::from_config(config)))
    }

    /// Process every pending notice, then every qualifying solicitation in
    /// `window`, stopping after `limit` dispatches if given.
    pub async fn run(&self, window: DateWindow, limit: Option<usize>) -> Result<RunSummary> {
        let info = self.worker.classifier.info();
        self.store
            .register_model(info)
            .await
            .with_context(|| format!("registering model {}", info.version))?;

        let mut summary = RunSummary {
            model_version: info.version.clone(),
            ..RunSummary::default()
        };

        info!(%window, model = %info.version, workers = self.workers, "starting run");
        let mut tasks = SolicitationTasks::new();
        let driven = tokio::time::timeout(
            self.run_timeout,
            self.drive(window, limit, &mut tasks, &mut summary),
        )
        .await;
        if driven.is_err() {
            summary.timed_out = true;
            // count what committed before the deadline; abort the rest
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while let Some(joined) = tasks.join_next().await {
                    tally(&mut summary, joined);
                }
            })
            .await;
            tasks.shutdown().await;
            warn!(
                timeout_secs = self.run_timeout.as_secs(),
                abandoned = summary.abandoned(),
                "run timed out, outstanding solicitations stay pending"
            );
        }

        info!(
            processed = summary.solicitations_processed,
            failed = summary.solicitations_failed,
            documents = summary.documents_extracted,
            predictions = summary.predictions,
            "run finished"
        );
        Ok(summary)
    }

    async fn drive(
        &self,
        window: DateWindow,
        limit: Option<usize>,
        tasks: &mut SolicitationTasks,
        summary: &mut RunSummary,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut dispatched: HashSet<String> = HashSet::new();
        let remaining = |dispatched: &HashSet<String>| {
            limit.map_or(usize::MAX, |l| l.saturating_sub(dispatched.len()))
        };

        let pending = match self.store.pending(self.max_pending_attempts).await {
            Ok(p) => p,
            Err(e) => {
                warn!(kind = %e.kind(), "could not read pending queue: {}", e);
                Vec::new()
            }
        };
        if !pending.is_empty() {
            info!(count = pending.len(), "resuming pending solicitations");
        }
        let resumed: Vec<SolicitationSummary> =
            pending.into_iter().take(remaining(&dispatched)).collect();
        // re-enqueueing counts this attempt against the cap
        if let Err(e) = self.store.enqueue_pending(&resumed).await {
            warn!(kind = %e.kind(), "could not record pending attempts: {}", e);
        }
        for s in resumed {
            dispatched.insert(s.notice_id.clone());
            self.dispatch(tasks, &semaphore, s, summary).await;
        }

        let mut pages = self.fetcher.pages(window);
        while remaining(&dispatched) > 0 {
            let page = match pages.next_page().await {
                Some(Ok(page)) => page,
                Some(Err(e)) => {
                    summary.fetch_warnings += 1;
                    warn!(kind = %e.kind(), "pagination ended early, keeping earlier pages: {}", e);
                    break;
                }
                None => break,
            };
            summary.filtered += page.filtered;
            summary.malformed += page.malformed;

            let budget = remaining(&dispatched);
            let mut fresh: Vec<SolicitationSummary> = Vec::new();
            for s in page.summaries {
                if fresh.len() >= budget {
                    break;
                }
                if dispatched.insert(s.notice_id.clone()) {
                    fresh.push(s);
                }
            }
            if let Err(e) = self.store.enqueue_pending(&fresh).await {
                warn!(kind = %e.kind(), "could not record pending solicitations: {}", e);
            }
            for s in fresh {
                self.dispatch(tasks, &semaphore, s, summary).await;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            tally(summary, joined);
        }
    }

    async fn dispatch(
        &self,
        tasks: &mut SolicitationTasks,
        semaphore: &Arc<Semaphore>,
        solicitation: SolicitationSummary,
        summary: &mut RunSummary,
    ) {
        // waits here when every worker is busy, which also paces pagination
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        summary.solicitations_dispatched += 1;
        let worker = self.worker.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let notice_id = solicitation.notice_id.clone();
            let result = worker.process(solicitation).await;
            (notice_id, result)
        });
    }
}

fn tally(
    summary: &mut RunSummary,
    joined: Result<(String, Result<Processed, StoreError>), tokio::task::JoinError>,
) {
    match joined {
        Ok((notice_id, result)) => record(summary, &notice_id, result),
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            summary.solicitations_failed += 1;
            error!("solicitation task failed: {}", e);
        }
    }
}

fn record(summary: &mut RunSummary, notice_id: &str, result: Result<Processed, StoreError>) {
    match result {
        Ok(p) => {
            summary.solicitations_processed += 1;
            summary.documents_extracted += p.documents_extracted;
            summary.documents_reused += p.documents_reused;
            summary.documents_failed += p.documents_failed;
            summary.predictions += p.predictions;
            if p.needs_retry {
                summary.solicitations_needing_retry += 1;
            }
        }
        Err(e) => {
            summary.solicitations_failed += 1;
            error!(notice_id, kind = %e.kind(), "solicitation failed: {}", e);
        }
    }
}

/// Hex SHA-256 of a file's bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Per-solicitation stages, shared by every task.
struct Worker {
    hierarchy: HierarchyResolver,
    archives: ArchiveRetriever,
    extractor: Extractor,
    classifier: Classifier,
    persist: PersistenceCoordinator,
    documents_per_solicitation: usize,
}

/// One document's result, before commit.
struct DocOutcome {
    record: DocumentRecord,
    prediction: Option<PredictionRecord>,
    extracted: bool,
    reused: bool,
}

impl Worker {
    async fn process(self: Arc<Self>, summary: SolicitationSummary) -> Result<Processed, StoreError> {
        let notice_id = summary.notice_id.clone();
        debug!(notice_id = %notice_id, "processing solicitation");

        let hierarchy = self.hierarchy.resolve_for(&summary).await;
        let known = match self.persist.store().known_documents(&notice_id).await {
            Ok(k) => k,
            Err(e) => {
                warn!(notice_id = %notice_id, "could not read stored documents: {}", e);
                HashMap::new()
            }
        };

        // the archive guard lives until every document has been read
        let (archive, needs_retry) = match self.archives.retrieve(&notice_id).await {
            Retrieval::Unpacked(archive) => (Some(archive), false),
            Retrieval::Unavailable { reason } => {
                warn!(notice_id = %notice_id, "attachments unavailable, flagged for retry: {}", reason);
                (None, true)
            }
        };
        let files = archive.as_ref().map(|a| a.files.clone()).unwrap_or_default();

        let outcomes = self.clone().process_documents(&notice_id, files, known).await;
        drop(archive);

        let mut processed = Processed {
            needs_retry,
            ..Processed::default()
        };
        let mut seen: HashSet<String> = HashSet::new();
        let mut documents = Vec::new();
        let mut predictions = Vec::new();
        for outcome in outcomes {
            // identical bytes under one notice are one document
            if !seen.insert(outcome.record.fingerprint.clone()) {
                continue;
            }
            if outcome.record.status == ExtractionStatus::Success {
                if outcome.reused {
                    processed.documents_reused += 1;
                } else if outcome.extracted {
                    processed.documents_extracted += 1;
                }
            } else {
                processed.documents_failed += 1;
            }
            predictions.extend(outcome.prediction);
            documents.push(outcome.record);
        }

        let bundle = SolicitationBundle {
            summary,
            hierarchy,
            documents,
            predictions,
            needs_retry,
            model_version: self.classifier.version().to_string(),
        };
        let report = self.persist.commit(&bundle).await?;
        processed.predictions = report.predictions_inserted;

        info!(
            notice_id = %notice_id,
            documents = bundle.documents.len(),
            new_documents = report.documents_inserted,
            predictions = report.predictions_inserted,
            degraded_hierarchy = bundle.hierarchy.degraded,
            "solicitation committed"
        );
        Ok(processed)
    }

    /// Extract and classify every file, bounded per solicitation. Results
    /// come back in archive order.
    async fn process_documents(
        self: Arc<Self>,
        notice_id: &str,
        files: Vec<UnpackedFile>,
        known: HashMap<String, KnownDocument>,
    ) -> Vec<DocOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.documents_per_solicitation));
        let known = Arc::new(known);
        let notice: Arc<str> = Arc::from(notice_id);
        let mut tasks: JoinSet<(usize, DocOutcome)> = JoinSet::new();

        for (index, file) in files.into_iter().enumerate() {
            let worker = self.clone();
            let semaphore = semaphore.clone();
            let known = known.clone();
            let notice = notice.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = worker.process_document(&notice, file, &known).await;
                (index, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => outcomes.push(pair),
                Err(e) => error!(notice_id, "document task failed: {}", e),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, o)| o).collect()
    }

    async fn process_document(
        &self,
        notice_id: &str,
        file: UnpackedFile,
        known: &HashMap<String, KnownDocument>,
    ) -> DocOutcome {
        let content_type = Format::from_filename(&file.name).map(|f| f.mime().to_string());

        let bytes = match &file.unpack_error {
            Some(e) => Err(e.clone()),
            None => tokio::fs::read(&file.path).await.map_err(|e| e.to_string()),
        };
        let bytes = match bytes {
            Ok(b) => b,
            Err(detail) => {
                warn!(notice_id, file = %file.name, "unreadable archive entry: {}", detail);
                let mut key = file.name.as_bytes().to_vec();
                key.extend_from_slice(&file.size.to_le_bytes());
                return DocOutcome {
                    record: DocumentRecord {
                        fingerprint: fingerprint(&key),
                        filename: file.name,
                        size_bytes: file.size as i64,
                        content_type,
                        text: None,
                        status: ExtractionStatus::CorruptOrUnreadable,
                        status_detail: Some(detail),
                    },
                    prediction: None,
                    extracted: false,
                    reused: false,
                };
            }
        };

        let fp = fingerprint(&bytes);
        let size_bytes = bytes.len() as i64;
        let previous = known.get(&fp);

        let (text, status, detail, extracted, reused) = match previous {
            Some(k) if k.status == ExtractionStatus::Success => {
                debug!(notice_id, file = %file.name, "already extracted, reusing text");
                (k.text.clone(), ExtractionStatus::Success, None, false, true)
            }
            _ => match self.extractor.extract(bytes, file.name.clone()).await {
                Ok(t) => (Some(t.joined()), ExtractionStatus::Success, None, true, false),
                Err(failure) => {
                    warn!(
                        notice_id,
                        file = %file.name,
                        status = %failure.status(),
                        kind = %failure.kind(),
                        "extraction failed: {}",
                        failure
                    );
                    (None, failure.status(), Some(failure.to_string()), false, false)
                }
            },
        };

        let version = self.classifier.version();
        let already_predicted = previous
            .map(|k| k.predicted_versions.iter().any(|v| v == version))
            .unwrap_or(false);

        let prediction = match (&status, already_predicted) {
            (ExtractionStatus::Success, false) => {
                let body = text.as_deref().unwrap_or("");
                let classification = self.classifier.classify(notice_id, &file.name, body).await;
                debug!(notice_id, file = %file.name, label = %classification.label, "classified");
                Some(PredictionRecord {
                    fingerprint: fp.clone(),
                    model_version: version.to_string(),
                    classification,
                    predicted_at: Utc::now(),
                })
            }
            _ => None,
        };

        DocOutcome {
            record: DocumentRecord {
                fingerprint: fp,
                filename: file.name,
                size_bytes,
                content_type,
                text,
                status,
                status_detail: detail,
            },
            prediction,
            extracted,
            reused,
        }
    }
}

/// Resolve the date window from optional `--since`/`--until` values.
///
/// With neither, the window is the previous UTC calendar day. A lone
/// `--since` runs through yesterday (or just that day, if later).
pub fn resolve_window(
    since: Option<&str>,
    until: Option<&str>,
    today: NaiveDate,
) -> Result<DateWindow> {
    let default = DateWindow::previous_day(today);
    let parse = |flag: &str, s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("{} must be YYYY-MM-DD, got '{}'", flag, s))
    };

    let from = match since {
        Some(s) => parse("--since", s)?,
        None => default.from,
    };
    let to = match until {
        Some(s) => parse("--until", s)?,
        None => default.to.max(from),
    };
    if from > to {
        bail!("--since ({}) is after --until ({})", from, to);
    }
    Ok(DateWindow { from, to })
}

/// `srt run`.
pub async fn run_ingest(
    config: &Config,
    since: Option<String>,
    until: Option<String>,
    limit: Option<usize>,
) -> Result<RunOutcome> {
    let window = resolve_window(
        since.as_deref(),
        until.as_deref(),
        Utc::now().date_naive(),
    )?;
    let pipeline = Pipeline::from_config(config).await?;
    let summary = pipeline.run(window, limit).await?;
    summary.print(&window);
    Ok(summary.outcome())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn default_window_is_previous_day() {
        let w = resolve_window(None, None, day("2024-03-02")).unwrap();
        assert_eq!(w.from, day("2024-03-01"));
        assert_eq!(w.to, day("2024-03-01"));
    }

    #[test]
    fn explicit_window() {
        let w = resolve_window(Some("2024-02-01"), Some("2024-02-03"), day("2024-03-02")).unwrap();
        assert_eq!((w.from, w.to), (day("2024-02-01"), day("2024-02-03")));

        let w = resolve_window(Some("2024-02-01"), None, day("2024-03-02")).unwrap();
        assert_eq!(w.to, day("2024-03-01"));
    }

    #[test]
    fn inverted_or_malformed_window_is_rejected() {
        assert!(resolve_window(Some("2024-02-05"), Some("2024-02-01"), day("2024-03-02")).is_err());
        assert!(resolve_window(Some("02/01/2024"), None, day("2024-03-02")).is_err());
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn outcome_reflects_failures_and_timeouts() {
        let mut s = RunSummary::default();
        assert_eq!(s.outcome(), RunOutcome::Success);
        s.documents_failed = 3;
        assert_eq!(s.outcome(), RunOutcome::Success);
        s.timed_out = true;
        assert_eq!(s.outcome(), RunOutcome::PartialFailure);

        let s = RunSummary {
            solicitations_dispatched: 5,
            solicitations_processed: 2,
            solicitations_failed: 1,
            ..RunSummary::default()
        };
        assert_eq!(s.outcome(), RunOutcome::PartialFailure);
        assert_eq!(s.abandoned(), 2);
    }
}
