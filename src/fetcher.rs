//! Solicitation fetcher.
//!
//! Pages through the opportunity source for a posted-date window and yields
//! validated, NAICS-qualified [`SolicitationSummary`] values one page at a
//! time. The page sequence is single-pass: once it ends (source exhausted or
//! retries used up) it stays ended.
//!
//! Records that fail validation are counted as malformed and logged; records
//! without a qualifying NAICS code are counted as filtered and dropped
//! without a warning.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::models::{DateWindow, SolicitationSummary};
use crate::retry::RetryPolicy;

/// One raw page from the opportunity source.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    /// Total matching records, when the source reports it.
    pub total_records: Option<u64>,
    pub records: Vec<Value>,
}

/// Paged search over posted solicitations.
#[async_trait]
pub trait OpportunitySource: Send + Sync {
    async fn search(
        &self,
        window: &DateWindow,
        offset: u64,
        limit: u32,
    ) -> Result<SearchPage, UpstreamError>;
}

/// Qualifying NAICS codes. A configured code qualifies every record code it
/// prefixes, so `5415` admits `541512` but `541512` admits only itself.
#[derive(Debug, Clone)]
pub struct NaicsFilter {
    codes: Vec<String>,
}

impl NaicsFilter {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn qualifies(&self, code: Option<&str>) -> bool {
        match code.map(str::trim) {
            Some(c) if !c.is_empty() => self.codes.iter().any(|q| c.starts_with(q.as_str())),
            _ => false,
        }
    }
}

/// A filtered page of solicitations.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub summaries: Vec<SolicitationSummary>,
    /// Records dropped for a missing or non-qualifying NAICS code.
    pub filtered: usize,
    /// Records dropped because they failed validation.
    pub malformed: usize,
}

pub struct Fetcher {
    source: Arc<dyn OpportunitySource>,
    naics: NaicsFilter,
    retry: RetryPolicy,
    page_size: u32,
}

impl Fetcher {
    pub fn new(
        source: Arc<dyn OpportunitySource>,
        naics: NaicsFilter,
        retry: RetryPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            source,
            naics,
            retry,
            page_size: page_size.max(1),
        }
    }

    /// Start a single pass over `window`.
    pub fn pages(&self, window: DateWindow) -> SolicitationPages<'_> {
        SolicitationPages {
            fetcher: self,
            window,
            offset: 0,
            done: false,
        }
    }

    /// Validate and filter one raw page.
    pub fn filter_page(&self, raw: &[Value]) -> Page {
        let mut page = Page::default();
        for record in raw {
            match SolicitationSummary::from_payload(record) {
                Ok(summary) => {
                    if self.naics.qualifies(summary.naics_code.as_deref()) {
                        page.summaries.push(summary);
                    } else {
                        debug!(notice_id = %summary.notice_id, naics = ?summary.naics_code, "dropping non-qualifying record");
                        page.filtered += 1;
                    }
                }
                Err(e) => {
                    let notice_id = record.get("noticeId").and_then(Value::as_str).unwrap_or("?");
                    warn!(notice_id, kind = %e.kind(), "skipping malformed record: {}", e);
                    page.malformed += 1;
                }
            }
        }
        page
    }
}

/// Lazy page sequence returned by [`Fetcher::pages`].
pub struct SolicitationPages<'a> {
    fetcher: &'a Fetcher,
    window: DateWindow,
    offset: u64,
    done: bool,
}

impl SolicitationPages<'_> {
    /// Fetch the next page.
    ///
    /// Returns `None` when the source is exhausted. An `Err` means retries
    /// ran out; the sequence ends after it, and pages already returned stay
    /// valid.
    pub async fn next_page(&mut self) -> Option<Result<Page, UpstreamError>> {
        if self.done {
            return None;
        }

        let source = &self.fetcher.source;
        let window = self.window;
        let offset = self.offset;
        let limit = self.fetcher.page_size;

        let raw = match self
            .fetcher
            .retry
            .run("search opportunities", || source.search(&window, offset, limit))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if raw.records.is_empty() {
            self.done = true;
            return None;
        }

        self.offset += raw.records.len() as u64;
        self.done = match raw.total_records {
            Some(total) => self.offset >= total,
            None => raw.records.len() < limit as usize,
        };

        Some(Ok(self.fetcher.filter_page(&raw.records)))
    }
}
