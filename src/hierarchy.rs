//! Agency/office name resolution with a per-process cache.
//!
//! Lookups go to the in-memory cache first and to the upstream hierarchy
//! source on a miss. A failed lookup never blocks ingestion: the resolver
//! falls back to the raw code as both names and marks the result degraded.
//! Degraded answers are not cached.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::models::{HierarchyResolution, SolicitationSummary};
use crate::retry::RetryPolicy;

/// Canonical names returned by the hierarchy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgNames {
    pub agency: String,
    pub office: String,
}

/// Upstream lookup of an organisation code. `Ok(None)` means not found.
#[async_trait]
pub trait HierarchySource: Send + Sync {
    async fn lookup(&self, code: &str) -> Result<Option<OrgNames>, UpstreamError>;
}

pub struct HierarchyResolver {
    source: Arc<dyn HierarchySource>,
    retry: RetryPolicy,
    cache: RwLock<HashMap<String, OrgNames>>,
}

impl HierarchyResolver {
    pub fn new(source: Arc<dyn HierarchySource>, retry: RetryPolicy) -> Self {
        Self {
            source,
            retry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the names for a solicitation.
    pub async fn resolve_for(&self, summary: &SolicitationSummary) -> HierarchyResolution {
        match summary.org_code.as_deref().and_then(leaf_code) {
            Some(code) => self.resolve(code).await,
            None => {
                warn!(notice_id = %summary.notice_id, "no organisation code on record");
                from_path_name(summary.org_path_name.as_deref())
            }
        }
    }

    /// Resolve one organisation code.
    pub async fn resolve(&self, code: &str) -> HierarchyResolution {
        if let Some(names) = self.cache.read().await.get(code) {
            return HierarchyResolution {
                agency: names.agency.clone(),
                office: names.office.clone(),
                degraded: false,
            };
        }

        let source = &self.source;
        match self
            .retry
            .run("hierarchy lookup", || source.lookup(code))
            .await
        {
            Ok(Some(names)) => {
                debug!(code, agency = %names.agency, office = %names.office, "resolved organisation");
                self.cache
                    .write()
                    .await
                    .insert(code.to_string(), names.clone());
                HierarchyResolution {
                    agency: names.agency,
                    office: names.office,
                    degraded: false,
                }
            }
            Ok(None) => {
                warn!(code, "organisation not found upstream, using fallback names");
                fallback(code)
            }
            Err(e) => {
                warn!(code, kind = %e.kind(), "organisation lookup failed, using fallback names: {}", e);
                fallback(code)
            }
        }
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// Last segment of a dotted org path code (`097.DLA.SP4701` → `SP4701`).
fn leaf_code(path: &str) -> Option<&str> {
    path.rsplit('.').map(str::trim).find(|s| !s.is_empty())
}

fn fallback(code: &str) -> HierarchyResolution {
    HierarchyResolution {
        agency: code.to_string(),
        office: code.to_string(),
        degraded: true,
    }
}

/// Names for a record with no org code: first and last segment of the
/// dotted parent-path name, or `UNKNOWN`.
fn from_path_name(path_name: Option<&str>) -> HierarchyResolution {
    let segments: Vec<&str> = path_name
        .map(|p| p.split('.').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    match (segments.first(), segments.last()) {
        (Some(agency), Some(office)) => HierarchyResolution {
            agency: agency.to_string(),
            office: office.to_string(),
            degraded: true,
        },
        _ => fallback("UNKNOWN"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        known: HashMap<String, OrgNames>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeSource {
        fn new(fail: bool) -> Self {
            let mut known = HashMap::new();
            known.insert(
                "SP4701".to_string(),
                OrgNames {
                    agency: "DEPT OF DEFENSE".to_string(),
                    office: "DLA AVIATION".to_string(),
                },
            );
            Self {
                known,
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl HierarchySource for FakeSource {
        async fn lookup(&self, code: &str) -> Result<Option<OrgNames>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpstreamError::Transient("connection reset".into()));
            }
            Ok(self.known.get(code).cloned())
        }
    }

    #[tokio::test]
    async fn caches_successful_lookups() {
        let source = Arc::new(FakeSource::new(false));
        let resolver = HierarchyResolver::new(source.clone(), RetryPolicy::none());

        let first = resolver.resolve("SP4701").await;
        let second = resolver.resolve("SP4701").await;
        assert_eq!(first, second);
        assert_eq!(first.agency, "DEPT OF DEFENSE");
        assert!(!first.degraded);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_len().await, 1);
    }

    #[tokio::test]
    async fn unknown_code_falls_back_to_raw_code() {
        let resolver = HierarchyResolver::new(Arc::new(FakeSource::new(false)), RetryPolicy::none());
        let r = resolver.resolve("ZZ999").await;
        assert_eq!(r.agency, "ZZ999");
        assert_eq!(r.office, "ZZ999");
        assert!(r.degraded);
        assert_eq!(resolver.cached_len().await, 0);
    }

    #[tokio::test]
    async fn upstream_failure_degrades_without_caching() {
        let source = Arc::new(FakeSource::new(true));
        let resolver = HierarchyResolver::new(source.clone(), RetryPolicy::none());
        let r = resolver.resolve("SP4701").await;
        assert_eq!(r.agency, "SP4701");
        assert!(r.degraded);

        resolver.resolve("SP4701").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn record_without_code_uses_path_name() {
        let r = from_path_name(Some("DEPT OF DEFENSE.DEFENSE LOGISTICS AGENCY.DLA AVIATION"));
        assert_eq!(r.agency, "DEPT OF DEFENSE");
        assert_eq!(r.office, "DLA AVIATION");
        assert!(r.degraded);
        assert_eq!(from_path_name(None).agency, "UNKNOWN");
    }

    #[test]
    fn leaf_code_takes_last_segment() {
        assert_eq!(leaf_code("097.DLA.SP4701"), Some("SP4701"));
        assert_eq!(leaf_code("7500"), Some("7500"));
        assert_eq!(leaf_code(""), None);
    }
}
