//! Persistence coordinator: the single writer.
//!
//! Each solicitation bundle is committed in one transaction. Transient
//! storage failures (busy/locked, unique races, I/O, pool timeout) get exactly
//! one more attempt; anything else is returned to the caller, which records a
//! solicitation-level failure and carries on with the run.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::StoreError;
use crate::models::{CommitReport, SolicitationBundle};
use crate::store::Store;

const RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct PersistenceCoordinator {
    store: Arc<dyn Store>,
    retry_delay: Duration,
}

impl PersistenceCoordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn commit(&self, bundle: &SolicitationBundle) -> Result<CommitReport, StoreError> {
        match self.store.commit_bundle(bundle).await {
            Err(e) if e.is_transient() => {
                warn!(
                    notice_id = %bundle.summary.notice_id,
                    kind = %e.kind(),
                    "transient storage failure, retrying once: {}",
                    e
                );
                tokio::time::sleep(self.retry_delay).await;
                self.store.commit_bundle(bundle).await
            }
            other => other,
        }
    }
}
