//! One incremental run: page → enrich → merge → persist.

use crate::enrich::{Enricher, EnrichmentFailure, SubjectProfile};
use crate::observability;
use crate::paginator::HistoryPaginator;
use crate::store::{self, JsonFileStore, SyncState};
use crate::{ScaleApi, ScaleError};
use serde::Serialize;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct SyncOptions {
    pub device_id: String,
    pub page_size: u32,
    pub subject: SubjectProfile,
    pub enrich_concurrency: usize,
}

/// What a run did.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub pages: u32,
    /// New records returned by the paginator for this subject.
    pub fetched: usize,
    pub appended: usize,
    /// Records persisted with an analysis report.
    pub enriched: usize,
    pub failures: Vec<EnrichmentFailure>,
    /// Checkpoint after the run, derived from the persisted records.
    pub last_created_at: Option<i64>,
}

/// Fetch everything newer than the store's checkpoint, enrich it and append
/// it to the store.
///
/// Any paging error aborts the run before the store is touched. Cancellation
/// is observed between pages and between records, never inside a request,
/// and also leaves the store untouched.
pub async fn run_sync(
    api: &dyn ScaleApi,
    store: &JsonFileStore,
    options: &SyncOptions,
    cancel: &watch::Receiver<bool>,
) -> Result<SyncReport, ScaleError> {
    let result = run(api, store, options, cancel).await;
    match &result {
        Ok(report) => {
            observability::record_sync(report);
            tracing::info!(
                pages = report.pages,
                fetched = report.fetched,
                appended = report.appended,
                enriched = report.enriched,
                failures = report.failures.len(),
                last_created_at = ?report.last_created_at,
                "sync finished"
            );
        }
        Err(ScaleError::Cancelled) => {
            observability::record_sync_failure("cancelled");
            tracing::info!("sync cancelled; store left unchanged");
        }
        Err(e) => {
            observability::record_sync_failure("error");
            tracing::error!(error = %e, "sync aborted; store left unchanged");
        }
    }
    result
}

async fn run(
    api: &dyn ScaleApi,
    store: &JsonFileStore,
    options: &SyncOptions,
    cancel: &watch::Receiver<bool>,
) -> Result<SyncReport, ScaleError> {
    let existing = store.load()?;
    let state = SyncState::derive(&existing);
    tracing::debug!(
        path = %store.path().display(),
        persisted = existing.len(),
        last_created_at = ?state.last_created_at,
        "loaded store"
    );

    let mut pager = HistoryPaginator::new(
        api,
        options.device_id.as_str(),
        options.page_size,
        state.last_created_at,
    );
    let mut raw = Vec::new();
    loop {
        if *cancel.borrow() {
            return Err(ScaleError::Cancelled);
        }
        let Some(page) = pager.next_page().await? else {
            break;
        };
        raw.extend(page.into_iter().filter(|r| options.subject.matches(r)));
    }
    let pages = pager.pages_fetched();
    let fetched = raw.len();

    let enricher = Enricher::new(
        api,
        &options.device_id,
        &options.subject,
        options.enrich_concurrency,
    );
    let batch = enricher.enrich_batch(raw, cancel).await?;
    if *cancel.borrow() {
        return Err(ScaleError::Cancelled);
    }

    let merged = store::merge(existing, batch.records);
    if merged.appended > 0 {
        store.persist(&merged.records)?;
    }

    Ok(SyncReport {
        pages,
        fetched,
        appended: merged.appended,
        enriched: batch.reports,
        failures: batch.failures,
        last_created_at: SyncState::derive(&merged.records).last_created_at,
    })
}
