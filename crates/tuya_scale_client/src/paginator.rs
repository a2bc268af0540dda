//! Cursor-driven walk over a device's measurement history.
//!
//! Each page request starts at the `created_at` of the last record delivered
//! so far, so a window may overlap the previous one; overlapping rows are
//! dropped by `record_id`. Records at or before the resume cutoff never leave
//! the paginator.

use crate::observability;
use crate::{PageCursor, RawMeasurement, ScaleApi, ScaleError};
use futures_util::stream::{self, Stream, TryStreamExt};
use std::collections::HashSet;

pub struct HistoryPaginator<'a> {
    api: &'a dyn ScaleApi,
    device_id: String,
    page_size: u32,
    cutoff: Option<i64>,
    cursor: PageCursor,
    delivered: HashSet<String>,
    pages: u32,
    done: bool,
}

impl<'a> HistoryPaginator<'a> {
    /// Start right after `cutoff` (the newest persisted `created_at`), or at
    /// epoch 0 when nothing has been persisted yet.
    pub fn new(
        api: &'a dyn ScaleApi,
        device_id: impl Into<String>,
        page_size: u32,
        cutoff: Option<i64>,
    ) -> Self {
        let cursor = PageCursor {
            start_time: cutoff.map_or(0, |c| c.saturating_add(1)),
            last_id: None,
        };
        Self::resume(api, device_id, page_size, cutoff, cursor)
    }

    /// Continue from a cursor saved by an earlier walk.
    pub fn resume(
        api: &'a dyn ScaleApi,
        device_id: impl Into<String>,
        page_size: u32,
        cutoff: Option<i64>,
        cursor: PageCursor,
    ) -> Self {
        Self {
            api,
            device_id: device_id.into(),
            page_size: page_size.max(1),
            cutoff,
            cursor,
            delivered: HashSet::new(),
            pages: 0,
            done: false,
        }
    }

    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    /// Fetch the next page and return its new records in ascending
    /// `created_at` order. `Ok(None)` once the history is exhausted.
    ///
    /// A page may legitimately yield an empty `Vec` (everything in it was
    /// already delivered) while more pages follow.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawMeasurement>>, ScaleError> {
        if self.done {
            return Ok(None);
        }

        let page = self
            .api
            .fetch_history_page(&self.device_id, &self.cursor, self.page_size)
            .await?;
        self.pages += 1;
        metrics::counter!(observability::PAGES_FETCHED_TOTAL).increment(1);

        let returned = page.records.len();
        let mut records = page.records;
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        let newest = records.last().map(|r| r.created_at);

        let mut fresh = Vec::with_capacity(records.len());
        for record in records {
            if self.cutoff.is_some_and(|c| record.created_at <= c) {
                continue;
            }
            if record.created_at < self.cursor.start_time {
                tracing::warn!(
                    record_id = %record.record_id,
                    created_at = record.created_at,
                    start_time = self.cursor.start_time,
                    "dropping record older than the page window"
                );
                continue;
            }
            if !self.delivered.insert(record.record_id.clone()) {
                continue;
            }
            fresh.push(record);
        }

        let exhausted = returned < self.page_size as usize
            || page.has_more == Some(false)
            || newest.is_none_or(|n| self.cutoff.is_some_and(|c| n <= c));

        match fresh.last() {
            Some(last) => {
                self.cursor = PageCursor {
                    start_time: last.created_at,
                    last_id: Some(last.record_id.clone()),
                };
            }
            None if !exhausted => {
                self.done = true;
                return Err(ScaleError::Pagination(format!(
                    "full page at start_time {} contained no new records",
                    self.cursor.start_time
                )));
            }
            None => {}
        }

        tracing::debug!(
            device_id = %self.device_id,
            page = self.pages,
            returned,
            new = fresh.len(),
            exhausted,
            "history page processed"
        );
        self.done = exhausted;
        Ok(Some(fresh))
    }

    /// Drain every remaining page.
    pub async fn collect_all(mut self) -> Result<Vec<RawMeasurement>, ScaleError> {
        let mut out = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
        }
        Ok(out)
    }

    /// Lazy record stream; a page is only requested once the previous one is
    /// consumed.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawMeasurement, ScaleError>> + 'a {
        stream::try_unfold(self, |mut pager| async move {
            let page = pager.next_page().await?;
            Ok::<_, ScaleError>(
                page.map(|page| (stream::iter(page.into_iter().map(Ok::<_, ScaleError>)), pager)),
            )
        })
        .try_flatten()
    }
}
