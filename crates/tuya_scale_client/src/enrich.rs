//! Per-measurement analysis reports.

use crate::utils::age_at;
use crate::{AnalysisRequest, EnrichedRecord, RawMeasurement, ScaleApi, ScaleError, Sex};
use chrono::NaiveDate;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::sync::watch;

/// Biometrics of the person the reports are computed for.
#[derive(Clone, Debug, PartialEq)]
pub struct SubjectProfile {
    pub birthdate: NaiveDate,
    pub sex: Sex,
    /// Keep only this household member's measurements when set.
    pub user_id: Option<String>,
}

impl SubjectProfile {
    pub fn matches(&self, record: &RawMeasurement) -> bool {
        self.user_id.as_deref().is_none_or(|id| id == record.user_id)
    }
}

/// A record whose report could not be obtained. The record itself is still
/// kept, without a report.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnrichmentFailure {
    pub record_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct EnrichmentBatch {
    pub records: Vec<EnrichedRecord>,
    pub failures: Vec<EnrichmentFailure>,
    /// Reports actually attached.
    pub reports: usize,
}

pub struct Enricher<'a> {
    api: &'a dyn ScaleApi,
    device_id: &'a str,
    subject: &'a SubjectProfile,
    concurrency: usize,
}

impl<'a> Enricher<'a> {
    pub fn new(
        api: &'a dyn ScaleApi,
        device_id: &'a str,
        subject: &'a SubjectProfile,
        concurrency: usize,
    ) -> Self {
        Self {
            api,
            device_id,
            subject,
            concurrency: concurrency.max(1),
        }
    }

    /// Attach a report to `raw` when it carries a resistance reading.
    ///
    /// Never fails: a report that cannot be fetched yields the bare record
    /// plus the reason.
    pub async fn enrich(&self, raw: RawMeasurement) -> (EnrichedRecord, Option<EnrichmentFailure>) {
        if !raw.has_resistance() {
            return (EnrichedRecord::without_report(raw), None);
        }

        let request = match self.request_for(&raw) {
            Ok(request) => request,
            Err(reason) => return self.failed(raw, reason),
        };

        match self
            .api
            .fetch_analysis_report(self.device_id, &raw.record_id, &request)
            .await
        {
            Ok(report) => (
                EnrichedRecord {
                    measurement: raw,
                    analysis_report: Some(report),
                },
                None,
            ),
            Err(e) => self.failed(raw, e.to_string()),
        }
    }

    fn request_for(&self, raw: &RawMeasurement) -> Result<AnalysisRequest, String> {
        if raw.height <= 0.0 || raw.weight <= 0.0 {
            return Err(format!(
                "height {} / weight {} unusable for analysis",
                raw.height, raw.weight
            ));
        }
        let age = age_at(self.subject.birthdate, raw.created_at).ok_or_else(|| {
            format!(
                "measurement at {} predates birthdate {}",
                raw.created_at, self.subject.birthdate
            )
        })?;
        Ok(AnalysisRequest {
            height: raw.height,
            weight: raw.weight,
            resistance: raw.body_resistance,
            age,
            sex: self.subject.sex,
        })
    }

    fn failed(
        &self,
        raw: RawMeasurement,
        reason: String,
    ) -> (EnrichedRecord, Option<EnrichmentFailure>) {
        tracing::warn!(record_id = %raw.record_id, %reason, "analysis report unavailable");
        let failure = EnrichmentFailure {
            record_id: raw.record_id.clone(),
            reason,
        };
        (EnrichedRecord::without_report(raw), Some(failure))
    }

    /// Enrich `records` with at most `concurrency` reports in flight, keeping
    /// input order. Cancellation is checked before each record is started.
    pub async fn enrich_batch(
        &self,
        records: Vec<RawMeasurement>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<EnrichmentBatch, ScaleError> {
        let results: Vec<_> = stream::iter(records)
            .map(|raw| async move {
                if *cancel.borrow() {
                    return Err(ScaleError::Cancelled);
                }
                Ok(self.enrich(raw).await)
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let mut batch = EnrichmentBatch::default();
        for (record, failure) in results {
            if record.analysis_report.is_some() {
                batch.reports += 1;
            }
            batch.records.push(record);
            batch.failures.extend(failure);
        }
        Ok(batch)
    }
}
