//! The persisted record document and the append-only merge into it.
//!
//! The document is one JSON array of [`EnrichedRecord`] in chronological
//! order. It is rewritten whole through a temp file in the same directory and
//! renamed into place, so readers see either the old or the new array.

use crate::{EnrichedRecord, ScaleError};
use std::collections::HashSet;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted records. A missing or empty file is an empty store.
    pub fn load(&self) -> Result<Vec<EnrichedRecord>, ScaleError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_error(&self.path, "reading", e)),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|e| store_error(&self.path, "parsing", e))
    }

    /// Replace the document with `records` in one rename.
    pub fn persist(&self, records: &[EnrichedRecord]) -> Result<(), ScaleError> {
        // serde_json writes NaN as null, which `load` would then refuse.
        if let Some(bad) = records.iter().find(|r| !is_finite(r)) {
            return Err(store_error(
                &self.path,
                "refusing to write",
                format!("record {} has a non-finite number", bad.record_id()),
            ));
        }
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)
            .map_err(|e| store_error(dir, "creating temp file in", e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, records)
                .map_err(|e| store_error(tmp.path(), "writing", e))?;
            writer
                .flush()
                .map_err(|e| store_error(tmp.path(), "writing", e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| store_error(tmp.path(), "syncing", e))?;
        tmp.persist(&self.path)
            .map_err(|e| store_error(&self.path, "replacing", e.error))?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "store persisted");
        Ok(())
    }
}

fn is_finite(record: &EnrichedRecord) -> bool {
    let m = &record.measurement;
    let report = record.analysis_report.iter().flat_map(|r| {
        [
            r.bmi,
            r.body_fat_pct,
            r.muscle_mass,
            r.body_water_pct,
            r.bone_mass,
            r.visceral_fat,
            r.protein,
            r.fat_free_mass,
            r.metabolism,
            r.body_age,
            r.body_score,
        ]
    });
    [m.weight, m.height, m.body_resistance]
        .into_iter()
        .chain(report.flatten())
        .all(f64::is_finite)
}

fn store_error(path: &Path, action: &str, err: impl std::fmt::Display) -> ScaleError {
    ScaleError::Store(format!("{action} {}: {err}", path.display()))
}

/// Incremental checkpoint, always recomputed from the persisted records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    pub last_created_at: Option<i64>,
}

impl SyncState {
    pub fn derive(records: &[EnrichedRecord]) -> Self {
        Self {
            last_created_at: records.iter().map(EnrichedRecord::created_at).max(),
        }
    }
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub records: Vec<EnrichedRecord>,
    pub appended: usize,
}

/// Append the records of `incoming` whose `record_id` is not yet present,
/// oldest first. Existing records are never modified.
pub fn merge(existing: Vec<EnrichedRecord>, incoming: Vec<EnrichedRecord>) -> MergeOutcome {
    let mut seen: HashSet<String> = existing.iter().map(|r| r.record_id().to_string()).collect();
    let mut new: Vec<EnrichedRecord> = incoming
        .into_iter()
        .filter(|r| seen.insert(r.record_id().to_string()))
        .collect();
    new.sort_by_key(EnrichedRecord::created_at);

    let appended = new.len();
    let mut records = existing;
    let tail_start = records.last().map(EnrichedRecord::created_at);
    if new
        .first()
        .zip(tail_start)
        .is_some_and(|(first, tail)| first.created_at() < tail)
    {
        // A late arrival older than the persisted tail; keep the document chronological.
        records.extend(new);
        records.sort_by_key(EnrichedRecord::created_at);
    } else {
        records.extend(new);
    }
    MergeOutcome { records, appended }
}

/// JSON Schema of the persisted document.
pub fn record_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(Vec<EnrichedRecord>)).unwrap_or_default()
}
