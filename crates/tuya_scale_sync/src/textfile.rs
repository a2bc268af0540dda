//! Prometheus textfile-collector output.

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `contents` via a temp file in the same directory, so a
/// scraping collector never reads a half-written exposition.
pub fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
