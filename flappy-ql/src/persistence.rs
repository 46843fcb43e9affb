//! Durable JSON documents: atomic writes, and loads that never fail the caller.
//!
//! A missing file is the normal first-run case. A malformed or incompatible file is logged
//! and treated as absent, so the session starts fresh instead of aborting.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Reads and parses a JSON document; `Ok(None)` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", path)),
    };
    let value = serde_json::from_str(&content).with_context(|| format!("parsing {:?}", path))?;
    Ok(Some(value))
}

/// Writes `value` as JSON. The document is written to a sibling temp file first and then
/// renamed, so a crash never leaves a half written file behind.
pub fn write_json<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating directory {:?}", dir))?;
    }
    let content = serde_json::to_string(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).with_context(|| format!("writing {:?}", tmp_path))?;
    fs::rename(&tmp_path, path).with_context(|| format!("renaming {:?} to {:?}", tmp_path, path))?;
    Ok(())
}

/// Loads a document and runs it through `accept`; falls back to `default` when the file is
/// missing or the document is rejected.
pub fn load_or_default<T, D, F>(
    path: &Path,
    what: &str,
    accept: F,
    default: D,
) -> D
where
    T: DeserializeOwned,
    F: FnOnce(T) -> Result<D>,
{
    match read_json::<T>(path).and_then(|doc| doc.map(accept).transpose()) {
        Ok(Some(value)) => {
            log::info!("loaded {} from {:?}", what, path);
            value
        }
        Ok(None) => {
            log::info!("no {} found at {:?}, starting fresh", what, path);
            default
        }
        Err(e) => {
            log::warn!("ignoring unusable {} at {:?}: {:#}", what, path, e);
            default
        }
    }
}

/// Writes the document, logging instead of propagating a failure. Returns whether it was saved.
pub fn save_best_effort<T: Serialize>(
    path: &Path,
    what: &str,
    value: &T,
) -> bool {
    match write_json(path, value) {
        Ok(()) => {
            log::debug!("saved {} to {:?}", what, path);
            true
        }
        Err(e) => {
            log::warn!("failed to save {} to {:?}: {:#}", what, path, e);
            false
        }
    }
}

/// Highest episode score ever reached, kept across sessions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestScore {
    pub best_score: u32,
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_is_none() -> Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(read_json::<BestScore>(&dir.path().join("absent.json"))?, None);
        Ok(())
    }

    #[test]
    fn test_write_creates_directories_and_reads_back() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested/deeper/best.json");
        write_json(&path, &BestScore { best_score: 17 })?;
        assert_eq!(read_json::<BestScore>(&path)?, Some(BestScore { best_score: 17 }));
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_malformed_file_falls_back_to_default() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("best.json");
        fs::write(&path, "{ not json")?;
        assert!(read_json::<BestScore>(&path).is_err());
        let loaded = load_or_default(&path, "best score", |doc: BestScore| Ok(doc), BestScore { best_score: 3 });
        assert_eq!(loaded.best_score, 3);
        Ok(())
    }

    #[test]
    fn test_rejected_document_falls_back_to_default() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("best.json");
        write_json(&path, &BestScore { best_score: 99 })?;
        let loaded = load_or_default(
            &path,
            "best score",
            |_: BestScore| Err(anyhow::anyhow!("incompatible")),
            BestScore::default(),
        );
        assert_eq!(loaded, BestScore::default());
        Ok(())
    }

    #[test]
    fn test_save_best_effort_reports_failure() -> Result<()> {
        let dir = TempDir::new()?;
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x")?;
        // parent "directory" is a regular file
        assert!(!save_best_effort(&blocker.join("best.json"), "best score", &BestScore::default()));
        Ok(())
    }
}
