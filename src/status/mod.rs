//! Local JSON mirror of per-job status.
//!
//! One document per job at `{results_dir}/{job_id}.json`, with the raw result
//! summary mirrored at `{results_dir}/{job_id}-result.json`. The status file
//! is the primary source for job reads and the fallback of record when the
//! relational store is degraded. Writes replace the whole document atomically
//! (temp file + rename), so readers observe either the previous or the new
//! version, never a torn one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::state::SessionStatus;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StatusError>;

/// Pointer to an uploaded artifact; re-signed on every retrieval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub bucket: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presigned_url: Option<String>,
}

/// The per-job status document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDoc {
    pub job_id: String,
    pub status: SessionStatus,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_urls: Option<BTreeMap<String, ArtifactRef>>,
}

impl StatusDoc {
    pub fn queued(job_id: &str, kind: &str, payload: serde_json::Value) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: SessionStatus::Queued,
            kind: kind.to_string(),
            payload,
            result_path: None,
            error: None,
            artifact_urls: None,
        }
    }
}

/// Handle on the status directory
#[derive(Clone)]
pub struct StatusFile {
    dir: PathBuf,
}

impl StatusFile {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn doc_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    pub fn result_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}-result.json"))
    }

    pub fn write(&self, doc: &StatusDoc) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        self.replace(&self.doc_path(&doc.job_id), &bytes)
    }

    pub fn read(&self, job_id: &str) -> Result<Option<StatusDoc>> {
        let path = self.doc_path(job_id);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Read-modify-write. The mutation runs on the stored document, or on a
    /// bare default when none exists yet (a cancel can race job creation).
    pub fn update<F>(&self, job_id: &str, mutate: F) -> Result<StatusDoc>
    where
        F: FnOnce(&mut StatusDoc),
    {
        let mut doc = self.read(job_id)?.unwrap_or_else(|| StatusDoc {
            job_id: job_id.to_string(),
            status: SessionStatus::Queued,
            kind: "unknown".to_string(),
            payload: serde_json::Value::Null,
            result_path: None,
            error: None,
            artifact_urls: None,
        });
        mutate(&mut doc);
        self.write(&doc)?;
        Ok(doc)
    }

    /// Write the raw result summary mirror for a job
    pub fn write_result(&self, job_id: &str, summary: &serde_json::Value) -> Result<PathBuf> {
        let path = self.result_path(job_id);
        let bytes = serde_json::to_vec_pretty(summary)?;
        self.replace(&path, &bytes)?;
        Ok(path)
    }

    pub fn read_result(&self, job_id: &str) -> Result<Option<serde_json::Value>> {
        let path = self.result_path(job_id);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    fn replace(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store() -> (StatusFile, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = StatusFile::open(temp.path()).unwrap();
        (store, temp)
    }

    #[test]
    fn test_write_and_read() {
        let (store, _temp) = open_store();
        let doc = StatusDoc::queued("job1", "web", json!({"url": "https://x.test/"}));
        store.write(&doc).unwrap();

        let read = store.read("job1").unwrap().unwrap();
        assert_eq!(read.job_id, "job1");
        assert_eq!(read.status, SessionStatus::Queued);
        assert_eq!(read.payload["url"], "https://x.test/");
    }

    #[test]
    fn test_read_missing() {
        let (store, _temp) = open_store();
        assert!(store.read("nope").unwrap().is_none());
    }

    #[test]
    fn test_update_overwrites_whole_document() {
        let (store, _temp) = open_store();
        store
            .write(&StatusDoc::queued("job1", "web", json!({})))
            .unwrap();

        store
            .update("job1", |doc| {
                doc.status = SessionStatus::Running;
            })
            .unwrap();

        let read = store.read("job1").unwrap().unwrap();
        assert_eq!(read.status, SessionStatus::Running);
        assert_eq!(read.kind, "web");
        // No temp file leftovers
        assert!(!store.dir().join("job1.json.tmp").exists());
    }

    #[test]
    fn test_update_missing_creates_default() {
        let (store, _temp) = open_store();
        let doc = store
            .update("ghost", |doc| {
                doc.status = SessionStatus::CancelRequested;
            })
            .unwrap();
        assert_eq!(doc.status, SessionStatus::CancelRequested);
        assert!(store.read("ghost").unwrap().is_some());
    }

    #[test]
    fn test_result_mirror() {
        let (store, _temp) = open_store();
        let path = store
            .write_result("job1", &json!({"passed": true}))
            .unwrap();
        assert!(path.ends_with("job1-result.json"));

        let summary = store.read_result("job1").unwrap().unwrap();
        assert_eq!(summary["passed"], true);
        assert!(store.read_result("job2").unwrap().is_none());
    }
}
