//! Job Store - Persistent Job Records
//!
//! # Storage Format
//!
//! ```text
//! <home>/jobs/
//! ├── {job_id_1}.json
//! └── {job_id_2}.json
//! ```

use super::{JobId, JobRecord};
use crate::paths::{atomic_write, sanitize_name};
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Persistent job store
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job store directory: {}", dir.display()))?;

        Ok(Self { dir })
    }

    fn job_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_name(id.as_str())))
    }

    pub fn save(&self, record: &JobRecord) -> Result<()> {
        let path = self.job_path(&record.job_id);
        let json = serde_json::to_string_pretty(record)?;

        atomic_write(&path, json.as_bytes())
            .with_context(|| format!("Failed to write job file: {}", path.display()))?;

        debug!("Saved job {} ({}) to {}", record.job_id, record.state, path.display());
        Ok(())
    }

    pub fn load(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let path = self.job_path(id);

        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read job file: {}", path.display()))?;
        let record: JobRecord = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse job file: {}", path.display()))?;

        Ok(Some(record))
    }

    /// Every job record, most recently updated first.
    pub fn load_all(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();

        let entries = fs::read_dir(&self.dir).with_context(|| {
            format!("Failed to read job store directory: {}", self.dir.display())
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let json = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read job file: {}", path.display()))?;
            let record: JobRecord = serde_json::from_str(&json)
                .with_context(|| format!("Failed to parse job file: {}", path.display()))?;
            records.push(record);
        }

        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        debug!("Loaded {} job records from {}", records.len(), self.dir.display());
        Ok(records)
    }

    pub fn delete(&self, id: &JobId) -> Result<bool> {
        let path = self.job_path(id);

        if !path.exists() {
            return Ok(false);
        }

        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete job file: {}", path.display()))?;

        debug!("Deleted job {} from {}", id, path.display());
        Ok(true)
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{RunMode, RunState};
    use crate::progress::RunProgress;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = JobStore::new(temp.path().to_path_buf()).unwrap();

        let mut record = JobRecord::started(JobId::new("form-1"), RunMode::Apply);
        record.update_progress(&RunProgress {
            status: RunState::Applying,
            position: 10,
            total: 40,
            ..Default::default()
        });
        store.save(&record).unwrap();

        let loaded = store.load(&record.job_id).unwrap().unwrap();
        assert_eq!(loaded.state, RunState::Applying);
        assert_eq!(loaded.progress.unwrap().percent_complete, 25.0);
    }

    #[test]
    fn test_load_nonexistent() {
        let temp = TempDir::new().unwrap();
        let store = JobStore::new(temp.path().to_path_buf()).unwrap();

        assert!(store.load(&JobId::new("missing")).unwrap().is_none());
    }

    #[test]
    fn test_load_all_and_delete() {
        let temp = TempDir::new().unwrap();
        let store = JobStore::new(temp.path().to_path_buf()).unwrap();

        for id in ["a", "b", "c"] {
            store
                .save(&JobRecord::started(JobId::new(id), RunMode::Prep))
                .unwrap();
        }
        assert_eq!(store.load_all().unwrap().len(), 3);

        assert!(store.delete(&JobId::new("b")).unwrap());
        assert!(!store.delete(&JobId::new("b")).unwrap());
        assert_eq!(store.load_all().unwrap().len(), 2);
    }
}
