//! Progress and failure ledgers kept beside the job store.
//!
//! Both files are maps keyed by the job's image path. A key lives in at most
//! one of them once a write sequence has finished. Both outcomes write progress
//! first; a failure therefore never sits behind a stale completion, and
//! [`Ledgers::open`] resolves any overlap left by an interrupted success in
//! favor of progress.

use crate::job::{Job, JobStore};
use crate::store::{load_json, save_json};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STATUS_SUCCESS: &str = "success";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub image: String,
    pub completed_at: f64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub image: String,
    pub failed_at: f64,
    pub error: String,
    pub job: Job,
}

pub type ProgressMap = BTreeMap<String, ProgressEntry>;
pub type FailureMap = BTreeMap<String, FailureEntry>;

/// Seconds since the Unix epoch, with sub-second precision.
fn now_epoch() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

#[derive(Debug)]
pub struct Ledgers {
    progress_path: PathBuf,
    failed_path: PathBuf,
    progress: ProgressMap,
    failed: FailureMap,
    /// Progress on disk no longer matches memory after a reset.
    progress_stale: bool,
}

impl Ledgers {
    /// Loads both ledgers for `store`. Nothing is written here.
    pub async fn open(store: &JobStore) -> Self {
        let progress_path = store.progress_path();
        let failed_path = store.failed_path();

        let progress: ProgressMap = load_json(&progress_path).await.or_default_warn(&progress_path);
        let mut failed: FailureMap = load_json(&failed_path).await.or_default_warn(&failed_path);

        let before = failed.len();
        failed.retain(|key, _| !progress.contains_key(key));
        if failed.len() != before {
            tracing::info!(
                dropped = before - failed.len(),
                "failure entries superseded by progress entries"
            );
        }

        Self {
            progress_path,
            failed_path,
            progress,
            failed,
            progress_stale: false,
        }
    }

    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }

    pub fn failed_path(&self) -> &Path {
        &self.failed_path
    }

    pub fn progress(&self) -> &ProgressMap {
        &self.progress
    }

    pub fn failures(&self) -> &FailureMap {
        &self.failed
    }

    pub fn is_complete(&self, key: &str) -> bool {
        self.progress.contains_key(key)
    }

    /// Forgets every completion in memory. The file is rewritten with the next
    /// recorded outcome, whether it is a success or a failure.
    pub fn reset_progress(&mut self) {
        self.progress.clear();
        self.progress_stale = true;
    }

    async fn save_progress(&mut self) -> Result<()> {
        save_json(&self.progress_path, &self.progress).await?;
        self.progress_stale = false;
        Ok(())
    }

    pub async fn record_success(&mut self, job: &Job) -> Result<()> {
        let key = job.key().to_string();
        self.progress.insert(
            key.clone(),
            ProgressEntry {
                image: key.clone(),
                completed_at: now_epoch(),
                status: STATUS_SUCCESS.to_string(),
            },
        );
        self.save_progress().await?;

        if self.failed.remove(&key).is_some() {
            save_json(&self.failed_path, &self.failed).await?;
        }
        Ok(())
    }

    pub async fn record_failure(&mut self, job: &Job, error: &str) -> Result<()> {
        let key = job.key().to_string();
        self.failed.insert(
            key.clone(),
            FailureEntry {
                image: key.clone(),
                failed_at: now_epoch(),
                error: error.to_string(),
                job: job.clone(),
            },
        );
        // Progress goes first: open() would let a leftover entry shadow this failure.
        if self.progress.remove(&key).is_some() || self.progress_stale {
            self.save_progress().await?;
        }
        save_json(&self.failed_path, &self.failed).await?;
        Ok(())
    }
}
