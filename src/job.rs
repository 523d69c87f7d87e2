use crate::logw;
use crate::store::{Loaded, load_json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// One FramePack generation request as written in the job store.
///
/// Optional fields are forwarded to the generator only when present; fields
/// this crate does not know about are kept in `extra` so they survive a trip
/// through the failure ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distilled_cfg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_rescale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_teacache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mp4_crf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn new(image: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    /// Ledger key: the image path, or `""` when the job has none.
    pub fn key(&self) -> &str {
        self.image.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Default, Deserialize)]
struct JobDocument {
    #[serde(default)]
    jobs: Vec<Value>,
}

/// Jobs read from the store in a single poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSnapshot {
    pub jobs: Vec<Job>,
    /// Entries that were present but not shaped like a job.
    pub rejected: usize,
}

impl JobSnapshot {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// The externally authored `{"jobs": [...]}` file and the ledgers beside it.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn progress_path(&self) -> PathBuf {
        self.sibling("progress")
    }

    pub fn failed_path(&self) -> PathBuf {
        self.sibling("failed")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = format!("{}_{}.json", stem, suffix);
        match self.path.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Reads the store as it is on disk right now.
    ///
    /// A missing or malformed store yields an empty snapshot and a warning.
    pub async fn poll(&self) -> JobSnapshot {
        let doc = match load_json::<JobDocument>(&self.path).await {
            Loaded::Found(doc) => doc,
            Loaded::Missing => {
                logw(format!("Job store {} not found", self.path.display()));
                return JobSnapshot::default();
            }
            Loaded::Corrupt(reason) => {
                logw(format!("Could not load {}: {}", self.path.display(), reason));
                return JobSnapshot::default();
            }
        };

        let mut snapshot = JobSnapshot::default();
        for (idx, raw) in doc.jobs.into_iter().enumerate() {
            match serde_json::from_value::<Job>(raw) {
                Ok(job) => snapshot.jobs.push(job),
                Err(err) => {
                    logw(format!("Skipping job #{} in {}: {}", idx + 1, self.path.display(), err));
                    snapshot.rejected += 1;
                }
            }
        }
        tracing::debug!(
            store = %self.path.display(),
            jobs = snapshot.jobs.len(),
            rejected = snapshot.rejected,
            "polled job store"
        );
        snapshot
    }
}
