//! Polling reconciliation loop that drives jobs from the store to the ledgers.

use crate::job::{Job, JobSnapshot, JobStore};
use crate::ledger::Ledgers;
use crate::worker::JobRunner;
use crate::{logi, logok, logw};
use anyhow::Result;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DRY_RUN_PROMPT_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub concurrency: usize,
    pub force_reprocess: bool,
    pub dry_run: bool,
    /// Number of GPUs to spread jobs over; `<= 1` disables pinning.
    pub resource_count: usize,
    pub poll_interval: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            force_reprocess: false,
            dry_run: false,
            resource_count: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub failed: usize,
    pub total_completed: usize,
    pub cycles: usize,
}

/// GPU slot for the job at `position` in a cycle's pending list.
pub fn assign_slot(position: usize, resource_count: usize) -> Option<usize> {
    (resource_count > 1).then(|| position % resource_count)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub struct Dispatcher<R> {
    store: JobStore,
    ledgers: Ledgers,
    runner: R,
    opts: DispatchOptions,
    /// Jobs that already failed during this run, as they looked when tried.
    attempted: HashMap<String, Job>,
    warned_keyless: bool,
}

impl<R: JobRunner> Dispatcher<R> {
    pub async fn open(store: JobStore, runner: R, opts: DispatchOptions) -> Self {
        let mut ledgers = Ledgers::open(&store).await;
        if opts.force_reprocess {
            ledgers.reset_progress();
        }
        Self {
            store,
            ledgers,
            runner,
            opts,
            attempted: HashMap::new(),
            warned_keyless: false,
        }
    }

    pub fn ledgers(&self) -> &Ledgers {
        &self.ledgers
    }

    /// Jobs from `snapshot` that still need a run.
    ///
    /// A job that failed earlier in this run is only picked up again once its
    /// entry in the store has changed.
    pub fn pending(&mut self, snapshot: &JobSnapshot) -> Vec<Job> {
        let mut seen = HashSet::new();
        let mut keyless = 0usize;
        let mut pending = Vec::new();

        for job in &snapshot.jobs {
            let key = job.key();
            if key.is_empty() {
                keyless += 1;
                continue;
            }
            if self.ledgers.is_complete(key) || !seen.insert(key) {
                continue;
            }
            if self.attempted.get(key) == Some(job) {
                continue;
            }
            pending.push(job.clone());
        }

        if keyless > 0 && !self.warned_keyless {
            logw(format!("Ignoring {} job(s) without an image path", keyless));
            self.warned_keyless = true;
        }
        pending
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        logi(format!("Config: {}", self.store.path().display()));
        logi(format!("Progress: {}", self.ledgers.progress_path().display()));
        logi(format!("Failed: {}", self.ledgers.failed_path().display()));
        logi(format!("Parallel: {}", self.opts.concurrency.max(1)));
        logi(format!("GPUs: {}", self.opts.resource_count));

        let mut summary = RunSummary::default();

        loop {
            let snapshot = self.store.poll().await;
            if snapshot.is_empty() {
                logi("No jobs found in config file");
                break;
            }

            let pending = self.pending(&snapshot);
            if pending.is_empty() {
                let outstanding = snapshot
                    .jobs
                    .iter()
                    .filter(|j| self.ledgers.failures().contains_key(j.key()))
                    .count();
                if outstanding == 0 {
                    logok("All jobs completed!");
                } else {
                    logw(format!(
                        "Nothing left to dispatch; {} job(s) remain in {}",
                        outstanding,
                        self.ledgers.failed_path().display()
                    ));
                }
                break;
            }

            logi(format!("Found {} pending jobs", pending.len()));

            if self.opts.dry_run {
                logi("DRY RUN - would process:");
                for job in &pending {
                    let prompt = job.prompt.as_deref().unwrap_or("");
                    logi(format!(
                        "  - {} -> {}...",
                        job.key(),
                        truncate_chars(prompt, DRY_RUN_PROMPT_CHARS)
                    ));
                }
                break;
            }

            summary.cycles += 1;
            self.run_batch(pending, &mut summary).await?;
            tokio::time::sleep(self.opts.poll_interval).await;
        }

        summary.total_completed = self.ledgers.progress().len();
        logi("Final Summary:");
        logi(format!("  Processed: {}", summary.processed));
        logi(format!("  Failed: {}", summary.failed));
        logi(format!("  Total completed: {}", summary.total_completed));
        logi(format!("  Cycles: {}", summary.cycles));
        Ok(summary)
    }

    async fn run_batch(&mut self, pending: Vec<Job>, summary: &mut RunSummary) -> Result<()> {
        let runner = &self.runner;
        let resource_count = self.opts.resource_count;

        let mut outcomes = futures::stream::iter(pending.into_iter().enumerate().map(|(idx, job)| {
            let slot = assign_slot(idx, resource_count);
            async move {
                let result = runner.execute(&job, slot).await;
                (job, result)
            }
        }))
        .buffer_unordered(self.opts.concurrency.max(1));

        while let Some((job, result)) = outcomes.next().await {
            let key = job.key().to_string();
            match result {
                Ok(()) => {
                    self.ledgers.record_success(&job).await?;
                    self.attempted.remove(&key);
                    summary.processed += 1;
                }
                Err(err) => {
                    tracing::debug!(job = %key, error = %err, "job failed");
                    self.ledgers.record_failure(&job, &err.to_string()).await?;
                    self.attempted.insert(key, job);
                    summary.failed += 1;
                }
            }
        }
        Ok(())
    }
}
