use crate::job::Job;
use crate::{logi, logok, logw};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEVICE_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Why a single job did not produce a video. The `Display` text is what lands
/// in the failure ledger.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Missing image or prompt")]
    MissingField,
    #[error("Image file not found: {0}")]
    ImageNotFound(String),
    #[error("{message}")]
    Exit { code: Option<i32>, message: String },
    #[error("Timeout after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::Timeout(_))
    }

    /// Exit status of the generator, when it ran and exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobError::Exit { code, .. } => *code,
            _ => None,
        }
    }
}

/// Failure line for the console; the ledger keeps only the message.
fn failure_detail(err: &JobError) -> String {
    match err.exit_code() {
        Some(code) => format!("{} (exit code {})", err, code),
        None => err.to_string(),
    }
}

/// Runs one job to completion. Implementations must not touch the ledgers.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn execute(&self, job: &Job, slot: Option<usize>) -> Result<(), JobError>;
}

#[async_trait]
impl<T: JobRunner + ?Sized> JobRunner for std::sync::Arc<T> {
    async fn execute(&self, job: &Job, slot: Option<usize>) -> Result<(), JobError> {
        (**self).execute(job, slot).await
    }
}

type FlagValue = fn(&Job) -> Option<String>;

/// Optional job fields in the order they are handed to the generator.
const OPTIONAL_FLAGS: &[(&str, FlagValue)] = &[
    ("--negative_prompt", |j| j.negative_prompt.clone()),
    ("--seed", |j| j.seed.map(|v| v.to_string())),
    ("--length", |j| j.duration.map(|v| v.to_string())),
    ("--steps", |j| j.steps.map(|v| v.to_string())),
    ("--cfg", |j| j.cfg.map(|v| v.to_string())),
    ("--distilled_cfg", |j| j.distilled_cfg.map(|v| v.to_string())),
    ("--cfg_rescale", |j| j.cfg_rescale.map(|v| v.to_string())),
    ("--gpu_memory", |j| j.gpu_memory.map(|v| v.to_string())),
    ("--mp4_crf", |j| j.mp4_crf.map(|v| v.to_string())),
];

/// Builds the generator arguments that follow `--cli`.
///
/// `output` replaces whatever the job asked for; pass `None` to keep the
/// job's own `output` field.
pub fn generator_args(image: &str, prompt: &str, job: &Job, output: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "--input_image".to_string(),
        image.to_string(),
        "--prompt".to_string(),
        prompt.to_string(),
    ];

    for (flag, value) in OPTIONAL_FLAGS {
        if let Some(value) = value(job) {
            args.push(flag.to_string());
            args.push(value);
        }
    }

    if job.no_teacache == Some(true) {
        args.push("--no_teacache".to_string());
    }

    let output = match output {
        Some(path) => Some(path.to_string_lossy().into_owned()),
        None => job.output.clone(),
    };
    if let Some(output) = output {
        args.push("--output".to_string());
        args.push(output);
    }

    args
}

/// `<dir>/<image stem>.mp4`
pub fn output_path_for(dir: &Path, image: &str) -> PathBuf {
    let stem = Path::new(image)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| image.to_string());
    dir.join(format!("{}.mp4", stem))
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Program that runs the script, e.g. `python3`.
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl WorkerConfig {
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            output_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Runs FramePack's `demo_gradio.py --cli` as a child process.
#[derive(Debug, Clone)]
pub struct CliWorker {
    cfg: WorkerConfig,
}

impl CliWorker {
    pub fn new(cfg: WorkerConfig) -> Self {
        Self { cfg }
    }

    async fn run(&self, image: &str, prompt: &str, job: &Job, slot: Option<usize>) -> Result<(), JobError> {
        let output = match &self.cfg.output_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                Some(output_path_for(dir, image))
            }
            None => None,
        };
        let args = generator_args(image, prompt, job, output.as_deref());

        let mut cmd = Command::new(&self.cfg.interpreter);
        cmd.arg(&self.cfg.script)
            .arg("--cli")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(slot) = slot {
            cmd.env(DEVICE_ENV, slot.to_string());
        }

        tracing::debug!(
            interpreter = %self.cfg.interpreter.display(),
            script = %self.cfg.script.display(),
            args = ?args,
            slot = ?slot,
            "spawning generator"
        );
        logi(format!(
            "   Command: {} {} --cli {}",
            self.cfg.interpreter.display(),
            self.cfg.script.display(),
            args.join(" ")
        ));

        let output = match tokio::time::timeout(self.cfg.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => return Err(JobError::Timeout(self.cfg.timeout)),
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = [stderr, stdout]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown error".to_string());
        Err(JobError::Exit {
            code: output.status.code(),
            message,
        })
    }
}

fn display_name(image: &str) -> String {
    Path::new(image)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| image.to_string())
}

#[async_trait]
impl JobRunner for CliWorker {
    async fn execute(&self, job: &Job, slot: Option<usize>) -> Result<(), JobError> {
        let (image, prompt) = match (job.image.as_deref(), job.prompt.as_deref()) {
            (Some(image), Some(prompt)) if !image.is_empty() && !prompt.is_empty() => (image, prompt),
            _ => return Err(JobError::MissingField),
        };

        if !tokio::fs::try_exists(image).await.unwrap_or(false) {
            return Err(JobError::ImageNotFound(image.to_string()));
        }

        let name = display_name(image);
        let gpu = slot.map(|s| format!(" (GPU {})", s)).unwrap_or_default();
        logi(format!("Starting: {}{}", name, gpu));

        let result = self.run(image, prompt, job, slot).await;
        match &result {
            Ok(()) => logok(format!("Completed: {}{}", name, gpu)),
            Err(err) if err.is_timeout() => logw(format!("Timeout: {}{}", name, gpu)),
            Err(err) => logw(format!("Failed: {}{} - {}", name, gpu, failure_detail(err))),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn absent_fields_are_left_to_the_generator() {
        let job = Job::new("in/cat.png", "a cat jumps");
        assert_eq!(
            generator_args("in/cat.png", "a cat jumps", &job, None),
            vec!["--input_image", "in/cat.png", "--prompt", "a cat jumps"]
        );
    }

    #[test]
    fn zero_values_are_passed_through() {
        let mut job = Job::new("a.png", "p");
        job.seed = Some(0);
        job.steps = Some(0);
        let args = generator_args("a.png", "p", &job, None);
        assert!(args.windows(2).any(|w| w == ["--seed", "0"]));
        assert!(args.windows(2).any(|w| w == ["--steps", "0"]));
    }

    #[test]
    fn every_field_maps_to_its_flag() {
        let mut job = Job::new("a.png", "p");
        job.negative_prompt = Some("blurry".into());
        job.seed = Some(31337);
        job.duration = Some(5.0);
        job.steps = Some(25);
        job.cfg = Some(1.0);
        job.distilled_cfg = Some(10.0);
        job.cfg_rescale = Some(0.0);
        job.gpu_memory = Some(6.5);
        job.no_teacache = Some(true);
        job.mp4_crf = Some(16);
        job.output = Some("out/a.mp4".into());

        let args = generator_args("a.png", "p", &job, None);
        assert_eq!(
            args,
            vec![
                "--input_image", "a.png", "--prompt", "p",
                "--negative_prompt", "blurry",
                "--seed", "31337",
                "--length", "5",
                "--steps", "25",
                "--cfg", "1",
                "--distilled_cfg", "10",
                "--cfg_rescale", "0",
                "--gpu_memory", "6.5",
                "--mp4_crf", "16",
                "--no_teacache",
                "--output", "out/a.mp4",
            ]
        );
    }

    #[test]
    fn failure_detail_carries_the_exit_code() {
        let exit = JobError::Exit {
            code: Some(3),
            message: "CUDA out of memory".into(),
        };
        assert_eq!(failure_detail(&exit), "CUDA out of memory (exit code 3)");
        assert_eq!(exit.to_string(), "CUDA out of memory");

        let killed = JobError::Exit {
            code: None,
            message: "Unknown error".into(),
        };
        assert_eq!(failure_detail(&killed), "Unknown error");
        assert_eq!(JobError::MissingField.exit_code(), None);
    }

    #[test]
    fn no_teacache_false_is_omitted() {
        let mut job = Job::new("a.png", "p");
        job.no_teacache = Some(false);
        assert!(!generator_args("a.png", "p", &job, None).contains(&"--no_teacache".to_string()));
    }

    #[test]
    fn output_dir_overrides_job_output() {
        let mut job = Job::new("shots/beach.jpg", "waves roll");
        job.output = Some("elsewhere.mp4".into());
        let out = output_path_for(Path::new("videos"), "shots/beach.jpg");
        assert_eq!(out, PathBuf::from("videos/beach.mp4"));

        let args = generator_args("shots/beach.jpg", "waves roll", &job, Some(&out));
        assert_eq!(&args[args.len() - 2..], ["--output", "videos/beach.mp4"]);
    }

    #[tokio::test]
    async fn missing_prompt_fails_before_spawning() {
        let worker = CliWorker::new(WorkerConfig::new("/definitely/not/here", "demo.py"));
        let job = Job {
            image: Some("a.png".into()),
            ..Job::default()
        };
        assert_matches!(worker.execute(&job, None).await, Err(JobError::MissingField));
    }

    #[tokio::test]
    async fn missing_image_fails_before_spawning() {
        let worker = CliWorker::new(WorkerConfig::new("/definitely/not/here", "demo.py"));
        let err = worker
            .execute(&Job::new("no-such-cat.png", "a cat jumps"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Image file not found: no-such-cat.png");
    }

    #[test]
    fn timeout_message_is_distinct() {
        let err = JobError::Timeout(DEFAULT_TIMEOUT);
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Timeout after 3600 seconds");
    }
}
