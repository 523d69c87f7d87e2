//! The CLI worker against real child processes, using `sh` as the interpreter.
#![cfg(unix)]

use assert_matches::assert_matches;
use framepack_batch::dispatcher::{DispatchOptions, Dispatcher};
use framepack_batch::job::{Job, JobStore};
use framepack_batch::ledger::Ledgers;
use framepack_batch::worker::{CliWorker, JobError, JobRunner, WorkerConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    image: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("cat.png");
        std::fs::write(&image, b"not really a png").unwrap();
        Self { dir, image }
    }

    fn script(&self, body: &str) -> PathBuf {
        let path = self.dir.path().join("demo_gradio.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn worker(&self, body: &str) -> CliWorker {
        CliWorker::new(WorkerConfig::new("sh", self.script(body)))
    }

    fn job(&self) -> Job {
        Job::new(self.image.to_string_lossy(), "a cat jumps")
    }
}

#[tokio::test]
async fn exit_zero_is_success() {
    let fx = Fixture::new();
    assert!(fx.worker("exit 0\n").execute(&fx.job(), None).await.is_ok());
}

#[tokio::test]
async fn failure_message_prefers_stderr_then_stdout() {
    let fx = Fixture::new();

    let err = fx
        .worker("echo out\necho 'CUDA out of memory' >&2\nexit 3\n")
        .execute(&fx.job(), None)
        .await
        .unwrap_err();
    assert_matches!(&err, JobError::Exit { code: Some(3), .. });
    assert_eq!(err.to_string(), "CUDA out of memory");

    let err = fx.worker("echo only-stdout\nexit 2\n").execute(&fx.job(), None).await.unwrap_err();
    assert_eq!(err.to_string(), "only-stdout");

    let err = fx.worker("exit 1\n").execute(&fx.job(), None).await.unwrap_err();
    assert_eq!(err.to_string(), "Unknown error");
}

#[tokio::test]
async fn slow_generator_times_out() {
    let fx = Fixture::new();
    let mut cfg = WorkerConfig::new("sh", fx.script("sleep 5\n"));
    cfg.timeout = Duration::from_millis(200);

    let err = CliWorker::new(cfg).execute(&fx.job(), None).await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn assigned_slot_is_exported_to_the_child() {
    let fx = Fixture::new();
    let worker = fx.worker("[ \"$CUDA_VISIBLE_DEVICES\" = \"1\" ] || { echo \"got $CUDA_VISIBLE_DEVICES\" >&2; exit 1; }\n");
    assert!(worker.execute(&fx.job(), Some(1)).await.is_ok());
}

#[tokio::test]
async fn arguments_reach_the_generator() {
    let fx = Fixture::new();
    let args_file = fx.dir.path().join("args.txt");
    let out_dir = fx.dir.path().join("videos");
    let mut cfg = WorkerConfig::new(
        "sh",
        fx.script(&format!("printf '%s\\n' \"$@\" > '{}'\n", args_file.display())),
    );
    cfg.output_dir = Some(out_dir.clone());

    let mut job = fx.job();
    job.seed = Some(0);
    job.no_teacache = Some(true);
    job.output = Some("ignored.mp4".into());
    CliWorker::new(cfg).execute(&job, None).await.unwrap();

    let recorded = std::fs::read_to_string(&args_file).unwrap();
    let lines: Vec<&str> = recorded.lines().collect();
    let image = fx.image.to_string_lossy();
    let output = out_dir.join("cat.mp4");
    let output = output.to_string_lossy();
    assert_eq!(
        lines,
        vec![
            "--cli",
            "--input_image",
            &*image,
            "--prompt",
            "a cat jumps",
            "--seed",
            "0",
            "--no_teacache",
            "--output",
            &*output,
        ]
    );
    assert!(out_dir.is_dir());
}

fn write_jobs(store: &Path, images: &[PathBuf]) {
    let jobs: Vec<_> = images
        .iter()
        .map(|p| serde_json::json!({"image": p.to_string_lossy(), "prompt": "moves"}))
        .collect();
    std::fs::write(store, serde_json::to_vec(&serde_json::json!({ "jobs": jobs })).unwrap()).unwrap();
}

#[tokio::test]
async fn dispatcher_drives_real_processes() {
    let fx = Fixture::new();
    let dog = fx.dir.path().join("dog.png");
    std::fs::write(&dog, b"x").unwrap();
    let store = fx.dir.path().join("jobs.json");
    write_jobs(&store, &[fx.image.clone(), dog.clone()]);

    let worker = fx.worker("case \"$*\" in *dog.png*) echo 'dog failed' >&2; exit 1;; esac\n");
    let opts = DispatchOptions {
        concurrency: 2,
        poll_interval: Duration::from_millis(5),
        ..DispatchOptions::default()
    };
    let mut dispatcher = Dispatcher::open(JobStore::new(&store), worker, opts).await;
    let summary = dispatcher.run().await.unwrap();
    assert_eq!((summary.processed, summary.failed), (1, 1));
    assert_eq!(summary.cycles, 1);

    let ledgers = Ledgers::open(&JobStore::new(&store)).await;
    assert!(ledgers.is_complete(&fx.image.to_string_lossy()));
    let dog_key = dog.to_string_lossy();
    assert_eq!(ledgers.failures()[&*dog_key].error, "dog failed");
}
