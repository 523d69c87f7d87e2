use anyhow::Result;
use clap::Parser;
use framepack_batch::dispatcher::{DispatchOptions, Dispatcher};
use framepack_batch::init;
use framepack_batch::job::JobStore;
use framepack_batch::worker::{CliWorker, WorkerConfig};
use std::path::PathBuf;

/// Batch process FramePack video generation.
#[derive(Debug, Parser)]
#[command(name = "framepack-batch", version)]
struct Args {
    /// JSON config file path
    #[arg(short, long)]
    config: PathBuf,

    /// Number of parallel processes
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    parallel: u16,

    /// Output directory for videos
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Reprocess all jobs, ignore progress file
    #[arg(long)]
    force_reprocess: bool,

    /// Show what would be processed without running
    #[arg(long)]
    dry_run: bool,

    /// Path to demo_gradio.py script
    #[arg(long, default_value = "demo_gradio.py")]
    demo_script: PathBuf,

    /// Python interpreter used to run the demo script
    #[arg(long, default_value = "python3")]
    python: PathBuf,

    /// Number of GPUs to use
    #[arg(long, default_value_t = 1)]
    num_gpus: usize,
}

async fn run(args: Args) -> Result<()> {
    init::require_file(&args.config, "Config file")?;
    if let Err(err) = init::require_file(&args.demo_script, "Demo script") {
        eprintln!("[INFO] Try: --demo-script FramePack/demo_gradio.py");
        return Err(err);
    }
    if !args.dry_run && !init::check_interpreter(&args.python).await {
        eprintln!("[WARNING] {} not found or not runnable.", args.python.display());
    }

    let mut worker_cfg = WorkerConfig::new(&args.python, &args.demo_script);
    worker_cfg.output_dir = args.output_dir.clone();
    if let Some(dir) = &args.output_dir {
        eprintln!("[INFO] Output: {}", dir.display());
    }

    let opts = DispatchOptions {
        concurrency: usize::from(args.parallel),
        force_reprocess: args.force_reprocess,
        dry_run: args.dry_run,
        resource_count: args.num_gpus,
        ..DispatchOptions::default()
    };

    let mut dispatcher = Dispatcher::open(JobStore::new(&args.config), CliWorker::new(worker_cfg), opts).await;
    dispatcher.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    framepack_batch::init_tracing();
    let args = Args::parse();

    eprintln!("[INFO] FramePack Batch Processor");

    let code = tokio::select! {
        result = run(args) => match result {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("[ERROR] {:#}", err);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[WARN] Interrupted by user");
            1
        }
    };
    std::process::exit(code);
}
