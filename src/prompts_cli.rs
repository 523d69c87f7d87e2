use anyhow::Result;
use clap::Parser;
use framepack_batch::config::Config;
use framepack_batch::prompts::{
    self, FixedPrompt, PromptKind, PromptOptions, PromptSource, VisionPrompt,
};
use std::path::PathBuf;

/// Generate motion prompts for images and save them as a batch job file.
#[derive(Debug, Parser)]
#[command(name = "framepack-prompts", version)]
struct Args {
    /// Directory containing images
    #[arg(short, long)]
    images: PathBuf,

    /// Output JSON file path
    #[arg(short, long)]
    output: PathBuf,

    /// Default video duration in seconds
    #[arg(short, long, default_value_t = prompts::DEFAULT_DURATION)]
    duration: f64,

    /// Default seed value
    #[arg(short, long, default_value_t = prompts::DEFAULT_SEED)]
    seed: i64,

    /// Show what would be generated without calling the API or writing
    #[arg(long)]
    dry_run: bool,

    /// Kind of prompt to produce
    #[arg(long, value_enum, default_value_t = PromptKind::General)]
    prompt_type: PromptKind,
}

async fn run(args: Args) -> Result<()> {
    let source: Box<dyn PromptSource> = match args.prompt_type {
        PromptKind::General => Box::new(VisionPrompt::new(Config::from_env()?)?),
        PromptKind::Product => Box::new(FixedPrompt::product()),
    };

    let opts = PromptOptions {
        image_dir: args.images,
        output_file: args.output,
        duration: args.duration,
        seed: args.seed,
        dry_run: args.dry_run,
    };
    prompts::run_prompts(&opts, source.as_ref()).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    framepack_batch::init_tracing();
    let args = Args::parse();

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
