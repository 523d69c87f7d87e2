//! Motion prompt generation for a directory of images.
//!
//! Results go into a `{"jobs": [...]}` document shaped like a job store, so
//! its output can be fed straight to the batch runner. The document is saved
//! after every new record.

use crate::api::openai;
use crate::config::Config;
use crate::store::{Loaded, load_json, save_json};
use crate::{loge, logi, logok, logw};
use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];
pub const DEFAULT_DURATION: f64 = 5.0;
pub const DEFAULT_SEED: i64 = 31337;
pub const PRODUCT_PROMPT: &str =
    "The product rotates slowly in place while the camera glides smoothly around it, with soft studio lighting.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub type PromptRecords = IndexMap<String, PromptRecord>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PromptDocument<T> {
    #[serde(default)]
    jobs: Vec<T>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PromptKind {
    /// Ask the vision model to describe motion for each image.
    General,
    /// Use the fixed product-showcase prompt.
    Product,
}

/// Produces a prompt for one image. `Ok(None)` means "no usable prompt".
#[async_trait]
pub trait PromptSource: Send + Sync {
    async fn generate(&self, image: &Path) -> Result<Option<String>>;
}

pub struct FixedPrompt {
    text: String,
}

impl FixedPrompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn product() -> Self {
        Self::new(PRODUCT_PROMPT)
    }
}

#[async_trait]
impl PromptSource for FixedPrompt {
    async fn generate(&self, _image: &Path) -> Result<Option<String>> {
        Ok(Some(self.text.clone()))
    }
}

pub struct VisionPrompt {
    client: reqwest::Client,
    cfg: Config,
}

impl VisionPrompt {
    pub fn new(cfg: Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, cfg })
    }
}

#[async_trait]
impl PromptSource for VisionPrompt {
    async fn generate(&self, image: &Path) -> Result<Option<String>> {
        openai::openai_motion_prompt(&self.client, &self.cfg, image).await
    }
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub image_dir: PathBuf,
    pub output_file: PathBuf,
    pub duration: f64,
    pub seed: i64,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptSummary {
    pub total: usize,
    pub skipped: usize,
    pub generated: usize,
    pub failed: usize,
    pub pruned: usize,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Images directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
        if entry.file_type().is_file() && is_image(entry.path()) {
            out.push(entry.into_path());
        }
    }
    out.sort();
    Ok(out)
}

/// Record key for `path`: the path relative to the working directory.
pub fn record_key(path: &Path) -> String {
    let relative = if path.is_absolute() {
        std::env::current_dir()
            .ok()
            .and_then(|cwd| pathdiff::diff_paths(path, cwd))
            .unwrap_or_else(|| path.to_path_buf())
    } else {
        path.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    };
    relative.to_string_lossy().into_owned()
}

/// Loads the output document keyed by image. Records that do not parse are
/// dropped with a warning.
pub async fn load_records(path: &Path) -> PromptRecords {
    let doc: PromptDocument<Value> = match load_json(path).await {
        Loaded::Found(doc) => doc,
        Loaded::Missing => return PromptRecords::new(),
        Loaded::Corrupt(reason) => {
            logw(format!("Could not parse existing file {}: {}", path.display(), reason));
            return PromptRecords::new();
        }
    };

    let mut records = PromptRecords::new();
    for raw in doc.jobs {
        match serde_json::from_value::<PromptRecord>(raw) {
            Ok(record) => {
                records.insert(record.image.clone(), record);
            }
            Err(err) => logw(format!("Dropping unreadable record in {}: {}", path.display(), err)),
        }
    }
    records
}

pub async fn save_records(path: &Path, records: &PromptRecords) -> Result<()> {
    let doc = PromptDocument {
        jobs: records.values().collect(),
    };
    save_json(path, &doc).await
}

/// Keys of records whose image no longer exists. Removes them unless `dry_run`.
pub fn prune_missing(records: &mut PromptRecords, dry_run: bool) -> Vec<String> {
    let missing: Vec<String> = records
        .keys()
        .filter(|key| !Path::new(key.as_str()).exists())
        .cloned()
        .collect();

    for key in &missing {
        if dry_run {
            logi(format!("DRY RUN - would remove record for missing file: {}", key));
        } else {
            logw(format!("Removing record for missing file: {}", key));
            records.shift_remove(key);
        }
    }
    missing
}

pub async fn run_prompts(opts: &PromptOptions, source: &dyn PromptSource) -> Result<PromptSummary> {
    if !opts.image_dir.is_dir() {
        anyhow::bail!("Image directory '{}' does not exist!", opts.image_dir.display());
    }

    let images = list_images(&opts.image_dir)?;
    let mut records = load_records(&opts.output_file).await;
    logi(format!(
        "Loaded {} existing entries from {}",
        records.len(),
        opts.output_file.display()
    ));

    let mut summary = PromptSummary {
        total: images.len(),
        ..PromptSummary::default()
    };

    let missing = prune_missing(&mut records, opts.dry_run);
    if !opts.dry_run && !missing.is_empty() {
        summary.pruned = missing.len();
        save_records(&opts.output_file, &records).await?;
        logok(format!("Pruned {} stale record(s)", missing.len()));
    }

    if images.is_empty() {
        logw(format!("No images found in {}", opts.image_dir.display()));
        return Ok(summary);
    }
    logi(format!("Found {} images in {}", images.len(), opts.image_dir.display()));

    for (idx, image) in images.iter().enumerate() {
        let key = record_key(image);
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.clone());
        logi(format!("Processing image {}/{}: {}", idx + 1, images.len(), name));

        if records.contains_key(&key) {
            logi("  Already processed, skipping");
            summary.skipped += 1;
            continue;
        }

        if opts.dry_run {
            logi(format!("  DRY RUN - would generate prompt for {}", key));
            continue;
        }

        let prompt = match source.generate(image).await {
            Ok(Some(prompt)) if !prompt.trim().is_empty() => prompt.trim().to_string(),
            Ok(_) => {
                loge("  Failed to generate prompt");
                summary.failed += 1;
                continue;
            }
            Err(err) => {
                loge(format!("  Failed to generate prompt: {:#}", err));
                summary.failed += 1;
                continue;
            }
        };

        logok(format!("  Generated: {}", prompt));
        records.insert(
            key.clone(),
            PromptRecord {
                image: key,
                prompt,
                duration: Some(opts.duration),
                seed: Some(opts.seed),
                extra: Map::new(),
            },
        );
        summary.generated += 1;
        save_records(&opts.output_file, &records).await?;
    }

    logi("Summary:");
    logi(format!("  Total images: {}", summary.total));
    logi(format!("  Already processed: {}", summary.skipped));
    logi(format!("  Newly processed: {}", summary.generated));
    logi(format!("  Failed: {}", summary.failed));
    logi(format!("  Pruned: {}", summary.pruned));
    logi(format!("  Output saved to: {}", opts.output_file.display()));
    Ok(summary)
}
