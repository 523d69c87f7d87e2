//! Loading and saving of the JSON documents this crate owns or reads.
//!
//! Every document goes through [`load_json`], which never fails: callers get a
//! [`Loaded`] telling them whether the file was read, absent, or unusable, and
//! decide for themselves how loudly to complain.

use crate::logw;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Found(T),
    Missing,
    /// The file exists but could not be read or parsed.
    Corrupt(String),
}

impl<T: Default> Loaded<T> {
    /// Falls back to `T::default()`, warning only when the file was corrupt.
    pub fn or_default_warn(self, path: &Path) -> T {
        match self {
            Loaded::Found(value) => value,
            Loaded::Missing => T::default(),
            Loaded::Corrupt(reason) => {
                logw(format!("Could not load {}: {}", path.display(), reason));
                T::default()
            }
        }
    }
}

pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Loaded<T> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Loaded::Missing,
        Err(err) => return Loaded::Corrupt(err.to_string()),
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Loaded::Found(value),
        Err(err) => Loaded::Corrupt(err.to_string()),
    }
}

/// Writes `value` as pretty JSON, replacing `path` atomically.
///
/// The document is written to a temporary file in the same directory and
/// renamed over the target, so readers never observe a half-written file.
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    body.push(b'\n');

    let target = path.to_path_buf();
    let dir = parent_dir(path);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target)
            .with_context(|| format!("Failed to replace {}", target.display()))?;
        Ok(())
    })
    .await
    .context("Save task panicked")?
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
