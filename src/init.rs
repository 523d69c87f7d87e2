use anyhow::Result;
use std::path::Path;

/// Fails with a startup error naming `what` when `path` is not a file.
pub fn require_file(path: &Path, what: &str) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("{} '{}' not found!", what, path.display());
    }
    Ok(())
}

pub async fn check_interpreter(program: &Path) -> bool {
    match tokio::process::Command::new(program)
        .arg("--version")
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
