use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::job::GeneratedFile;

/// Maximum slug length in the output directory name.
const MAX_SLUG_LEN: usize = 48;

/// Derive a directory slug from a task description: lowercase, runs of
/// non-[a-z0-9] collapse to a single hyphen, hyphens trimmed at both ends.
pub fn slug(task: &str) -> String {
    let mut out = String::new();
    let mut last_hyphen = true; // suppress a leading hyphen
    for c in task.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            out.push('-');
            last_hyphen = true;
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    out.trim_matches('-').to_string()
}

/// `generated/{yyyy-MM-dd_HHmmss}_{task-slug}` under the given base.
pub fn output_dir(base: &Path, at: DateTime<Utc>, task: &str) -> PathBuf {
    let stamp = at.format("%Y-%m-%d_%H%M%S");
    base.join("generated").join(format!("{stamp}_{}", slug(task)))
}

/// Persist an accepted file set. Each file is written atomically (temp
/// file + rename) so a crash mid-write never leaves a partial artifact.
/// Returns the directory the files landed in.
pub async fn persist_files(
    base: &Path,
    task: &str,
    files: &[GeneratedFile],
) -> Result<PathBuf, std::io::Error> {
    let dir = output_dir(base, Utc::now(), task);

    for file in files {
        let path = dir.join(&file.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp_path, file.content.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
    }

    Ok(dir)
}
