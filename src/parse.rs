use crate::error::CrucibleError;
use crate::job::{ChangeType, GeneratedFile};

/// Cap on a single parsed file.
pub const MAX_FILE_BYTES: usize = 512 * 1024;

/// Extract the file set from a model response. Only clearly delimited
/// file artifacts are accepted:
///
/// - a header line `FILE: relative/path` (optionally behind markdown
///   heading or bold markers) followed by a fenced code block, or
/// - a fenced block whose info string carries `filename=relative/path`.
///
/// Prose outside delimiters is ignored. Returns `ParseFailed` when the
/// response contains no parseable file at all.
pub fn parse_generated_files(
    response: &str,
    default_language: &str,
    attempt: u32,
) -> Result<Vec<GeneratedFile>, CrucibleError> {
    let mut files: Vec<GeneratedFile> = Vec::new();
    let mut pending_path: Option<String> = None;
    let mut in_fence = false;
    let mut fence_marker = "```";
    let mut current: Option<(String, String, Vec<String>)> = None; // path, language, lines

    for line in response.lines() {
        if in_fence {
            if line.trim_start().starts_with(fence_marker) {
                in_fence = false;
                if let Some((path, language, lines)) = current.take() {
                    push_file(&mut files, path, language, lines, attempt);
                }
            } else if let Some((_, _, lines)) = current.as_mut() {
                lines.push(line.to_string());
            }
            continue;
        }

        if let Some(info) = line.trim_start().strip_prefix("````") {
            fence_marker = "````";
            open_fence(info, &mut pending_path, &mut in_fence, &mut current, default_language);
            continue;
        }
        if let Some(info) = line.trim_start().strip_prefix("```") {
            fence_marker = "```";
            open_fence(info, &mut pending_path, &mut in_fence, &mut current, default_language);
            continue;
        }

        if let Some(path) = header_path(line) {
            pending_path = Some(path);
        } else if !line.trim().is_empty() {
            // Prose resets a pending header only when something other than
            // a blank line separates it from its fence.
            pending_path = None;
        }
    }

    // An unterminated fence still counts when it carries a path; models
    // truncated mid-stream should not lose their last file.
    if let Some((path, language, lines)) = current.take() {
        push_file(&mut files, path, language, lines, attempt);
    }

    if files.is_empty() {
        return Err(CrucibleError::ParseFailed);
    }
    Ok(files)
}

fn open_fence(
    info: &str,
    pending_path: &mut Option<String>,
    in_fence: &mut bool,
    current: &mut Option<(String, String, Vec<String>)>,
    default_language: &str,
) {
    *in_fence = true;
    let info = info.trim();
    let language = info
        .split_whitespace()
        .next()
        .filter(|token| !token.contains('='))
        .unwrap_or(default_language)
        .to_string();
    let info_path = info
        .split_whitespace()
        .find_map(|token| token.strip_prefix("filename="))
        .map(|p| p.trim_matches('"').to_string());

    let path = info_path.or_else(|| pending_path.take());
    *current = path.map(|p| (p, language, Vec::new()));
}

/// Accepts `FILE: path`, `# FILE: path`, `**FILE: path**` and the
/// lowercase variants.
fn header_path(line: &str) -> Option<String> {
    let trimmed = line
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_matches('*')
        .trim();
    let rest = trimmed
        .strip_prefix("FILE:")
        .or_else(|| trimmed.strip_prefix("File:"))
        .or_else(|| trimmed.strip_prefix("file:"))?;
    let path = rest.trim().trim_matches('`').trim();
    (!path.is_empty()).then(|| path.to_string())
}

fn push_file(
    files: &mut Vec<GeneratedFile>,
    path: String,
    language: String,
    lines: Vec<String>,
    attempt: u32,
) {
    let Some(path) = sanitize_path(&path) else {
        tracing::warn!(path = %path, "rejected unsafe generated path");
        return;
    };

    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    if content.len() > MAX_FILE_BYTES {
        tracing::warn!(path = %path, bytes = content.len(), "rejected oversized generated file");
        return;
    }

    // A later block for the same path replaces the earlier one; models
    // commonly re-emit a corrected version within one response.
    if let Some(existing) = files.iter_mut().find(|f| f.path == path) {
        existing.content = content;
        existing.language = language;
        return;
    }

    files.push(GeneratedFile {
        path,
        content,
        language,
        change_type: ChangeType::Created,
        attempt,
    });
}

/// Relative, no parent traversal, no drive/scheme prefixes.
fn sanitize_path(path: &str) -> Option<String> {
    let path = path.trim().replace('\\', "/");
    if path.is_empty() || path.len() > 256 {
        return None;
    }
    if path.starts_with('/') || path.contains(':') {
        return None;
    }
    if path.split('/').any(|part| part == ".." || part.is_empty() || part == ".") {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_forms_are_accepted() {
        assert_eq!(header_path("FILE: src/main.go"), Some("src/main.go".into()));
        assert_eq!(header_path("## FILE: a.py"), Some("a.py".into()));
        assert_eq!(header_path("**file: b.ts**"), Some("b.ts".into()));
        assert_eq!(header_path("FILE: `c.rs`"), Some("c.rs".into()));
        assert_eq!(header_path("not a header"), None);
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        assert!(sanitize_path("/etc/passwd").is_none());
        assert!(sanitize_path("../../escape.go").is_none());
        assert!(sanitize_path("a/../b.go").is_none());
        assert!(sanitize_path("C:\\windows\\x.cs").is_none());
        assert_eq!(sanitize_path("pkg\\util.cs"), Some("pkg/util.cs".into()));
    }
}
