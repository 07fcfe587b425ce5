use std::path::{Path, PathBuf};

use tokio::fs;
use weaver_types::{WeaverError, WeaverResult};

/// Result of a mutating Guard call: the pre-image is always returned so callers can
/// emit a diff/event without a second read (spec.md §4.2 invariant).
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub path: String,
    pub before: Option<String>,
    pub after: String,
}

/// Path-confined filesystem access rooted at a project's folder (spec.md §4.2).
///
/// Containment is checked two ways, mirroring the two independent strategies the
/// teacher workspace uses: a syntactic check rejecting absolute paths and `..`
/// components before any I/O (`tandem-tools::is_path_allowed`), and a
/// canonicalize-then-`starts_with` check for the resolved absolute path
/// (`tandem-core::storage_paths::is_within_workspace_root`).
pub struct Guard {
    root: PathBuf,
}

impl Guard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_syntactically_safe(relative: &str) -> bool {
        let path = Path::new(relative);
        !path.is_absolute() && !path.components().any(|c| matches!(c, std::path::Component::ParentDir))
    }

    /// Resolves a project-relative path to an absolute path, failing with
    /// `WeaverError::Apply { reason: "path-escape" }` if the result is not a
    /// descendant of the root.
    pub fn resolve_safe(&self, relative: &str) -> WeaverResult<PathBuf> {
        if !Self::is_syntactically_safe(relative) {
            return Err(WeaverError::apply(
                format!("path escapes project root: {relative}"),
                "path-escape",
            ));
        }
        let candidate = self.root.join(relative);
        let root_canonical = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let probe = candidate.parent().filter(|p| p.exists()).unwrap_or(&self.root);
        let probe_canonical = probe.canonicalize().unwrap_or_else(|_| probe.to_path_buf());
        if !probe_canonical.starts_with(&root_canonical) {
            return Err(WeaverError::apply(
                format!("path escapes project root: {relative}"),
                "path-escape",
            ));
        }
        Ok(candidate)
    }

    pub async fn list(&self, relative_dir: &str) -> WeaverResult<Vec<String>> {
        let dir = self.resolve_safe(relative_dir)?;
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| WeaverError::apply(format!("read_dir failed: {e}"), "io-error"))?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WeaverError::apply(format!("read_dir failed: {e}"), "io-error"))?
        {
            out.push(entry.file_name().to_string_lossy().to_string());
        }
        out.sort();
        Ok(out)
    }

    pub async fn read_file(&self, relative: &str) -> WeaverResult<String> {
        let path = self.resolve_safe(relative)?;
        fs::read_to_string(&path)
            .await
            .map_err(|e| WeaverError::apply(format!("read failed for {relative}: {e}"), "io-error"))
    }

    async fn read_if_exists(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path).await.ok()
    }

    /// Writes `content` to `relative`, creating parent directories as needed. Returns
    /// the pre-image. `dry_run` never touches disk.
    pub async fn write_file(&self, relative: &str, content: &str, dry_run: bool) -> WeaverResult<WriteOutcome> {
        let path = self.resolve_safe(relative)?;
        let before = self.read_if_exists(&path).await;
        if dry_run {
            return Ok(WriteOutcome { path: relative.to_string(), before, after: content.to_string() });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| WeaverError::apply(format!("mkdir failed: {e}"), "io-error"))?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| WeaverError::apply(format!("write failed for {relative}: {e}"), "io-error"))?;
        Ok(WriteOutcome { path: relative.to_string(), before, after: content.to_string() })
    }

    pub async fn append_file(&self, relative: &str, content: &str, dry_run: bool) -> WeaverResult<WriteOutcome> {
        let path = self.resolve_safe(relative)?;
        let before = self.read_if_exists(&path).await;
        let after = format!("{}{}", before.clone().unwrap_or_default(), content);
        if dry_run {
            return Ok(WriteOutcome { path: relative.to_string(), before, after });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| WeaverError::apply(format!("mkdir failed: {e}"), "io-error"))?;
        }
        fs::write(&path, &after)
            .await
            .map_err(|e| WeaverError::apply(format!("append failed for {relative}: {e}"), "io-error"))?;
        Ok(WriteOutcome { path: relative.to_string(), before, after })
    }

    /// Replaces a 1-indexed, inclusive line range with `new_text`.
    pub async fn replace_range(
        &self,
        relative: &str,
        start_line: usize,
        end_line: usize,
        new_text: &str,
    ) -> WeaverResult<WriteOutcome> {
        let path = self.resolve_safe(relative)?;
        let before = fs::read_to_string(&path)
            .await
            .map_err(|e| WeaverError::apply(format!("read failed for {relative}: {e}"), "io-error"))?;
        if start_line == 0 || start_line > end_line {
            return Err(WeaverError::apply("invalid line range", "bad-range"));
        }
        let lines: Vec<&str> = before.lines().collect();
        if end_line > lines.len() {
            return Err(WeaverError::apply("range exceeds file length", "bad-range"));
        }
        let mut out = Vec::with_capacity(lines.len());
        out.extend_from_slice(&lines[..start_line - 1]);
        out.push(new_text);
        out.extend_from_slice(&lines[end_line..]);
        let after = out.join("\n");
        fs::write(&path, &after)
            .await
            .map_err(|e| WeaverError::apply(format!("write failed for {relative}: {e}"), "io-error"))?;
        Ok(WriteOutcome { path: relative.to_string(), before: Some(before), after })
    }

    /// Applies a unified diff. Rejects patches whose `--- `/`+++ ` headers reference a
    /// path other than `relative` (cross-path patches), matching
    /// `tandem-tools::ApplyPatchTool`'s marker validation in spirit.
    pub async fn apply_patch(&self, relative: &str, unified_diff: &str) -> WeaverResult<WriteOutcome> {
        for line in unified_diff.lines() {
            if let Some(rest) = line.strip_prefix("--- ").or_else(|| line.strip_prefix("+++ ")) {
                let referenced = rest.trim().trim_start_matches("a/").trim_start_matches("b/");
                if referenced != "/dev/null" && !referenced.is_empty() && !referenced.ends_with(relative) {
                    return Err(WeaverError::apply(
                        format!("patch references foreign path: {referenced}"),
                        "foreign-path",
                    ));
                }
            }
        }
        let before = self.read_file(relative).await.unwrap_or_default();
        let after = apply_unified_diff(&before, unified_diff)?;
        let path = self.resolve_safe(relative)?;
        fs::write(&path, &after)
            .await
            .map_err(|e| WeaverError::apply(format!("write failed for {relative}: {e}"), "io-error"))?;
        Ok(WriteOutcome { path: relative.to_string(), before: Some(before), after })
    }
}

/// A minimal, whitespace-tolerant unified-diff applier: walks `@@` hunks, matching
/// context/removed lines against the source with trailing-whitespace tolerance.
fn apply_unified_diff(original: &str, diff: &str) -> WeaverResult<String> {
    let original_lines: Vec<&str> = original.lines().collect();
    let mut result: Vec<String> = Vec::new();
    let mut cursor = 0usize;
    let mut in_hunk = false;

    for line in diff.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff ") {
            continue;
        }
        if let Some(header) = line.strip_prefix("@@") {
            let start = parse_hunk_start(header).unwrap_or(cursor + 1);
            while cursor < start.saturating_sub(1) && cursor < original_lines.len() {
                result.push(original_lines[cursor].to_string());
                cursor += 1;
            }
            in_hunk = true;
            continue;
        }
        if !in_hunk {
            continue;
        }
        if let Some(added) = line.strip_prefix('+') {
            result.push(added.to_string());
        } else if let Some(removed) = line.strip_prefix('-') {
            if cursor < original_lines.len() && original_lines[cursor].trim_end() == removed.trim_end() {
                cursor += 1;
            }
        } else {
            let context = line.strip_prefix(' ').unwrap_or(line);
            if cursor < original_lines.len() {
                result.push(original_lines[cursor].to_string());
                cursor += 1;
            } else {
                result.push(context.to_string());
            }
        }
    }
    while cursor < original_lines.len() {
        result.push(original_lines[cursor].to_string());
        cursor += 1;
    }
    Ok(result.join("\n"))
}

fn parse_hunk_start(header: &str) -> Option<usize> {
    let plus = header.split('+').nth(1)?;
    let num = plus.split(|c: char| !c.is_ascii_digit()).next()?;
    num.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("weaver-guard-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let root = temp_root();
        let guard = Guard::new(&root);
        guard.write_file("src/lib.rs", "fn main() {}", false).await.unwrap();
        let content = guard.read_file("src/lib.rs").await.unwrap();
        assert_eq!(content, "fn main() {}");
    }

    #[tokio::test]
    async fn rejects_absolute_path() {
        let root = temp_root();
        let guard = Guard::new(&root);
        let err = guard.write_file("/etc/passwd", "pwned", false).await.unwrap_err();
        assert_eq!(err.reason(), Some("path-escape"));
    }

    #[tokio::test]
    async fn rejects_parent_dir_traversal() {
        let root = temp_root();
        let guard = Guard::new(&root);
        let err = guard.write_file("../outside.txt", "x", false).await.unwrap_err();
        assert_eq!(err.reason(), Some("path-escape"));
    }

    #[tokio::test]
    async fn dry_run_never_touches_disk() {
        let root = temp_root();
        let guard = Guard::new(&root);
        guard.write_file("a.txt", "content", true).await.unwrap();
        assert!(!root.join("a.txt").exists());
    }

    #[tokio::test]
    async fn append_concatenates_prior_content() {
        let root = temp_root();
        let guard = Guard::new(&root);
        guard.write_file("log.txt", "line1\n", false).await.unwrap();
        let outcome = guard.append_file("log.txt", "line2\n", false).await.unwrap();
        assert_eq!(outcome.after, "line1\nline2\n");
    }

    #[tokio::test]
    async fn replace_range_is_one_indexed_inclusive() {
        let root = temp_root();
        let guard = Guard::new(&root);
        guard.write_file("f.txt", "a\nb\nc\nd", false).await.unwrap();
        let outcome = guard.replace_range("f.txt", 2, 3, "X").await.unwrap();
        assert_eq!(outcome.after, "a\nX\nd");
    }
}
