use std::path::{Path, PathBuf};

use regex::Regex;

use crate::ai::prompts::strip_markdown_fences;
use crate::error::{Error, Result};

/// Normalize a model-produced patch: strip markdown fences, CRLF→LF, ensure
/// a trailing newline.
pub fn clean_patch(raw: &str) -> String {
    let stripped = strip_markdown_fences(raw);
    let mut cleaned = stripped.replace("\r\n", "\n");
    if !cleaned.is_empty() && !cleaned.ends_with('\n') {
        cleaned.push('\n');
    }
    cleaned
}

/// Structural gate for generated patches: must contain `--- `, `+++ `, `@@`,
/// and at least one add/remove line that is not a file header.
pub fn looks_like_unified_diff_patch(patch: &str) -> bool {
    let mut has_old = false;
    let mut has_new = false;
    let mut has_hunk = false;
    let mut has_change = false;

    for line in patch.lines() {
        if line.starts_with("--- ") {
            has_old = true;
        } else if line.starts_with("+++ ") {
            has_new = true;
        } else if line.starts_with("@@") {
            has_hunk = true;
        } else if (line.starts_with('+') || line.starts_with('-'))
            && !line.starts_with("+++")
            && !line.starts_with("---")
        {
            has_change = true;
        }
    }

    has_old && has_new && has_hunk && has_change
}

/// Join `rel` under `base`, guaranteeing the result stays inside `base`.
///
/// All file writes during patch application go through this helper; a path
/// that lexically escapes the clone root is rejected before any IO.
pub fn safe_repo_join(base: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(Error::Patch(format!("absolute path in patch: {rel}")));
    }

    let mut normalized = PathBuf::new();
    for component in rel_path.components() {
        match component {
            std::path::Component::Normal(part) => normalized.push(part),
            std::path::Component::CurDir => {}
            _ => {
                return Err(Error::Patch(format!("path escapes repo root: {rel}")));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(Error::Patch(format!("empty path in patch: {rel}")));
    }

    let base = base
        .canonicalize()
        .map_err(|e| Error::Patch(format!("repo root {}: {e}", base.display())))?;
    let joined = base.join(&normalized);

    // Belt and braces: verify the joined absolute path still lies under base.
    if joined != base && !joined.starts_with(&base) {
        return Err(Error::Patch(format!("path escapes repo root: {rel}")));
    }
    Ok(joined)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFile {
    pub path: String,
    pub hunks: Vec<Hunk>,
}

fn strip_file_prefix(header: &str) -> String {
    let path = header.trim();
    let path = path.strip_prefix("a/").or_else(|| path.strip_prefix("b/")).unwrap_or(path);
    path.to_string()
}

/// Parse a unified diff. Tolerates bare `@@` headers (counts default to 0)
/// so the repair pass can rewrite them.
pub fn parse_patch(patch: &str) -> Result<Vec<PatchFile>> {
    let header_re = Regex::new(r"^@@\s*(?:-(\d+)(?:,(\d+))?)?\s*(?:\+(\d+)(?:,(\d+))?)?\s*@@")
        .expect("valid regex");

    let mut files: Vec<PatchFile> = Vec::new();
    let mut current_file: Option<PatchFile> = None;
    let mut current_hunk: Option<Hunk> = None;

    let flush_hunk = |file: &mut Option<PatchFile>, hunk: &mut Option<Hunk>| {
        if let (Some(f), Some(h)) = (file.as_mut(), hunk.take()) {
            f.hunks.push(h);
        }
    };

    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            flush_hunk(&mut current_file, &mut current_hunk);
            if let Some(f) = current_file.take() {
                files.push(f);
            }
            current_file = Some(PatchFile {
                path: strip_file_prefix(rest),
                hunks: Vec::new(),
            });
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            // Prefer the new-side path; `/dev/null` keeps the old side.
            if let Some(f) = current_file.as_mut() {
                let path = strip_file_prefix(rest);
                if path != "/dev/null" && path != "dev/null" {
                    f.path = path;
                }
            }
        } else if let Some(caps) = header_re.captures(line) {
            flush_hunk(&mut current_file, &mut current_hunk);
            let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            current_hunk = Some(Hunk {
                old_start: num(1),
                old_count: num(2),
                new_start: num(3),
                new_count: num(4),
                lines: Vec::new(),
            });
        } else if let Some(hunk) = current_hunk.as_mut() {
            if let Some(rest) = line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Remove(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(rest.to_string()));
            } else if line.is_empty() {
                hunk.lines.push(HunkLine::Context(String::new()));
            }
            // Anything else (e.g. "\ No newline at end of file") is dropped.
        }
    }
    flush_hunk(&mut current_file, &mut current_hunk);
    if let Some(f) = current_file.take() {
        files.push(f);
    }

    if files.is_empty() {
        return Err(Error::Patch("no file headers in patch".to_string()));
    }
    Ok(files)
}

fn lines_match(a: &str, b: &str) -> bool {
    a.trim_end() == b.trim_end()
}

/// Find the first index at or after `from` where the old-side sequence of a
/// hunk matches the file, comparing with trailing whitespace ignored.
fn find_old_side(file_lines: &[&str], old_side: &[String], from: usize) -> Option<usize> {
    if old_side.is_empty() {
        return None;
    }
    let mut i = from;
    while i + old_side.len() <= file_lines.len() {
        if old_side
            .iter()
            .zip(&file_lines[i..i + old_side.len()])
            .all(|(want, have)| lines_match(want, have))
        {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Rewrite hunk headers (including bare `@@`) with line numbers recovered by
/// searching the target file for each hunk's old-side content.
pub fn repair_hunk_headers(patch: &str, file_content: &str) -> Result<String> {
    let files = parse_patch(patch)?;
    let file_lines: Vec<&str> = file_content.lines().collect();

    let mut out = String::new();
    for file in &files {
        out.push_str(&format!("--- a/{}\n", file.path));
        out.push_str(&format!("+++ b/{}\n", file.path));

        let mut search_from = 0usize;
        let mut offset: i64 = 0;
        for hunk in &file.hunks {
            let old_side: Vec<String> = hunk
                .lines
                .iter()
                .filter_map(|l| match l {
                    HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.clone()),
                    HunkLine::Add(_) => None,
                })
                .collect();
            let add_count = hunk
                .lines
                .iter()
                .filter(|l| matches!(l, HunkLine::Add(_)))
                .count();
            let remove_count = hunk
                .lines
                .iter()
                .filter(|l| matches!(l, HunkLine::Remove(_)))
                .count();
            let context_count = old_side.len() - remove_count;

            let old_start = match find_old_side(&file_lines, &old_side, search_from) {
                Some(index) => index + 1,
                None => {
                    return Err(Error::Patch(format!(
                        "hunk context not found in {}",
                        file.path
                    )));
                }
            };
            search_from = old_start - 1 + old_side.len();

            let old_count = old_side.len();
            let new_count = context_count + add_count;
            let new_start = (old_start as i64 + offset) as usize;
            offset += add_count as i64 - remove_count as i64;

            out.push_str(&format!(
                "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
            ));
            for line in &hunk.lines {
                match line {
                    HunkLine::Context(s) => out.push_str(&format!(" {s}\n")),
                    HunkLine::Add(s) => out.push_str(&format!("+{s}\n")),
                    HunkLine::Remove(s) => out.push_str(&format!("-{s}\n")),
                }
            }
        }
    }
    Ok(out)
}

/// Additions-only fallback applier.
///
/// Patches containing deletions are rejected outright. For each hunk, the
/// anchor is located by content: additions are inserted just before the
/// first after-context line, or just after the last before-context line.
pub fn apply_additions_by_anchor(repo_root: &Path, patch: &str) -> Result<()> {
    let files = parse_patch(patch)?;

    for file in &files {
        for hunk in &file.hunks {
            if hunk.lines.iter().any(|l| matches!(l, HunkLine::Remove(_))) {
                return Err(Error::Patch(format!(
                    "patch for {} contains deletions, refusing anchor fallback",
                    file.path
                )));
            }
        }
    }

    for file in &files {
        let target = safe_repo_join(repo_root, &file.path)?;
        let content = std::fs::read_to_string(&target)
            .map_err(|e| Error::Patch(format!("read {}: {e}", file.path)))?;
        let had_trailing_newline = content.ends_with('\n');
        let mut lines: Vec<String> = content.lines().map(|s| s.to_string()).collect();

        let mut search_from = 0usize;
        for hunk in &file.hunks {
            let first_add = hunk
                .lines
                .iter()
                .position(|l| matches!(l, HunkLine::Add(_)))
                .ok_or_else(|| {
                    Error::Patch(format!("hunk for {} has no additions", file.path))
                })?;
            let last_add = hunk
                .lines
                .iter()
                .rposition(|l| matches!(l, HunkLine::Add(_)))
                .expect("position found above");

            let additions: Vec<String> = hunk
                .lines
                .iter()
                .filter_map(|l| match l {
                    HunkLine::Add(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            let before: Vec<&String> = hunk.lines[..first_add]
                .iter()
                .filter_map(|l| match l {
                    HunkLine::Context(s) => Some(s),
                    _ => None,
                })
                .collect();
            let after: Vec<&String> = hunk.lines[last_add + 1..]
                .iter()
                .filter_map(|l| match l {
                    HunkLine::Context(s) => Some(s),
                    _ => None,
                })
                .collect();

            let insert_at = if let Some(first_after) = after.first() {
                let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
                let index = refs
                    .iter()
                    .skip(search_from)
                    .position(|have| lines_match(first_after, have))
                    .map(|i| i + search_from)
                    .ok_or_else(|| {
                        Error::Patch(format!(
                            "anchor line not found in {}: {first_after:?}",
                            file.path
                        ))
                    })?;
                index
            } else if let Some(last_before) = before.last() {
                let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
                let index = refs
                    .iter()
                    .skip(search_from)
                    .position(|have| lines_match(last_before, have))
                    .map(|i| i + search_from)
                    .ok_or_else(|| {
                        Error::Patch(format!(
                            "anchor line not found in {}: {last_before:?}",
                            file.path
                        ))
                    })?;
                index + 1
            } else {
                return Err(Error::Patch(format!(
                    "hunk for {} has no context lines to anchor on",
                    file.path
                )));
            };

            for (i, addition) in additions.iter().enumerate() {
                lines.insert(insert_at + i, addition.clone());
            }
            search_from = insert_at + additions.len();
        }

        let mut new_content = lines.join("\n");
        if had_trailing_newline {
            new_content.push('\n');
        }
        std::fs::write(&target, new_content)
            .map_err(|e| Error::Patch(format!("write {}: {e}", file.path)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID_PATCH: &str = "--- a/src/db.js\n+++ b/src/db.js\n@@ -1,3 +1,4 @@\n const db = require('./pool');\n+const escape = require('sql-escape');\n const q = input;\n run(q);\n";

    #[test]
    fn test_clean_patch_strips_fences_and_crlf() {
        let raw = "```diff\r\n--- a/x\r\n+++ b/x\r\n@@ -1 +1 @@\r\n-a\r\n+b\r\n```";
        let cleaned = clean_patch(raw);
        assert!(!cleaned.contains("```"));
        assert!(!cleaned.contains('\r'));
        assert!(cleaned.ends_with('\n'));
        assert!(cleaned.starts_with("--- a/x"));
    }

    #[test]
    fn test_patch_gate_accepts_valid() {
        assert!(looks_like_unified_diff_patch(VALID_PATCH));
    }

    #[test]
    fn test_patch_gate_rejects_incomplete() {
        // Missing hunk header
        assert!(!looks_like_unified_diff_patch(
            "--- a/x\n+++ b/x\n-a\n+b\n"
        ));
        // Missing file headers
        assert!(!looks_like_unified_diff_patch("@@ -1 +1 @@\n-a\n+b\n"));
        // Headers only, no change lines
        assert!(!looks_like_unified_diff_patch(
            "--- a/x\n+++ b/x\n@@ -1 +1 @@\n context\n"
        ));
        assert!(!looks_like_unified_diff_patch(""));
    }

    #[test]
    fn test_safe_repo_join_accepts_inside() {
        let tmp = TempDir::new().unwrap();
        let joined = safe_repo_join(tmp.path(), "src/main.rs").unwrap();
        assert!(joined.starts_with(tmp.path().canonicalize().unwrap()));
        // ./ prefix is fine
        assert!(safe_repo_join(tmp.path(), "./src/main.rs").is_ok());
    }

    #[test]
    fn test_safe_repo_join_rejects_escapes() {
        let tmp = TempDir::new().unwrap();
        assert!(safe_repo_join(tmp.path(), "../outside").is_err());
        assert!(safe_repo_join(tmp.path(), "src/../../outside").is_err());
        assert!(safe_repo_join(tmp.path(), "/etc/passwd").is_err());
        assert!(safe_repo_join(tmp.path(), "").is_err());
    }

    #[test]
    fn test_parse_patch_paths_and_hunks() {
        let files = parse_patch(VALID_PATCH).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/db.js");
        assert_eq!(files[0].hunks.len(), 1);
        let hunk = &files[0].hunks[0];
        assert_eq!(hunk.old_start, 1);
        assert_eq!(hunk.lines.len(), 4);
        assert!(matches!(hunk.lines[1], HunkLine::Add(_)));
    }

    #[test]
    fn test_parse_patch_bare_hunk_header() {
        let patch = "--- a/x.txt\n+++ b/x.txt\n@@ @@\n context\n+added\n";
        let files = parse_patch(patch).unwrap();
        let hunk = &files[0].hunks[0];
        assert_eq!(hunk.old_start, 0);
        assert_eq!(hunk.lines.len(), 2);
    }

    #[test]
    fn test_parse_patch_no_headers_is_error() {
        assert!(parse_patch("+just a line\n").is_err());
    }

    #[test]
    fn test_repair_hunk_headers_rewrites_bare_header() {
        let file = "alpha\nbeta\ngamma\ndelta\n";
        let patch = "--- a/x.txt\n+++ b/x.txt\n@@ @@\n beta\n+inserted\n gamma\n";
        let repaired = repair_hunk_headers(patch, file).unwrap();
        assert!(repaired.contains("@@ -2,2 +2,3 @@"));
        assert!(repaired.contains("+inserted"));
    }

    #[test]
    fn test_repair_hunk_headers_with_removal() {
        let file = "alpha\nbeta\ngamma\n";
        let patch = "--- a/x.txt\n+++ b/x.txt\n@@ @@\n alpha\n-beta\n+BETA\n gamma\n";
        let repaired = repair_hunk_headers(patch, file).unwrap();
        assert!(repaired.contains("@@ -1,3 +1,3 @@"));
    }

    #[test]
    fn test_repair_hunk_headers_missing_context_fails() {
        let file = "alpha\nbeta\n";
        let patch = "--- a/x.txt\n+++ b/x.txt\n@@ @@\n nonexistent\n+inserted\n";
        assert!(repair_hunk_headers(patch, file).is_err());
    }

    #[test]
    fn test_repaired_patch_applies_with_git() {
        // End-to-end: bare headers, repaired, then accepted by git apply.
        let tmp = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let out = std::process::Command::new("git")
                .args(args)
                .current_dir(tmp.path())
                .output()
                .unwrap();
            assert!(
                out.status.success(),
                "git {args:?}: {}",
                String::from_utf8_lossy(&out.stderr)
            );
        };
        run(&["init", "-q"]);
        std::fs::write(tmp.path().join("x.txt"), "alpha\nbeta\ngamma\ndelta\n").unwrap();

        let patch = "--- a/x.txt\n+++ b/x.txt\n@@ @@\n beta\n+inserted\n gamma\n";
        let file = std::fs::read_to_string(tmp.path().join("x.txt")).unwrap();
        let repaired = repair_hunk_headers(patch, &file).unwrap();
        std::fs::write(tmp.path().join("fix.patch"), &repaired).unwrap();
        run(&["apply", "fix.patch"]);

        let result = std::fs::read_to_string(tmp.path().join("x.txt")).unwrap();
        assert_eq!(result, "alpha\nbeta\ninserted\ngamma\ndelta\n");
    }

    #[test]
    fn test_anchor_apply_inserts_before_after_context() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("y.txt"), "one\ntwo\nthree\n").unwrap();
        let patch = "--- a/y.txt\n+++ b/y.txt\n@@ -1,3 +1,4 @@\n one\n+one-and-a-half\n two\n three\n";
        apply_additions_by_anchor(tmp.path(), patch).unwrap();
        let result = std::fs::read_to_string(tmp.path().join("y.txt")).unwrap();
        assert_eq!(result, "one\none-and-a-half\ntwo\nthree\n");
    }

    #[test]
    fn test_anchor_apply_appends_after_last_before_context() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("y.txt"), "one\ntwo\n").unwrap();
        // No after-context: additions follow the last before-context line
        let patch = "--- a/y.txt\n+++ b/y.txt\n@@ -1,2 +1,3 @@\n one\n two\n+three\n";
        apply_additions_by_anchor(tmp.path(), patch).unwrap();
        let result = std::fs::read_to_string(tmp.path().join("y.txt")).unwrap();
        assert_eq!(result, "one\ntwo\nthree\n");
    }

    #[test]
    fn test_anchor_apply_rejects_deletions() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("y.txt"), "one\ntwo\n").unwrap();
        let patch = "--- a/y.txt\n+++ b/y.txt\n@@ -1,2 +1,1 @@\n one\n-two\n";
        let err = apply_additions_by_anchor(tmp.path(), patch).unwrap_err();
        assert!(err.to_string().contains("contains deletions"));
        // File untouched
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("y.txt")).unwrap(),
            "one\ntwo\n"
        );
    }

    #[test]
    fn test_anchor_apply_missing_anchor_fails() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("y.txt"), "one\ntwo\n").unwrap();
        let patch = "--- a/y.txt\n+++ b/y.txt\n@@ -1,1 +1,2 @@\n nonexistent\n+added\n";
        assert!(apply_additions_by_anchor(tmp.path(), patch).is_err());
    }

    #[test]
    fn test_anchor_apply_ignores_trailing_whitespace_in_match() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("y.txt"), "one   \ntwo\n").unwrap();
        let patch = "--- a/y.txt\n+++ b/y.txt\n@@ -1,2 +1,3 @@\n one\n+middle\n two\n";
        apply_additions_by_anchor(tmp.path(), patch).unwrap();
        let result = std::fs::read_to_string(tmp.path().join("y.txt")).unwrap();
        assert_eq!(result, "one   \nmiddle\ntwo\n");
    }

    #[test]
    fn test_anchor_apply_multiple_hunks_in_order() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("y.txt"), "a\nb\nc\nd\n").unwrap();
        let patch = concat!(
            "--- a/y.txt\n+++ b/y.txt\n",
            "@@ -1,2 +1,3 @@\n a\n+a2\n b\n",
            "@@ -3,2 +4,3 @@\n c\n+c2\n d\n",
        );
        apply_additions_by_anchor(tmp.path(), patch).unwrap();
        let result = std::fs::read_to_string(tmp.path().join("y.txt")).unwrap();
        assert_eq!(result, "a\na2\nb\nc\nc2\nd\n");
    }

    #[test]
    fn test_anchor_apply_path_escape_rejected() {
        let tmp = TempDir::new().unwrap();
        let patch = "--- a/../evil.txt\n+++ b/../evil.txt\n@@ -1,1 +1,2 @@\n x\n+y\n";
        let err = apply_additions_by_anchor(tmp.path(), patch).unwrap_err();
        assert!(err.to_string().contains("escapes repo root"));
    }
}
