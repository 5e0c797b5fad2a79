//! Glob Tool
//!
//! File pattern matching with brace expansion, character classes, and
//! `**` directory spanning. The matching helpers are plain functions
//! so other tools (grep's file filter) reuse them.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{ParamKind, ParameterSchema, Tool, ToolContext, ToolOutput};

// ---------------------------------------------------------------------------
// Brace expansion
// ---------------------------------------------------------------------------

/// Expand brace alternatives: `{a,b{c,d}}.txt` → `a.txt`, `bc.txt`,
/// `bd.txt`. Unbalanced braces are left as-is.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let bytes = pattern.as_bytes();

    let Some(open) = bytes.iter().position(|&b| b == b'{') else {
        return vec![pattern.to_string()];
    };

    // Matching close brace, respecting nesting.
    let mut depth = 0;
    let mut close = None;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let inner = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    // Split alternatives at top-level commas.
    let mut alternatives = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, b) in inner.bytes().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => depth -= 1,
            b',' if depth == 0 => {
                alternatives.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    alternatives.push(&inner[start..]);

    let mut results = Vec::new();
    for alt in alternatives {
        results.extend(expand_braces(&format!("{prefix}{alt}{suffix}")));
    }
    results
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Match one path segment (no separators) against a pattern segment.
/// Supports `*`, `?`, and `[abc]` / `[!abc]` / `[a-z]` classes.
pub fn match_segment(pattern: &str, s: &str) -> bool {
    match_segment_at(pattern.as_bytes(), 0, s.as_bytes(), 0)
}

fn match_segment_at(pat: &[u8], mut pi: usize, s: &[u8], mut si: usize) -> bool {
    while pi < pat.len() && si < s.len() {
        match pat[pi] {
            b'*' => {
                pi += 1;
                for k in si..=s.len() {
                    if match_segment_at(pat, pi, s, k) {
                        return true;
                    }
                }
                return false;
            }
            b'?' => {
                pi += 1;
                si += 1;
            }
            b'[' => {
                pi += 1;
                let mut negated = false;
                if pi < pat.len() && (pat[pi] == b'!' || pat[pi] == b'^') {
                    negated = true;
                    pi += 1;
                }
                let mut found = false;
                while pi < pat.len() && pat[pi] != b']' {
                    if pi + 2 < pat.len() && pat[pi + 1] == b'-' && pat[pi + 2] != b']' {
                        if s[si] >= pat[pi] && s[si] <= pat[pi + 2] {
                            found = true;
                        }
                        pi += 3;
                    } else {
                        if pat[pi] == s[si] {
                            found = true;
                        }
                        pi += 1;
                    }
                }
                if pi < pat.len() {
                    pi += 1; // skip ']'
                }
                if found == negated {
                    return false;
                }
                si += 1;
            }
            c => {
                if c != s[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    // Trailing '*'s match the empty tail.
    while pi < pat.len() && pat[pi] == b'*' {
        pi += 1;
    }
    pi == pat.len() && si == s.len()
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Match a relative path against a glob pattern, where `**` spans any
/// number of directories (including zero).
pub fn glob_match(pattern: &str, rel_path: &str) -> bool {
    let pat_segs = split_path(pattern);
    let path_segs = split_path(rel_path);
    match_path_at(&pat_segs, 0, &path_segs, 0)
}

fn match_path_at(pat: &[&str], mut pi: usize, path: &[&str], mut si: usize) -> bool {
    while pi < pat.len() && si < path.len() {
        if pat[pi] == "**" {
            pi += 1;
            if pi == pat.len() {
                return true;
            }
            for k in si..=path.len() {
                if match_path_at(pat, pi, path, k) {
                    return true;
                }
            }
            return false;
        }
        if !match_segment(pat[pi], path[si]) {
            return false;
        }
        pi += 1;
        si += 1;
    }

    while pi < pat.len() && pat[pi] == "**" {
        pi += 1;
    }
    pi == pat.len() && si == path.len()
}

// ---------------------------------------------------------------------------
// Directory walking
// ---------------------------------------------------------------------------

/// All regular files below `base`, as paths relative to it. Hidden
/// directories (dot-prefixed) are skipped.
pub(crate) fn walk_files(base: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![base.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if !name.to_string_lossy().starts_with('.') {
                    stack.push(path);
                }
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(base) {
                    files.push(rel.to_path_buf());
                }
            }
        }
    }

    files
}

// ---------------------------------------------------------------------------
// Tool
// ---------------------------------------------------------------------------

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn id(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Fast file pattern matching tool. Supports glob patterns like \"**/*.rs\" and brace sets like \"*.{rs,toml}\"."
    }

    fn parameters(&self) -> Vec<ParameterSchema> {
        vec![
            ParameterSchema::required(
                "pattern",
                ParamKind::String,
                "The glob pattern to match files against",
            ),
            ParameterSchema::optional("path", ParamKind::String, "The directory to search in"),
        ]
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> Result<ToolOutput> {
        let pattern = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if pattern.is_empty() {
            return Ok(ToolOutput::error("pattern is required"));
        }

        let base = match args.get("path").and_then(|v| v.as_str()) {
            Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
            Some(p) => ctx.working_dir.join(p),
            None => ctx.working_dir.clone(),
        };
        if !base.exists() {
            return Ok(ToolOutput::error(format!(
                "Path not found: {}",
                base.display()
            )));
        }

        let patterns = expand_braces(&pattern);

        // Walking the tree is blocking work.
        let matches = tokio::task::spawn_blocking(move || {
            let mut matches: Vec<String> = Vec::new();
            for rel in walk_files(&base) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                let file_name = rel
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                for pat in &patterns {
                    let hit = if pat.contains('/') {
                        glob_match(pat, &rel_str)
                    } else {
                        match_segment(pat, &file_name)
                    };
                    if hit {
                        matches.push(rel_str.clone());
                        break;
                    }
                }
            }
            matches.sort();
            matches
        })
        .await?;

        if matches.is_empty() {
            return Ok(ToolOutput::success(format!(
                "No files found matching pattern: {pattern}"
            )));
        }

        let count = matches.len();
        Ok(ToolOutput::with_title(
            matches.join("\n"),
            format!("Found {count} files"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
