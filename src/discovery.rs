//! File discovery for the `list` request
//!
//! Resolves a glob pattern against a base directory and returns the matching
//! regular files. The tail core does not validate that a listed (or any
//! other) path belongs to an allowed root; confinement is the deployer's
//! concern.

use glob::Pattern;
use std::path::Path;
use tracing::trace;

/// Pattern used when a `list` request omits one.
pub const DEFAULT_PATTERN: &str = "**/*";

/// Ignore globs applied relative to the search base.
pub const DEFAULT_IGNORES: &[&str] = &["node_modules/**", ".git/**"];

/// List regular files under `base` matching `pattern`, skipping `ignores`.
/// Results are sorted for stable output.
pub fn find_files(
    base: &Path,
    pattern: &str,
    ignores: &[String],
) -> Result<Vec<String>, glob::PatternError> {
    let search = base.join(pattern);
    let search = search.to_string_lossy();

    let ignore_patterns: Vec<Pattern> = ignores
        .iter()
        .filter_map(|raw| match Pattern::new(raw) {
            Ok(p) => Some(p),
            Err(e) => {
                trace!(pattern = %raw, error = %e, "skipping invalid ignore pattern");
                None
            }
        })
        .collect();

    let mut files = Vec::new();
    for entry in glob::glob(&search)? {
        // Unreadable entries are skipped, not fatal.
        let Ok(path) = entry else { continue };
        if !path.is_file() {
            continue;
        }
        let relative = path.strip_prefix(base).unwrap_or(&path);
        if ignore_patterns.iter().any(|p| p.matches_path(relative)) {
            continue;
        }
        files.push(path.to_string_lossy().into_owned());
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(base: &Path, rel: &str) {
        let path = base.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x\n").unwrap();
    }

    fn default_ignores() -> Vec<String> {
        DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lists_matching_files_recursively() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "app.log");
        touch(tmp.path(), "nested/deep/worker.log");
        touch(tmp.path(), "notes.txt");

        let files = find_files(tmp.path(), "**/*.log", &default_ignores()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("app.log"));
        assert!(files[1].ends_with("worker.log"));
    }

    #[test]
    fn directories_are_excluded() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "dir.log/inner.log");

        let files = find_files(tmp.path(), "*", &default_ignores()).unwrap();
        assert!(files.is_empty(), "files: {files:?}");
    }

    #[test]
    fn ignore_globs_are_applied() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "keep.log");
        touch(tmp.path(), "node_modules/dep/index.js");
        touch(tmp.path(), ".git/HEAD");

        let files = find_files(tmp.path(), "**/*", &default_ignores()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("keep.log"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(find_files(tmp.path(), "[", &[]).is_err());
    }

    #[test]
    fn empty_match_is_empty_not_error() {
        let tmp = TempDir::new().unwrap();
        let files = find_files(tmp.path(), "*.log", &[]).unwrap();
        assert!(files.is_empty());
    }
}
