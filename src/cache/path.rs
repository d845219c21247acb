//! Mapping of request paths onto the cache directory.
//!
//! Normalization is purely lexical: the file system is never consulted, so
//! symlinks inside the cache root are not resolved.

use std::path::{Path, PathBuf};

/// Normalize `path` into an absolute, traversal-free form.
///
/// A leading `/` is enforced, empty and `.` segments are dropped, and `..`
/// removes the previous segment (or nothing, at the root).
pub fn clean(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Resolve a request path to its location under `root`.
pub fn resolve(root: &Path, request_path: &str) -> PathBuf {
    let cleaned = clean(request_path);
    let mut resolved = root.to_path_buf();
    resolved.extend(cleaned.split('/').filter(|s| !s.is_empty()));
    resolved
}
