//! Helpers for sanitizing data before it enters tracing span attributes or
//! persisted error messages.
//!
//! Source paths belong to users; spans and job rows only carry file names.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Returns a short deterministic hash of a path for correlation without
/// exposing the actual path.
pub fn hash_path(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    let hash = hasher.finish();
    format!("{:016x}", hash)
}

/// Replaces every occurrence of the directory part of `path` in `text` with
/// `…/`, keeping the file name. Used on subprocess stderr before it is stored.
pub fn scrub_directory(text: &str, path: &Path) -> String {
    match path.parent().and_then(|p| p.to_str()) {
        Some(dir) if !dir.is_empty() && dir != "/" => {
            text.replace(&format!("{}/", dir), "…/")
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(Path::new("/home/user/Videos/holiday.mov")),
            "holiday.mov"
        );
    }

    #[test]
    fn test_redact_path_no_filename() {
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
    }

    #[test]
    fn test_hash_path_deterministic() {
        let path = PathBuf::from("/home/user/doc.pdf");
        let h1 = hash_path(&path);
        let h2 = hash_path(&path);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn test_hash_path_different_paths_differ() {
        let h1 = hash_path(Path::new("/a/b"));
        let h2 = hash_path(Path::new("/c/d"));
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_scrub_directory() {
        let path = Path::new("/srv/files/u1/clip.mov");
        assert_eq!(
            scrub_directory("/srv/files/u1/clip.mov: Invalid data found", path),
            "…/clip.mov: Invalid data found"
        );
        assert_eq!(scrub_directory("no paths here", path), "no paths here");
        assert_eq!(scrub_directory("x", Path::new("clip.mov")), "x");
    }
}
