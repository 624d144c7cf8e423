use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use crate::error::StorageError;
use crate::job::JobKind;

const DERIVATIVES_DIR: &str = "derivatives";
const STAGING_DIR: &str = ".staging";

/// Move a file from `src` to `dst`. Uses `rename` first (atomic on the same
/// filesystem). Across devices the bytes are copied to a sibling temp name
/// and renamed into place, so `dst` never exists half-written.
fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    let file_name = dst
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let partial = dst.with_file_name(format!(".{}.{}.partial", file_name, uuid::Uuid::new_v4()));

    let map_err = |e: std::io::Error| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    };

    std::fs::copy(src, &partial).map_err(map_err)?;
    if let Err(e) = std::fs::rename(&partial, dst) {
        let _ = std::fs::remove_file(&partial);
        return Err(map_err(e));
    }
    std::fs::remove_file(src).map_err(|e| StorageError::RemoveFile {
        path: src.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Rejects identifiers that could escape their directory when used as a
/// path component.
fn checked_component(value: &str) -> Result<&str, StorageError> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::InvalidComponent(value.to_string()));
    }
    Ok(value)
}

/// Resolves where derivative artifacts live.
///
/// Final artifacts: `<root>/derivatives/<kind>/<owner>/<fileId>.<ext>`.
/// Staging files: `<root>/derivatives/<kind>/<owner>/.staging/<jobId>.<ext>`.
/// Staging sits on the same filesystem as the final location so promotion
/// is a plain rename.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind_dir(&self, kind: JobKind) -> PathBuf {
        self.root.join(DERIVATIVES_DIR).join(kind.as_str())
    }

    fn owner_dir(&self, kind: JobKind, owner_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.kind_dir(kind).join(checked_component(owner_id)?))
    }

    /// Cache-visible location of the artifact for `(kind, owner, file)`.
    pub fn final_path(
        &self,
        kind: JobKind,
        owner_id: &str,
        subject_file_id: &str,
    ) -> Result<PathBuf, StorageError> {
        let file_name = format!(
            "{}.{}",
            checked_component(subject_file_id)?,
            kind.artifact_extension()
        );
        Ok(self.owner_dir(kind, owner_id)?.join(file_name))
    }

    pub fn staging_dir(&self, kind: JobKind, owner_id: &str) -> Result<PathBuf, StorageError> {
        Ok(self.owner_dir(kind, owner_id)?.join(STAGING_DIR))
    }

    /// Job-scoped temporary output path.
    pub fn staging_path(
        &self,
        kind: JobKind,
        owner_id: &str,
        job_id: &str,
    ) -> Result<PathBuf, StorageError> {
        let file_name = format!("{}.{}", checked_component(job_id)?, kind.artifact_extension());
        Ok(self.staging_dir(kind, owner_id)?.join(file_name))
    }

    /// Returns the final artifact path if a usable artifact is present.
    pub fn cached_artifact(
        &self,
        kind: JobKind,
        owner_id: &str,
        subject_file_id: &str,
    ) -> Option<PathBuf> {
        self.final_path(kind, owner_id, subject_file_id)
            .ok()
            .filter(|p| is_usable_artifact(p))
    }

    /// Moves a staged artifact into its final location, creating parent
    /// directories as needed. An existing artifact is replaced.
    pub fn promote(&self, staged: &Path, final_path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = final_path.parent() {
            ensure_directory(parent)?;
        }
        move_file(staged, final_path)?;
        log::debug!(
            "Promoted {} to {}",
            staged.display(),
            final_path.display()
        );
        Ok(())
    }

    /// Removes staging content for `kind` untouched for at least `max_age`.
    /// Newer entries may belong to a job another worker process is running.
    pub fn sweep_staging(&self, kind: JobKind, max_age: Duration) -> Result<usize, StorageError> {
        let kind_dir = self.kind_dir(kind);
        if !kind_dir.exists() {
            return Ok(0);
        }

        let staging_dirs: Vec<PathBuf> = WalkDir::new(&kind_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir() && e.file_name() == STAGING_DIR)
            .map(|e| e.into_path())
            .collect();

        let now = SystemTime::now();
        let mut removed = 0;
        for dir in staging_dirs {
            let entries = std::fs::read_dir(&dir).map_err(|e| StorageError::RemoveFile {
                path: dir.clone(),
                source: e,
            })?;
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let idle = last_modified(&path)
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or(Duration::ZERO);
                if idle < max_age {
                    continue;
                }
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                result.map_err(|e| StorageError::RemoveFile {
                    path: path.clone(),
                    source: e,
                })?;
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("Removed {} leftover staging entries for {}", removed, kind);
        }
        Ok(removed)
    }
}

/// Idempotent directory creation.
pub fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.is_dir() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// True when `path` is an existing, non-empty regular file.
pub fn is_usable_artifact(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Best-effort removal of a file or directory tree.
pub fn remove_quietly(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Most recent modification time of `path` or anything below it.
fn last_modified(path: &Path) -> Option<SystemTime> {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok()?.modified().ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_follow_layout() {
        let layout = StorageLayout::new("/srv/media");
        assert_eq!(
            layout.final_path(JobKind::Transcode, "u1", "f9").unwrap(),
            PathBuf::from("/srv/media/derivatives/transcode/u1/f9.mp4")
        );
        assert_eq!(
            layout
                .staging_path(JobKind::DocumentPreview, "u1", "job-1")
                .unwrap(),
            PathBuf::from("/srv/media/derivatives/document_preview/u1/.staging/job-1.pdf")
        );
    }

    #[test]
    fn test_rejects_escaping_components() {
        let layout = StorageLayout::new("/srv/media");
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", ".hidden"] {
            assert!(
                matches!(
                    layout.final_path(JobKind::Thumbnail, bad, "f1"),
                    Err(StorageError::InvalidComponent(_))
                ),
                "owner {:?} should be rejected",
                bad
            );
            assert!(layout.final_path(JobKind::Thumbnail, "u1", bad).is_err());
        }
    }

    #[test]
    fn test_ensure_directory_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("a/b/c");
        ensure_directory(&dir).unwrap();
        ensure_directory(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_usable_artifact_requires_non_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let empty = temp_dir.path().join("empty.png");
        let full = temp_dir.path().join("full.png");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"png").unwrap();

        assert!(!is_usable_artifact(&empty));
        assert!(is_usable_artifact(&full));
        assert!(!is_usable_artifact(temp_dir.path()));
        assert!(!is_usable_artifact(&temp_dir.path().join("missing.png")));
    }

    #[test]
    fn test_promote_moves_into_place() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());

        let staged = layout.staging_path(JobKind::Thumbnail, "u1", "j1").unwrap();
        ensure_directory(staged.parent().unwrap()).unwrap();
        std::fs::write(&staged, b"thumb").unwrap();

        let final_path = layout.final_path(JobKind::Thumbnail, "u1", "f1").unwrap();
        assert!(layout.cached_artifact(JobKind::Thumbnail, "u1", "f1").is_none());

        layout.promote(&staged, &final_path).unwrap();
        assert!(!staged.exists());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"thumb");
        assert_eq!(
            layout.cached_artifact(JobKind::Thumbnail, "u1", "f1"),
            Some(final_path)
        );
    }

    #[test]
    fn test_promote_replaces_existing_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let final_path = layout.final_path(JobKind::Transcode, "u1", "f1").unwrap();
        ensure_directory(final_path.parent().unwrap()).unwrap();
        std::fs::write(&final_path, b"old").unwrap();

        let staged = temp_dir.path().join("new.mp4");
        std::fs::write(&staged, b"new").unwrap();
        layout.promote(&staged, &final_path).unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"new");
    }

    #[test]
    fn test_promote_missing_source_errors() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());
        let result = layout.promote(
            &temp_dir.path().join("nope.mp4"),
            &temp_dir.path().join("out/final.mp4"),
        );
        match result {
            Err(StorageError::MoveFile { from, .. }) => {
                assert!(from.to_string_lossy().contains("nope.mp4"));
            }
            other => panic!("Expected MoveFile error, got {:?}", other),
        }
    }

    #[test]
    fn test_sweep_staging_removes_leftovers_only() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());

        let staged = layout.staging_path(JobKind::DocumentPreview, "u1", "j1").unwrap();
        let staging_dir = staged.parent().unwrap().to_path_buf();
        ensure_directory(&staging_dir.join("j1.d")).unwrap();
        std::fs::write(&staged, b"partial").unwrap();
        std::fs::write(staging_dir.join("j1.d/report.pdf"), b"partial").unwrap();

        let final_path = layout.final_path(JobKind::DocumentPreview, "u1", "f1").unwrap();
        std::fs::write(&final_path, b"done").unwrap();

        assert_eq!(layout.sweep_staging(JobKind::DocumentPreview, Duration::ZERO).unwrap(), 2);
        assert!(!staged.exists());
        assert!(final_path.exists());
        assert_eq!(layout.sweep_staging(JobKind::DocumentPreview, Duration::ZERO).unwrap(), 0);
        assert_eq!(layout.sweep_staging(JobKind::Transcode, Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_sweep_staging_keeps_recent_entries() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(temp_dir.path());

        let abandoned = layout.staging_path(JobKind::Transcode, "u1", "old").unwrap();
        let in_flight = layout.staging_path(JobKind::Transcode, "u1", "new").unwrap();
        ensure_directory(abandoned.parent().unwrap()).unwrap();
        std::fs::write(&abandoned, b"partial").unwrap();
        std::fs::write(&in_flight, b"partial").unwrap();

        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&abandoned)
            .unwrap()
            .set_modified(two_hours_ago)
            .unwrap();

        let removed = layout
            .sweep_staging(JobKind::Transcode, Duration::from_secs(60 * 60))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!abandoned.exists());
        assert!(in_flight.exists());
    }
}
