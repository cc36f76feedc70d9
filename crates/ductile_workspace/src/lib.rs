//! Per-job workspace directories.
//!
//! Every job gets `base/<job_id>` to read and write artifacts in. A
//! branching pipeline clones its parent's workspace with hard links:
//! O(entries) in metadata, zero content copied. The orchestrator never
//! mutates already-linked files (plugins write new files), so two
//! branches stay independent for creates and deletes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Errors from workspace operations. All are non-retryable: either the
/// caller passed something invalid or the tree is in a state the
/// operator has to look at.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid job id: {0:?}")]
    InvalidJobId(String),

    #[error("workspace already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("workspace not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("unsupported file type in workspace: {}", .0.display())]
    UnsupportedFileType(PathBuf),

    #[error("cleanup age must be positive")]
    NonPositiveAge,

    #[error("workspace I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> WorkspaceError {
    let path = path.into();
    move |source| WorkspaceError::Io { path, source }
}

/// A per-job data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub job_id: String,
    pub dir: PathBuf,
}

/// Result of an age-based cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub deleted_dirs: Vec<PathBuf>,
}

/// Capability interface over the workspace tree.
pub trait WorkspaceStore: Send + Sync {
    /// Make `base/<job_id>`. Fails if the directory already exists.
    fn create(&self, job_id: &str) -> Result<Workspace, WorkspaceError>;

    /// Stat `base/<job_id>`. Fails if missing or not a directory.
    fn open(&self, job_id: &str) -> Result<Workspace, WorkspaceError>;

    /// Reconstruct `base/<src>` at `base/<dst>` with hard-linked files.
    fn clone_tree(&self, src: &str, dst: &str) -> Result<Workspace, WorkspaceError>;

    /// Remove top-level workspace dirs whose mtime is older than
    /// `now - older_than`.
    fn cleanup(&self, older_than: Duration) -> Result<CleanupReport, WorkspaceError>;
}

/// Filesystem-backed workspace manager.
pub struct FsWorkspaces {
    base: PathBuf,
}

impl FsWorkspaces {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn dir_for(&self, job_id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_job_id(job_id)?;
        Ok(self.base.join(job_id))
    }
}

impl WorkspaceStore for FsWorkspaces {
    fn create(&self, job_id: &str) -> Result<Workspace, WorkspaceError> {
        let dir = self.dir_for(job_id)?;
        fs::create_dir_all(&self.base).map_err(io_err(&self.base))?;
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(dir));
            }
            Err(e) => return Err(io_err(&dir)(e)),
        }
        debug!("Created workspace {}", dir.display());
        Ok(Workspace {
            job_id: job_id.to_string(),
            dir,
        })
    }

    fn open(&self, job_id: &str) -> Result<Workspace, WorkspaceError> {
        let dir = self.dir_for(job_id)?;
        let meta = match fs::metadata(&dir) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NotFound(dir));
            }
            Err(e) => return Err(io_err(&dir)(e)),
        };
        if !meta.is_dir() {
            return Err(WorkspaceError::NotADirectory(dir));
        }
        Ok(Workspace {
            job_id: job_id.to_string(),
            dir,
        })
    }

    fn clone_tree(&self, src: &str, dst: &str) -> Result<Workspace, WorkspaceError> {
        let src_dir = self.open(src)?.dir;
        let dst_dir = self.dir_for(dst)?;
        if dst_dir.exists() {
            return Err(WorkspaceError::AlreadyExists(dst_dir));
        }

        let result = clone_dir(&src_dir, &dst_dir);
        if let Err(e) = result {
            // Leave no partial clone behind.
            if let Err(cleanup_err) = fs::remove_dir_all(&dst_dir) {
                if cleanup_err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Failed to remove partial clone {}: {}",
                        dst_dir.display(),
                        cleanup_err
                    );
                }
            }
            return Err(e);
        }

        info!("Cloned workspace {} -> {}", src_dir.display(), dst_dir.display());
        Ok(Workspace {
            job_id: dst.to_string(),
            dir: dst_dir,
        })
    }

    fn cleanup(&self, older_than: Duration) -> Result<CleanupReport, WorkspaceError> {
        if older_than.is_zero() {
            return Err(WorkspaceError::NonPositiveAge);
        }
        let cutoff = SystemTime::now() - older_than;

        let mut report = CleanupReport::default();
        let entries = match fs::read_dir(&self.base) {
            Ok(entries) => entries,
            // No base dir yet means nothing to clean.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(io_err(&self.base)(e)),
        };

        for entry in entries {
            let entry = entry.map_err(io_err(&self.base))?;
            let path = entry.path();
            let meta = entry.metadata().map_err(io_err(&path))?;
            if !meta.is_dir() {
                continue;
            }
            let mtime = meta.modified().map_err(io_err(&path))?;
            if mtime < cutoff {
                fs::remove_dir_all(&path).map_err(io_err(&path))?;
                info!("Cleaned up stale workspace {}", path.display());
                report.deleted_dirs.push(path);
            }
        }
        Ok(report)
    }
}

/// Validate a job id for use as a single path component.
///
/// Non-empty after trim, not `.` or `..`, no path separator of either
/// flavor, and equal to its own cleaned form (a single normal component).
pub fn validate_job_id(job_id: &str) -> Result<(), WorkspaceError> {
    let invalid = || WorkspaceError::InvalidJobId(job_id.to_string());

    let trimmed = job_id.trim();
    if trimmed.is_empty() || trimmed != job_id {
        return Err(invalid());
    }
    if job_id == "." || job_id == ".." {
        return Err(invalid());
    }
    if job_id.contains('/') || job_id.contains('\\') {
        return Err(invalid());
    }
    let mut components = Path::new(job_id).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(c)), None) if c == job_id => Ok(()),
        _ => Err(invalid()),
    }
}

fn clone_dir(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            match e.into_io_error() {
                Some(source) => WorkspaceError::Io { path, source },
                None => WorkspaceError::NotFound(src.to_path_buf()),
            }
        })?;

        let rel = entry
            .path()
            .strip_prefix(src)
            .unwrap_or_else(|_| Path::new(""));
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir(&target).map_err(io_err(&target))?;
            let mode = entry.metadata().map_err(|e| WorkspaceError::Io {
                path: entry.path().to_path_buf(),
                source: e.into_io_error().unwrap_or_else(|| io::Error::other("metadata")),
            })?;
            fs::set_permissions(&target, mode.permissions()).map_err(io_err(&target))?;
        } else if file_type.is_file() {
            fs::hard_link(entry.path(), &target).map_err(io_err(&target))?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path()).map_err(io_err(entry.path()))?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link_target, &target).map_err(io_err(&target))?;
            #[cfg(not(unix))]
            return Err(WorkspaceError::UnsupportedFileType(entry.path().to_path_buf()));
        } else {
            return Err(WorkspaceError::UnsupportedFileType(entry.path().to_path_buf()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn manager() -> (tempfile::TempDir, FsWorkspaces) {
        let dir = tempfile::tempdir().unwrap();
        let manager = FsWorkspaces::new(dir.path().join("workspaces"));
        (dir, manager)
    }

    #[test]
    fn create_then_open_round_trips() {
        let (_dir, ws) = manager();
        let created = ws.create("job-a").unwrap();
        assert!(created.dir.is_dir());
        let opened = ws.open("job-a").unwrap();
        assert_eq!(created, opened);
    }

    #[test]
    fn create_twice_fails() {
        let (_dir, ws) = manager();
        ws.create("job-a").unwrap();
        assert!(matches!(
            ws.create("job-a"),
            Err(WorkspaceError::AlreadyExists(_))
        ));
    }

    #[test]
    fn open_missing_fails() {
        let (_dir, ws) = manager();
        assert!(matches!(ws.open("ghost"), Err(WorkspaceError::NotFound(_))));
    }

    #[test]
    fn job_id_validation() {
        for bad in ["", "  ", ".", "..", "a/b", "a\\b", " padded", "padded "] {
            assert!(validate_job_id(bad).is_err(), "should reject {:?}", bad);
        }
        for good in ["job-1", "550e8400-e29b-41d4-a716-446655440000", "a.b"] {
            assert!(validate_job_id(good).is_ok(), "should accept {:?}", good);
        }
    }

    #[test]
    fn clone_hard_links_files_and_isolates_branches() {
        let (_dir, ws) = manager();
        let src = ws.create("src").unwrap();
        fs::create_dir(src.dir.join("artifacts")).unwrap();
        fs::write(src.dir.join("artifacts/data.txt"), "hello").unwrap();

        let dst = ws.clone_tree("src", "dst").unwrap();
        let src_meta = fs::metadata(src.dir.join("artifacts/data.txt")).unwrap();
        let dst_meta = fs::metadata(dst.dir.join("artifacts/data.txt")).unwrap();
        assert_eq!(src_meta.ino(), dst_meta.ino());
        assert_eq!(
            fs::read_to_string(dst.dir.join("artifacts/data.txt")).unwrap(),
            "hello"
        );

        // Deleting in the clone leaves the source intact, and vice versa.
        fs::remove_file(dst.dir.join("artifacts/data.txt")).unwrap();
        assert!(src.dir.join("artifacts/data.txt").exists());

        fs::write(src.dir.join("artifacts/new.txt"), "branch").unwrap();
        assert!(!dst.dir.join("artifacts/new.txt").exists());
    }

    #[test]
    fn clone_preserves_symlinks_verbatim() {
        let (_dir, ws) = manager();
        let src = ws.create("src").unwrap();
        fs::write(src.dir.join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink("real.txt", src.dir.join("link.txt")).unwrap();

        let dst = ws.clone_tree("src", "dst").unwrap();
        let target = fs::read_link(dst.dir.join("link.txt")).unwrap();
        assert_eq!(target, PathBuf::from("real.txt"));
    }

    #[test]
    fn clone_requires_missing_destination_and_existing_source() {
        let (_dir, ws) = manager();
        ws.create("src").unwrap();
        ws.create("taken").unwrap();
        assert!(matches!(
            ws.clone_tree("src", "taken"),
            Err(WorkspaceError::AlreadyExists(_))
        ));
        assert!(matches!(
            ws.clone_tree("ghost", "dst"),
            Err(WorkspaceError::NotFound(_))
        ));
    }

    #[test]
    fn cleanup_removes_only_stale_dirs() {
        let (_dir, ws) = manager();
        let old = ws.create("old").unwrap();
        ws.create("fresh").unwrap();

        // Back-date the old workspace by 48 hours.
        let two_days_ago = SystemTime::now() - Duration::from_secs(48 * 3600);
        let times = fs::FileTimes::new()
            .set_accessed(two_days_ago)
            .set_modified(two_days_ago);
        fs::File::open(&old.dir).unwrap().set_times(times).unwrap();

        let report = ws.cleanup(Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(report.deleted_dirs, vec![old.dir.clone()]);
        assert!(!old.dir.exists());
        assert!(ws.open("fresh").is_ok());
    }

    #[test]
    fn cleanup_rejects_zero_age() {
        let (_dir, ws) = manager();
        assert!(matches!(
            ws.cleanup(Duration::ZERO),
            Err(WorkspaceError::NonPositiveAge)
        ));
    }
}
