use std::sync::Arc;

use crate::archive::{ArchiveContainer, ArchiveEntryHandle};
use crate::jobs::transfer::{TransferJob, TransferOptions};
use crate::jobs::{JobControl, JobProgress, JobReport, RunningJob};
use crate::vfs::{HandleRef, VfsResult};

/// Extracts a container (or one directory entry inside it) into a
/// destination folder.
///
/// Runs the generic copy engine over archive-entry handles, so collision
/// policy, retry dialogs, cancellation and progress all behave exactly like
/// a folder copy.
pub struct UnpackJob {
    inner: TransferJob,
}

impl UnpackJob {
    /// Unpacks the container's top-level entries into `dest_folder`.
    pub fn new(
        container: Arc<dyn ArchiveContainer>,
        dest_folder: HandleRef,
        options: TransferOptions,
    ) -> VfsResult<Self> {
        Self::for_entry(container, "", dest_folder, options)
    }

    /// Unpacks the entries under `entry_path` (empty for the whole
    /// container) into `dest_folder`.
    pub fn for_entry(
        container: Arc<dyn ArchiveContainer>,
        entry_path: &str,
        dest_folder: HandleRef,
        options: TransferOptions,
    ) -> VfsResult<Self> {
        use crate::vfs::FileHandle;
        let root = ArchiveEntryHandle::new(container, entry_path);
        let sources = root.list()?;
        Ok(Self {
            inner: TransferJob::copy(sources, dest_folder, options),
        })
    }

    pub fn control(&self) -> &Arc<JobControl> {
        self.inner.control()
    }

    pub fn progress(&self) -> &Arc<JobProgress> {
        self.inner.progress()
    }

    pub fn run(self) -> JobReport {
        self.inner.run()
    }

    pub fn spawn(self) -> RunningJob {
        self.inner.spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::zip::ZipContainer;
    use crate::jobs::{AlwaysError, ErrorAction};
    use crate::vfs::local::LocalHandle;
    use std::fs;
    use std::io::Write as _;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_temp_dir() -> PathBuf {
        let unique_id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir().join(format!(
            "openvfs_unpack_test_{}_{}",
            std::process::id(),
            unique_id
        ));
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).expect("Failed to create temp dir");
        temp_dir
    }

    fn build_zip(path: &Path) -> Arc<ZipContainer> {
        let container = ZipContainer::create(path);
        let mut w = container.stage_put("top.txt").unwrap();
        w.write_all(b"top level").unwrap();
        drop(w);
        let mut w = container.stage_put("docs/nested.txt").unwrap();
        w.write_all(b"nested").unwrap();
        drop(w);
        container.flush().unwrap();
        container
    }

    fn options() -> TransferOptions {
        TransferOptions {
            errors: Box::new(AlwaysError(ErrorAction::Cancel)),
            ..TransferOptions::default()
        }
    }

    #[test]
    fn test_unpack_whole_container() {
        let temp_dir = create_temp_dir();
        let container = build_zip(&temp_dir.join("a.zip"));
        let dest = temp_dir.join("out");
        fs::create_dir(&dest).unwrap();

        let job = UnpackJob::new(
            container,
            Box::new(LocalHandle::new(&dest)),
            options(),
        )
        .unwrap();
        let report = job.run();

        assert_eq!(report.failure_count, 0);
        assert_eq!(fs::read(dest.join("top.txt")).unwrap(), b"top level");
        assert_eq!(fs::read(dest.join("docs/nested.txt")).unwrap(), b"nested");

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_unpack_single_entry_subtree() {
        let temp_dir = create_temp_dir();
        let container = build_zip(&temp_dir.join("a.zip"));
        let dest = temp_dir.join("out");
        fs::create_dir(&dest).unwrap();

        let job = UnpackJob::for_entry(
            container,
            "docs",
            Box::new(LocalHandle::new(&dest)),
            options(),
        )
        .unwrap();
        let report = job.run();

        assert_eq!(report.success_count, 1);
        assert_eq!(fs::read(dest.join("nested.txt")).unwrap(), b"nested");
        assert!(!dest.join("top.txt").exists());

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_unpack_spawned_reports_progress() {
        let temp_dir = create_temp_dir();
        let container = build_zip(&temp_dir.join("a.zip"));
        let dest = temp_dir.join("out");
        fs::create_dir(&dest).unwrap();

        let job = UnpackJob::new(
            container,
            Box::new(LocalHandle::new(&dest)),
            options(),
        )
        .unwrap();
        let running = job.spawn();
        let report = running.join();

        assert_eq!(report.failure_count, 0);
        assert!(dest.join("top.txt").exists());

        let _ = fs::remove_dir_all(&temp_dir);
    }
}
