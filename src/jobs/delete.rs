use std::sync::Arc;

use crate::jobs::{
    compute_totals, flush_distinct_archives, retry_loop, Attempt, ErrorReporter, JobControl,
    JobProgress, JobReport, RunningJob,
};
use crate::vfs::{FileHandle, HandleRef, VfsError};

/// Recursive delete of a set of handles.
///
/// Depth-first: children go before their directory, symlinks are removed as
/// links, and a failed child leaves its siblings deleted but keeps the
/// parent directory. Terminal failures go through the error reporter with
/// the usual retry/skip/cancel choice.
pub struct DeleteJob {
    targets: Vec<HandleRef>,
    errors: Box<dyn ErrorReporter>,
    control: Arc<JobControl>,
    progress: Arc<JobProgress>,
}

impl DeleteJob {
    pub fn new(targets: Vec<HandleRef>, errors: Box<dyn ErrorReporter>) -> Self {
        Self {
            targets,
            errors,
            control: Arc::new(JobControl::new()),
            progress: Arc::new(JobProgress::new()),
        }
    }

    pub fn control(&self) -> &Arc<JobControl> {
        &self.control
    }

    pub fn progress(&self) -> &Arc<JobProgress> {
        &self.progress
    }

    pub fn spawn(self) -> RunningJob {
        let control = Arc::clone(&self.control);
        let progress = Arc::clone(&self.progress);
        let thread = std::thread::spawn(move || self.run());
        RunningJob::new(control, progress, thread)
    }

    pub fn run(self) -> JobReport {
        self.control.mark_running();
        self.progress.set_status("Preparing...".to_string());

        let refs: Vec<&dyn FileHandle> = self.targets.iter().map(|t| t.as_ref()).collect();
        match compute_totals(&refs, &self.control) {
            Ok((_, files)) => self.progress.set_totals(0, files),
            Err(VfsError::Interrupted) => return JobReport::default(),
            Err(_) => {}
        }

        let mut report = JobReport::default();
        for target in &self.targets {
            if !self.control.checkpoint() {
                break;
            }
            if self.delete_handle(target.as_ref()) {
                report.success_count += 1;
            } else {
                report.failure_count += 1;
                self.progress
                    .record_failure(target.url().normalized(), "delete failed".to_string());
            }
        }

        if !self.control.is_interrupted() {
            flush_distinct_archives(
                self.targets.iter().filter_map(|t| t.parent_archive()),
                &self.progress,
            );
        }

        self.progress.set_status("Done".to_string());
        self.control.mark_finished();
        report
    }

    fn delete_handle(&self, file: &dyn FileHandle) -> bool {
        if !self.control.checkpoint() {
            return false;
        }
        self.progress.set_status(format!("Deleting {}", file.name()));

        // Symlinks are removed as links; directories need their children
        // gone first.
        if file.is_directory() && !file.is_symlink() {
            let children = match retry_loop(
                &self.control,
                self.errors.as_ref(),
                "Cannot read folder",
                || file.list(),
            ) {
                Attempt::Done(children) => children,
                Attempt::Skipped | Attempt::Aborted => return false,
            };

            let mut all_ok = true;
            for child in &children {
                if !self.control.checkpoint() {
                    return false;
                }
                if !self.delete_handle(child.as_ref()) {
                    all_ok = false;
                }
            }
            if !all_ok {
                // Leave the directory in place with its surviving entries.
                return false;
            }
            if !self.control.checkpoint() {
                return false;
            }
        }

        let is_dir = file.is_directory() && !file.is_symlink();
        let done = matches!(
            retry_loop(
                &self.control,
                self.errors.as_ref(),
                "Cannot delete",
                || file.delete(),
            ),
            Attempt::Done(())
        );
        if done && !is_dir {
            // Totals count leaf entries; directories are structure.
            self.progress.file_done();
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{AlwaysError, ErrorAction};
    use crate::vfs::local::LocalHandle;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_temp_dir() -> PathBuf {
        let unique_id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir().join(format!(
            "openvfs_delete_test_{}_{}",
            std::process::id(),
            unique_id
        ));
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).expect("Failed to create temp dir");
        temp_dir
    }

    fn handle(path: &Path) -> HandleRef {
        Box::new(LocalHandle::new(path))
    }

    #[test]
    fn test_delete_tree() {
        let temp_dir = create_temp_dir();
        let tree = temp_dir.join("tree");
        fs::create_dir_all(tree.join("sub")).unwrap();
        fs::write(tree.join("a.txt"), b"a").unwrap();
        fs::write(tree.join("sub/b.txt"), b"b").unwrap();

        let job = DeleteJob::new(
            vec![handle(&tree)],
            Box::new(AlwaysError(ErrorAction::Cancel)),
        );
        let progress = Arc::clone(job.progress());
        let report = job.run();

        assert_eq!(report.success_count, 1);
        assert!(!tree.exists());
        assert_eq!(progress.total_files_processed(), 2);

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_delete_symlink_keeps_target() {
        let temp_dir = create_temp_dir();
        fs::write(temp_dir.join("target"), b"t").unwrap();
        std::os::unix::fs::symlink(temp_dir.join("target"), temp_dir.join("link")).unwrap();

        let job = DeleteJob::new(
            vec![handle(&temp_dir.join("link"))],
            Box::new(AlwaysError(ErrorAction::Cancel)),
        );
        let report = job.run();

        assert_eq!(report.success_count, 1);
        assert!(!temp_dir.join("link").exists());
        assert!(temp_dir.join("target").exists());

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_delete_inside_archive_flushes() {
        let temp_dir = create_temp_dir();
        let zip_path = temp_dir.join("a.zip");
        let container = crate::archive::zip::ZipContainer::create(&zip_path);
        {
            use std::io::Write as _;
            let mut w = container.stage_put("keep.txt").unwrap();
            w.write_all(b"k").unwrap();
            let mut w = container.stage_put("drop.txt").unwrap();
            w.write_all(b"d").unwrap();
        }
        container.flush().unwrap();

        let entry: HandleRef = Box::new(crate::archive::ArchiveEntryHandle::new(
            crate::archive::open_container(&zip_path).unwrap(),
            "drop.txt",
        ));
        let job = DeleteJob::new(vec![entry], Box::new(AlwaysError(ErrorAction::Cancel)));
        let report = job.run();

        assert_eq!(report.success_count, 1);
        let reopened = crate::archive::open_container(&zip_path).unwrap();
        let names: Vec<String> = reopened
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["keep.txt"]);

        let _ = fs::remove_dir_all(&temp_dir);
    }
}
