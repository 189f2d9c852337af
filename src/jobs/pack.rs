use std::path::Path;
use std::sync::Arc;

use crate::archive::zip::ZipContainer;
use crate::archive::{ArchiveContainer, ArchiveEntryHandle};
use crate::jobs::transfer::{TransferJob, TransferOptions};
use crate::jobs::{JobControl, JobProgress, JobReport, RunningJob};
use crate::vfs::{HandleRef, VfsError, VfsResult};

/// Streams source trees into a zip container.
///
/// Entries are staged while the copy engine walks the sources; the engine's
/// completion hook then commits them with a single atomic flush. Packing
/// into an existing container adds to it.
pub struct PackJob {
    inner: TransferJob,
}

impl PackJob {
    pub fn new(
        sources: Vec<HandleRef>,
        archive_path: &Path,
        options: TransferOptions,
    ) -> VfsResult<Self> {
        let name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !(name.ends_with(".zip") || name.ends_with(".jar")) {
            return Err(VfsError::Archive(format!(
                "cannot write archive format: {}",
                archive_path.display()
            )));
        }

        let container: Arc<dyn ArchiveContainer> = if archive_path.exists() {
            ZipContainer::open(archive_path)?
        } else {
            ZipContainer::create(archive_path)
        };
        let dest: HandleRef = Box::new(ArchiveEntryHandle::root(container));

        Ok(Self {
            inner: TransferJob::copy(sources, dest, options),
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
