use std::cell::Cell;
use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::debug;

use crate::jobs::{
    compute_totals, retry_loop, Attempt, CollisionAction, CollisionPolicy, ErrorReporter,
    JobControl, JobProgress, JobReport, RunningJob,
};
use crate::vfs::{CopyHint, FileHandle, HandleRef, VfsError, VfsResult, WriteMode};

/// Whether the source is left in place or removed after a successful copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Copy,
    Move,
}

/// Knobs shared by the transfer-engine jobs.
pub struct TransferOptions {
    /// Destination name for a single top-level source (rename); children
    /// always keep their own names.
    pub new_name: Option<String>,
    pub collision: CollisionPolicy,
    pub errors: Box<dyn ErrorReporter>,
    /// Stream copy chunk size in bytes.
    pub buffer_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            new_name: None,
            collision: CollisionPolicy::Always(CollisionAction::Skip),
            errors: Box::new(crate::jobs::AlwaysError(crate::jobs::ErrorAction::Skip)),
            buffer_size: 64 * 1024,
        }
    }
}

/// Recursive copy/move of a set of source handles into a destination folder.
///
/// One worker thread walks each source tree depth-first. Per node: symlinks
/// are terminal (recreated or deleted, never followed), collisions go
/// through the configured policy, a native move is attempted when the source
/// handle advertises one, directories recurse with per-child failure
/// isolation, and regular files fall back to a checkpointed stream copy.
/// Every terminal I/O failure is offered to the error reporter as
/// retry/skip/cancel; nothing below this layer retries on its own.
///
/// On completion, each distinct writable archive touched by the sources or
/// the destination is flushed exactly once.
pub struct TransferJob {
    mode: TransferMode,
    sources: Vec<HandleRef>,
    dest_folder: HandleRef,
    options: TransferOptions,
    control: Arc<JobControl>,
    progress: Arc<JobProgress>,
    /// Collision answer promoted by an apply-to-all reply.
    sticky_collision: Cell<Option<CollisionAction>>,
}

impl TransferJob {
    pub fn copy(sources: Vec<HandleRef>, dest_folder: HandleRef, options: TransferOptions) -> Self {
        Self::new(TransferMode::Copy, sources, dest_folder, options)
    }

    pub fn moving(
        sources: Vec<HandleRef>,
        dest_folder: HandleRef,
        options: TransferOptions,
    ) -> Self {
        Self::new(TransferMode::Move, sources, dest_folder, options)
    }

    fn new(
        mode: TransferMode,
        sources: Vec<HandleRef>,
        dest_folder: HandleRef,
        options: TransferOptions,
    ) -> Self {
        Self {
            mode,
            sources,
            dest_folder,
            options,
            control: Arc::new(JobControl::new()),
            progress: Arc::new(JobProgress::new()),
            sticky_collision: Cell::new(None),
        }
    }

    pub fn control(&self) -> &Arc<JobControl> {
        &self.control
    }

    pub fn progress(&self) -> &Arc<JobProgress> {
        &self.progress
    }

    /// Moves the job to a dedicated worker thread.
    pub fn spawn(self) -> RunningJob {
        let control = Arc::clone(&self.control);
        let progress = Arc::clone(&self.progress);
        let thread = std::thread::spawn(move || self.run());
        RunningJob::new(control, progress, thread)
    }

    /// Runs the whole job on the current thread and returns the report.
    pub fn run(self) -> JobReport {
        self.control.mark_running();
        self.progress.set_status("Preparing...".to_string());

        // Size pre-pass so percentage accounting has a denominator. Failure
        // here only costs accuracy, not the job.
        let refs: Vec<&dyn FileHandle> = self.sources.iter().map(|s| s.as_ref()).collect();
        match compute_totals(&refs, &self.control) {
            Ok((bytes, files)) => self.progress.set_totals(bytes, files),
            Err(VfsError::Interrupted) => return JobReport::default(),
            Err(err) => debug!(error = %err, "size pre-pass failed, progress will be approximate"),
        }

        let mut report = JobReport::default();
        for source in &self.sources {
            if !self.control.checkpoint() {
                break;
            }
            if self.process_handle(source.as_ref(), self.dest_folder.as_ref(), true) {
                report.success_count += 1;
            } else {
                report.failure_count += 1;
                self.progress.record_failure(
                    source.url().normalized(),
                    match self.mode {
                        TransferMode::Copy => "copy failed".to_string(),
                        TransferMode::Move => "move failed".to_string(),
                    },
                );
            }
        }

        if !self.control.is_interrupted() {
            self.flush_touched_archives();
        }

        self.progress.set_status("Done".to_string());
        self.control.mark_finished();
        report
    }

    /// Recursive per-node step. Returns `true` only when this node (and,
    /// for directories, every node beneath it) completed.
    fn process_handle(
        &self,
        file: &dyn FileHandle,
        dest_folder: &dyn FileHandle,
        top: bool,
    ) -> bool {
        if !self.control.checkpoint() {
            return false;
        }

        let verb = match self.mode {
            TransferMode::Copy => "Copying",
            TransferMode::Move => "Moving",
        };
        let name = file.name();
        self.progress.set_status(format!("{} {}", verb, name));

        let dest_name = match (&self.options.new_name, top) {
            (Some(new_name), true) => new_name.clone(),
            _ => name.clone(),
        };

        let dest = match retry_loop(
            &self.control,
            self.options.errors.as_ref(),
            "Cannot resolve destination",
            || dest_folder.resolve_child(&dest_name),
        ) {
            Attempt::Done(dest) => dest,
            Attempt::Skipped | Attempt::Aborted => return false,
        };

        // Symlinks are atomic units: recreate the link (copy) or drop it
        // (move), never descend into the target.
        if file.is_symlink() {
            return self.process_symlink(file, dest.as_ref());
        }

        let mut append = false;
        if dest.exists() {
            match self.resolve_collision(file, dest.as_ref()) {
                CollisionOutcome::Proceed => {}
                CollisionOutcome::ProceedAppend => append = true,
                CollisionOutcome::SkipFile => {
                    if !file.is_directory() {
                        self.progress.count_bytes_skipped(file.size());
                    }
                    return false;
                }
                CollisionOutcome::Abort => {
                    self.control.interrupt();
                    return false;
                }
            }
        }

        // Native move fast path; not applicable when appending.
        if self.mode == TransferMode::Move && !append {
            match self.try_native(file, dest.as_ref(), NativeOp::Move) {
                NativeResult::Done => return true,
                NativeResult::Failed => return false,
                NativeResult::NotApplicable => {}
            }
        }

        if file.is_directory() {
            self.process_directory(file, dest.as_ref())
        } else {
            self.process_regular_file(file, dest.as_ref(), append)
        }
    }

    fn process_symlink(&self, file: &dyn FileHandle, dest: &dyn FileHandle) -> bool {
        let done = match self.mode {
            TransferMode::Move => matches!(
                retry_loop(
                    &self.control,
                    self.options.errors.as_ref(),
                    "Cannot delete link",
                    || file.delete(),
                ),
                Attempt::Done(())
            ),
            TransferMode::Copy => matches!(
                retry_loop(
                    &self.control,
                    self.options.errors.as_ref(),
                    "Cannot copy link",
                    || {
                        let target = file.read_link()?;
                        dest.create_symlink(&target)
                    },
                ),
                Attempt::Done(())
            ),
        };
        if done {
            self.progress.file_done();
        }
        done
    }

    fn process_directory(&self, file: &dyn FileHandle, dest: &dyn FileHandle) -> bool {
        if !(dest.exists() && dest.is_browsable()) {
            match retry_loop(
                &self.control,
                self.options.errors.as_ref(),
                "Cannot create folder",
                || dest.mkdir(),
            ) {
                Attempt::Done(()) => {}
                Attempt::Skipped | Attempt::Aborted => return false,
            }
        }

        let children = match retry_loop(
            &self.control,
            self.options.errors.as_ref(),
            "Cannot read folder",
            || file.list(),
        ) {
            Attempt::Done(children) => children,
            Attempt::Skipped | Attempt::Aborted => return false,
        };

        let mut all_ok = true;
        for child in &children {
            // Propagate interruption before touching the next entry, and
            // without deleting this folder.
            if !self.control.checkpoint() {
                return false;
            }
            if !self.process_handle(child.as_ref(), dest, false) {
                all_ok = false;
            }
        }

        // Give the destination folder the source's timestamp once all
        // children are in place.
        if let Some(modified) = file.modified() {
            let _ = dest.change_modified(modified);
        }

        // One failed child leaves siblings moved but the folder itself is a
        // failure: the source directory survives a move.
        if !all_ok {
            return false;
        }

        if self.mode == TransferMode::Move {
            if !self.control.checkpoint() {
                return false;
            }
            return matches!(
                retry_loop(
                    &self.control,
                    self.options.errors.as_ref(),
                    "Cannot delete folder",
                    || file.delete(),
                ),
                Attempt::Done(())
            );
        }
        true
    }

    fn process_regular_file(
        &self,
        file: &dyn FileHandle,
        dest: &dyn FileHandle,
        append: bool,
    ) -> bool {
        if self.mode == TransferMode::Copy && !append {
            match self.try_native(file, dest, NativeOp::Copy) {
                NativeResult::Done => return true,
                NativeResult::Failed => return false,
                NativeResult::NotApplicable => {}
            }
        }

        let size = file.size();
        self.progress.start_file(&file.name(), size);

        match retry_loop(
            &self.control,
            self.options.errors.as_ref(),
            "Error while transferring",
            || self.stream_copy(file, dest, append),
        ) {
            Attempt::Done(_) => {}
            Attempt::Skipped | Attempt::Aborted => return false,
        }

        if self.mode == TransferMode::Move {
            match retry_loop(
                &self.control,
                self.options.errors.as_ref(),
                "Cannot delete file",
                || file.delete(),
            ) {
                Attempt::Done(()) => {}
                Attempt::Skipped | Attempt::Aborted => return false,
            }
        }

        self.progress.file_done();
        true
    }

    /// One attempt at copying the content; restarted wholesale by the retry
    /// loop on failure. Bytes counted during a failed attempt are rolled
    /// back so progress stays honest across retries.
    fn stream_copy(&self, file: &dyn FileHandle, dest: &dyn FileHandle, append: bool) -> VfsResult<u64> {
        let mut reader = file.open_read()?;

        let mut resumed = 0u64;
        if append {
            // Skip the part the destination already has.
            resumed = dest.size();
            io::copy(&mut reader.by_ref().take(resumed), &mut io::sink())?;
            self.progress.count_bytes_skipped(resumed);
        }

        let mode = if append {
            WriteMode::Append
        } else {
            WriteMode::Truncate
        };
        let mut writer = dest.open_write(mode)?;

        let mut buffer = vec![0u8; self.options.buffer_size.max(4 * 1024)];
        let mut copied = 0u64;

        let result = loop {
            if !self.control.checkpoint() {
                break Err(VfsError::Interrupted);
            }
            let read = match reader.read(&mut buffer) {
                Ok(0) => break Ok(copied),
                Ok(n) => n,
                Err(err) => break Err(VfsError::Io(err)),
            };
            if let Err(err) = writer.write_all(&buffer[..read]) {
                break Err(VfsError::Io(err));
            }
            copied += read as u64;
            self.progress.add_bytes(read as u64);
        };

        match result {
            Ok(copied) => {
                writer.flush()?;
                Ok(copied)
            }
            Err(err) => {
                self.progress.rollback_bytes(copied);
                if append {
                    self.progress.rollback_bytes(resumed);
                }
                drop(writer);
                // A truncate-mode attempt leaves no partial destination
                // behind; an interrupted resume keeps its partial for the
                // next resume.
                if !append {
                    let _ = dest.delete();
                }
                Err(err)
            }
        }
    }

    fn try_native(
        &self,
        file: &dyn FileHandle,
        dest: &dyn FileHandle,
        op: NativeOp,
    ) -> NativeResult {
        let hint = match op {
            NativeOp::Move => file.move_hint(dest),
            NativeOp::Copy => file.copy_hint(dest),
        };
        if hint == CopyHint::MustNot {
            return NativeResult::NotApplicable;
        }

        // Captured before the attempt: a moved source no longer answers.
        let is_dir = file.is_directory();
        let size = file.size();

        let attempt = retry_loop(
            &self.control,
            self.options.errors.as_ref(),
            "Error while transferring",
            || match op {
                NativeOp::Move => file.move_to(dest),
                NativeOp::Copy => file.copy_to(dest),
            },
        );
        match attempt {
            Attempt::Done(true) => {
                if !is_dir {
                    self.progress.count_bytes_skipped(size);
                    self.progress.file_done();
                }
                NativeResult::Done
            }
            // The backend had no native path after all; use the generic one.
            Attempt::Done(false) => NativeResult::NotApplicable,
            Attempt::Skipped | Attempt::Aborted => NativeResult::Failed,
        }
    }

    fn resolve_collision(&self, file: &dyn FileHandle, dest: &dyn FileHandle) -> CollisionOutcome {
        let action = if let Some(sticky) = self.sticky_collision.get() {
            sticky
        } else {
            match &self.options.collision {
                CollisionPolicy::Always(action) => *action,
                CollisionPolicy::Ask(resolver) => {
                    // Blocks on the worker thread until the collaborator
                    // answers.
                    let choice = resolver.resolve(file, dest);
                    if choice.apply_to_all {
                        self.sticky_collision.set(Some(choice.action));
                    }
                    choice.action
                }
            }
        };

        match action {
            CollisionAction::Overwrite => CollisionOutcome::Proceed,
            CollisionAction::OverwriteIfNewer => {
                match (file.modified(), dest.modified()) {
                    (Some(src), Some(dst)) if src > dst => CollisionOutcome::Proceed,
                    // Not newer, or dates unavailable: leave the destination.
                    _ => CollisionOutcome::SkipFile,
                }
            }
            CollisionAction::Resume => CollisionOutcome::ProceedAppend,
            CollisionAction::Skip => CollisionOutcome::SkipFile,
            CollisionAction::Cancel => CollisionOutcome::Abort,
        }
    }

    /// Flushes each distinct writable archive touched by the sources or the
    /// destination, once per archive.
    fn flush_touched_archives(&self) {
        let candidates = self
            .sources
            .iter()
            .filter_map(|s| s.parent_archive())
            .chain(self.dest_folder.parent_archive());
        crate::jobs::flush_distinct_archives(candidates, &self.progress);
    }
}

enum NativeOp {
    Move,
    Copy,
}

enum NativeResult {
    Done,
    Failed,
    NotApplicable,
}

enum CollisionOutcome {
    Proceed,
    ProceedAppend,
    SkipFile,
    Abort,
}
