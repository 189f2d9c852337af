use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::warn;

use crate::vfs::{FileHandle, VfsError, VfsResult};

pub mod delete;
pub mod pack;
pub mod transfer;
pub mod unpack;

/// Lifecycle of a job. Transitions are one-directional except
/// `Running` <-> `Paused`; once `Finished` or `Interrupted` nothing runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    NotStarted,
    Running,
    Paused,
    Finished,
    Interrupted,
}

/// Shared stop/pause switch between a job's worker thread and its owner.
///
/// Cancellation is cooperative: the worker polls [`JobControl::checkpoint`]
/// before each filesystem entry and around each retryable call, so a stop
/// request takes effect at the next checkpoint, never mid-syscall.
pub struct JobControl {
    state: Mutex<JobState>,
    cond: Condvar,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(JobState::NotStarted),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> JobState {
        *self.lock()
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.lock();
        if *state == JobState::NotStarted {
            *state = JobState::Running;
        }
    }

    pub(crate) fn mark_finished(&self) {
        let mut state = self.lock();
        if matches!(*state, JobState::Running | JobState::Paused) {
            *state = JobState::Finished;
            self.cond.notify_all();
        }
    }

    /// Requests a pause; the worker parks at its next checkpoint.
    pub fn pause(&self) {
        let mut state = self.lock();
        if *state == JobState::Running {
            *state = JobState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        if *state == JobState::Paused {
            *state = JobState::Running;
            self.cond.notify_all();
        }
    }

    /// Requests a stop; observed at the worker's next checkpoint. Terminal.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        if !matches!(*state, JobState::Finished) {
            *state = JobState::Interrupted;
            self.cond.notify_all();
        }
    }

    /// Worker-side poll point: blocks while paused, returns `false` once the
    /// job is interrupted.
    pub fn checkpoint(&self) -> bool {
        let mut state = self.lock();
        while *state == JobState::Paused {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        matches!(*state, JobState::Running | JobState::NotStarted)
    }

    pub fn is_interrupted(&self) -> bool {
        self.state() == JobState::Interrupted
    }
}

/// A file-level failure kept for the job's final report.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub location: String,
    pub message: String,
}

/// Progress surface polled by a UI timer while the worker mutates it.
///
/// Reads are individually consistent but not mutually: a poll may pair a
/// fresh byte count with a stale filename. That is fine for a progress
/// display.
pub struct JobProgress {
    total_bytes: AtomicU64,
    processed_bytes: AtomicU64,
    total_files: AtomicU64,
    processed_files: AtomicU64,
    current_file_total: AtomicU64,
    current_file_bytes: AtomicU64,
    current_filename: Mutex<String>,
    status: Mutex<String>,
    failures: Mutex<Vec<JobFailure>>,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl JobProgress {
    pub fn new() -> Self {
        Self {
            total_bytes: AtomicU64::new(0),
            processed_bytes: AtomicU64::new(0),
            total_files: AtomicU64::new(0),
            processed_files: AtomicU64::new(0),
            current_file_total: AtomicU64::new(0),
            current_file_bytes: AtomicU64::new(0),
            current_filename: Mutex::new(String::new()),
            status: Mutex::new(String::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn total_percent_done(&self) -> f64 {
        let total = self.total_bytes.load(Ordering::Relaxed);
        if total == 0 {
            let files = self.total_files.load(Ordering::Relaxed);
            if files == 0 {
                return 0.0;
            }
            return self.processed_files.load(Ordering::Relaxed) as f64 * 100.0 / files as f64;
        }
        self.processed_bytes.load(Ordering::Relaxed) as f64 * 100.0 / total as f64
    }

    pub fn file_percent_done(&self) -> f64 {
        let total = self.current_file_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.current_file_bytes.load(Ordering::Relaxed) as f64 * 100.0 / total as f64
    }

    pub fn total_bytes_processed(&self) -> u64 {
        self.processed_bytes.load(Ordering::Relaxed)
    }

    pub fn total_files_processed(&self) -> u64 {
        self.processed_files.load(Ordering::Relaxed)
    }

    pub fn current_filename(&self) -> String {
        self.lock_str(&self.current_filename).clone()
    }

    pub fn status_string(&self) -> String {
        self.lock_str(&self.status).clone()
    }

    /// File-level failures accumulated so far; the job's final report.
    pub fn failures(&self) -> Vec<JobFailure> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_str<'a>(&self, field: &'a Mutex<String>) -> std::sync::MutexGuard<'a, String> {
        field.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_totals(&self, bytes: u64, files: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
        self.total_files.store(files, Ordering::Relaxed);
    }

    pub(crate) fn start_file(&self, name: &str, size: u64) {
        *self.lock_str(&self.current_filename) = name.to_string();
        self.current_file_total.store(size, Ordering::Relaxed);
        self.current_file_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.current_file_bytes.fetch_add(n, Ordering::Relaxed);
        self.processed_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn count_bytes_skipped(&self, n: u64) {
        self.processed_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Backs out bytes counted during a failed attempt so a retry does not
    /// double-count.
    pub(crate) fn rollback_bytes(&self, n: u64) {
        self.current_file_bytes.fetch_sub(n, Ordering::Relaxed);
        self.processed_bytes.fetch_sub(n, Ordering::Relaxed);
    }

    pub(crate) fn file_done(&self) {
        self.processed_files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_status(&self, status: String) {
        *self.lock_str(&self.status) = status;
    }

    pub(crate) fn record_failure(&self, location: String, message: String) {
        warn!(%location, %message, "file-level failure");
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(JobFailure { location, message });
    }
}

/// Answer to a destination collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionAction {
    Overwrite,
    OverwriteIfNewer,
    Skip,
    Resume,
    Cancel,
}

/// A collision answer, optionally promoted to the job's default.
#[derive(Debug, Clone, Copy)]
pub struct CollisionChoice {
    pub action: CollisionAction,
    pub apply_to_all: bool,
}

impl CollisionChoice {
    pub fn once(action: CollisionAction) -> Self {
        Self {
            action,
            apply_to_all: false,
        }
    }
}

/// Asked when a destination already exists. Runs on the worker thread and
/// may block on a UI prompt; the worker waits for the answer.
pub trait CollisionResolver: Send {
    fn resolve(&self, source: &dyn FileHandle, dest: &dyn FileHandle) -> CollisionChoice;
}

/// Per-file collision handling configured on a job.
pub enum CollisionPolicy {
    /// Delegate each collision to the resolver; an apply-to-all answer is
    /// cached for the rest of the job.
    Ask(Box<dyn CollisionResolver>),
    /// Fixed answer for every collision.
    Always(CollisionAction),
}

/// Resolver with a fixed answer, mostly for tests and batch callers.
pub struct AlwaysResolve(pub CollisionAction);

impl CollisionResolver for AlwaysResolve {
    fn resolve(&self, _source: &dyn FileHandle, _dest: &dyn FileHandle) -> CollisionChoice {
        CollisionChoice::once(self.0)
    }
}

/// Answer to a terminal I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Retry,
    Skip,
    Cancel,
}

/// Asked on every terminal I/O failure (delete, mkdir, stream open, stream
/// copy). Runs on the worker thread; may block on a UI dialog.
pub trait ErrorReporter: Send {
    fn report(&self, title: &str, message: &str) -> ErrorAction;
}

/// Reporter with a fixed answer.
pub struct AlwaysError(pub ErrorAction);

impl ErrorReporter for AlwaysError {
    fn report(&self, _title: &str, _message: &str) -> ErrorAction {
        self.0
    }
}

/// Result of one retry loop around a terminal operation.
pub(crate) enum Attempt<T> {
    Done(T),
    Skipped,
    Aborted,
}

/// Runs `op` until it succeeds, the reporter answers skip, or the job is
/// cancelled. Every iteration starts with a checkpoint, so pause and stop
/// requests are observed between retries. No layer below this one makes a
/// retry decision.
pub(crate) fn retry_loop<T>(
    control: &JobControl,
    errors: &dyn ErrorReporter,
    title: &str,
    mut op: impl FnMut() -> VfsResult<T>,
) -> Attempt<T> {
    loop {
        if !control.checkpoint() {
            return Attempt::Aborted;
        }
        match op() {
            Ok(value) => return Attempt::Done(value),
            Err(err) => match errors.report(title, &err.to_string()) {
                ErrorAction::Retry => continue,
                ErrorAction::Skip => return Attempt::Skipped,
                ErrorAction::Cancel => {
                    control.interrupt();
                    return Attempt::Aborted;
                }
            },
        }
    }
}

/// Totals for progress accounting: bytes and file count under a set of
/// handles. Symlinks count as zero-byte entries and are never followed.
/// Honors the cancel checkpoint between entries.
pub(crate) fn compute_totals(
    handles: &[&dyn FileHandle],
    control: &JobControl,
) -> VfsResult<(u64, u64)> {
    let mut bytes = 0u64;
    let mut files = 0u64;
    for handle in handles {
        if !control.checkpoint() {
            return Err(VfsError::Interrupted);
        }
        if handle.is_symlink() {
            files += 1;
        } else if handle.is_directory() {
            let children = handle.list()?;
            let refs: Vec<&dyn FileHandle> = children.iter().map(|c| c.as_ref()).collect();
            let (b, f) = compute_totals(&refs, control)?;
            bytes += b;
            files += f;
        } else {
            bytes += handle.size();
            files += 1;
        }
    }
    Ok((bytes, files))
}

/// Flushes each distinct writable archive among `candidates` exactly once.
/// Flush failures are recorded in the job report, not retried: the staged
/// mutations survive in the container for a later flush attempt.
pub(crate) fn flush_distinct_archives(
    candidates: impl Iterator<Item = std::sync::Arc<dyn crate::archive::ArchiveContainer>>,
    progress: &JobProgress,
) {
    let mut seen: Vec<String> = Vec::new();
    for container in candidates {
        let key = container.url().normalized();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        if !container.is_writable() || !container.has_staged() {
            continue;
        }
        progress.set_status(format!("Flushing archive {}", container.url().name()));
        if let Err(err) = container.flush() {
            progress.record_failure(container.url().normalized(), err.to_string());
        }
    }
}

/// Outcome summary returned by a job's run loop: counts of top-level
/// successes and failures. File-level detail lives in
/// [`JobProgress::failures`].
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub success_count: usize,
    pub failure_count: usize,
}

/// A job running on its dedicated worker thread.
///
/// The control and progress handles are shared with the worker: a UI thread
/// polls progress on a timer and requests pause/stop through the control,
/// while `join` collects the final report.
pub struct RunningJob {
    control: std::sync::Arc<JobControl>,
    progress: std::sync::Arc<JobProgress>,
    thread: std::thread::JoinHandle<JobReport>,
}

impl RunningJob {
    pub(crate) fn new(
        control: std::sync::Arc<JobControl>,
        progress: std::sync::Arc<JobProgress>,
        thread: std::thread::JoinHandle<JobReport>,
    ) -> Self {
        Self {
            control,
            progress,
            thread,
        }
    }

    pub fn control(&self) -> &std::sync::Arc<JobControl> {
        &self.control
    }

    pub fn progress(&self) -> &std::sync::Arc<JobProgress> {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks until the worker exits. A panicked worker reports one failure.
    pub fn join(self) -> JobReport {
        self.thread.join().unwrap_or_else(|_| JobReport {
            success_count: 0,
            failure_count: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_state_machine_transitions() {
        let control = JobControl::new();
        assert_eq!(control.state(), JobState::NotStarted);

        control.mark_running();
        assert_eq!(control.state(), JobState::Running);

        control.pause();
        assert_eq!(control.state(), JobState::Paused);
        control.resume();
        assert_eq!(control.state(), JobState::Running);

        control.mark_finished();
        assert_eq!(control.state(), JobState::Finished);
        // Terminal: interrupt after finish is a no-op.
        control.interrupt();
        assert_eq!(control.state(), JobState::Finished);
    }

    #[test]
    fn test_interrupt_is_terminal() {
        let control = JobControl::new();
        control.mark_running();
        control.interrupt();
        assert_eq!(control.state(), JobState::Interrupted);
        control.mark_finished();
        assert_eq!(control.state(), JobState::Interrupted);
        assert!(!control.checkpoint());
    }

    #[test]
    fn test_checkpoint_blocks_while_paused() {
        let control = Arc::new(JobControl::new());
        control.mark_running();
        control.pause();

        let worker = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.checkpoint())
        };

        // The worker is parked; let it hit the wait, then resume.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!worker.is_finished());
        control.resume();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_interrupt_wakes_paused_worker() {
        let control = Arc::new(JobControl::new());
        control.mark_running();
        control.pause();

        let worker = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.checkpoint())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        control.interrupt();
        assert!(!worker.join().unwrap());
    }

    #[test]
    fn test_retry_loop_retries_then_succeeds() {
        let control = JobControl::new();
        control.mark_running();
        let mut attempts = 0;
        let result = retry_loop(&control, &AlwaysError(ErrorAction::Retry), "t", || {
            attempts += 1;
            if attempts < 3 {
                Err(VfsError::Other("flaky".to_string()))
            } else {
                Ok(attempts)
            }
        });
        assert!(matches!(result, Attempt::Done(3)));
    }

    #[test]
    fn test_retry_loop_skip() {
        let control = JobControl::new();
        control.mark_running();
        let result: Attempt<()> = retry_loop(&control, &AlwaysError(ErrorAction::Skip), "t", || {
            Err(VfsError::Other("nope".to_string()))
        });
        assert!(matches!(result, Attempt::Skipped));
        assert_eq!(control.state(), JobState::Running);
    }

    #[test]
    fn test_retry_loop_cancel_interrupts_job() {
        let control = JobControl::new();
        control.mark_running();
        let result: Attempt<()> =
            retry_loop(&control, &AlwaysError(ErrorAction::Cancel), "t", || {
                Err(VfsError::Other("fatal".to_string()))
            });
        assert!(matches!(result, Attempt::Aborted));
        assert_eq!(control.state(), JobState::Interrupted);
    }

    #[test]
    fn test_progress_percentages() {
        let progress = JobProgress::new();
        progress.set_totals(200, 4);
        progress.start_file("a", 100);
        progress.add_bytes(50);
        assert_eq!(progress.total_percent_done(), 25.0);
        assert_eq!(progress.file_percent_done(), 50.0);
        assert_eq!(progress.total_bytes_processed(), 50);
        assert_eq!(progress.current_filename(), "a");
    }

    #[test]
    fn test_progress_zero_totals() {
        let progress = JobProgress::new();
        assert_eq!(progress.total_percent_done(), 0.0);
        assert_eq!(progress.file_percent_done(), 0.0);
    }

    #[test]
    fn test_failures_recorded() {
        let progress = JobProgress::new();
        progress.record_failure("/a".to_string(), "denied".to_string());
        let failures = progress.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].location, "/a");
    }
}
