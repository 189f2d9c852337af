use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Local};
use thiserror::Error;

use crate::archive::ArchiveContainer;
use crate::vfs::url::FileUrl;

pub mod bookmark;
pub mod cached;
pub mod factory;
pub mod local;
pub mod sftp;
pub mod url;

pub type VfsResult<T> = Result<T, VfsError>;

/// Crate-wide error type. The job engine is the only layer that turns these
/// into retry/skip/abort decisions; backends just surface them.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed for {url}")]
    Auth { url: String },

    #[error("Operation not supported by {0}")]
    Unsupported(&'static str),

    #[error("Unknown scheme: {0}")]
    UnknownScheme(String),

    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    #[error("Invalid filename: {0}")]
    InvalidFilename(&'static str),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Archive is read-only: {0}")]
    ReadOnlyArchive(String),

    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("Not connected")]
    Disconnected,

    #[error("Interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Auth failures carry the failing location so a UI can prompt for
    /// credentials and retry the whole operation.
    pub fn auth(url: &FileUrl) -> Self {
        VfsError::Auth {
            url: url.normalized(),
        }
    }
}

/// Boxed handle, the form everything above the backends works with.
pub type HandleRef = Box<dyn FileHandle>;

/// Self-declared capability for a native move/copy to a given destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyHint {
    /// The native path is the only correct one (e.g. renaming inside one
    /// archive session).
    Must,
    /// A native path exists and is cheaper than a stream copy.
    Should,
    /// No native path; callers go straight to the generic stream copy.
    MustNot,
}

/// How `open_write` positions the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
}

/// Permission bits in the usual owner/group/other x read/write/execute
/// layout, together with the subset a backend can actually change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    mode: u32,
    changeable: u32,
}

impl Permissions {
    pub fn new(mode: u32, changeable: u32) -> Self {
        Self {
            mode: mode & 0o777,
            changeable: changeable & 0o777,
        }
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Mask of bits `change_permission` is allowed to touch.
    pub fn changeable_mask(&self) -> u32 {
        self.changeable
    }

    pub fn with_bit(&self, bit: u32, enabled: bool) -> Self {
        let mode = if enabled {
            self.mode | bit
        } else {
            self.mode & !bit
        };
        Self {
            mode,
            changeable: self.changeable,
        }
    }

    /// `rwxr-xr-x` style string.
    pub fn to_rwx_string(&self) -> String {
        let mut out = String::with_capacity(9);
        let flags = [
            (0o400, 'r'),
            (0o200, 'w'),
            (0o100, 'x'),
            (0o040, 'r'),
            (0o020, 'w'),
            (0o010, 'x'),
            (0o004, 'r'),
            (0o002, 'w'),
            (0o001, 'x'),
        ];
        for (bit, ch) in &flags {
            out.push(if self.mode & bit != 0 { *ch } else { '-' });
        }
        out
    }
}

/// Polymorphic contract over a path-addressable resource: local file, remote
/// file, archive entry or synthetic node.
///
/// A handle's location is fixed at construction. Attribute getters are live
/// queries — callers that want a stable snapshot wrap the handle in a
/// [`cached::CachedHandle`]. Getters do not fail: a handle whose backend
/// cannot answer reports non-existence, zero size and so on, mirroring how
/// a stat that errors is displayed in a file panel.
pub trait FileHandle: Send {
    /// Location of this resource. Immutable for the handle's lifetime.
    fn url(&self) -> &FileUrl;

    /// Filename within the parent namespace.
    fn name(&self) -> String {
        self.url().name()
    }

    fn exists(&self) -> bool;

    fn is_directory(&self) -> bool;

    /// True for anything that can be entered in a panel: directories, but
    /// also archive files and archive directory entries.
    fn is_browsable(&self) -> bool {
        self.is_directory()
    }

    fn is_symlink(&self) -> bool;

    /// Size in bytes; zero for directories and unreadable entries.
    fn size(&self) -> u64;

    fn modified(&self) -> Option<DateTime<Local>>;

    fn change_modified(&self, _when: DateTime<Local>) -> VfsResult<()> {
        Err(VfsError::Unsupported("change_modified"))
    }

    fn permissions(&self) -> Option<Permissions>;

    fn change_permission(&self, _bit: u32, _enabled: bool) -> VfsResult<()> {
        Err(VfsError::Unsupported("change_permission"))
    }

    fn owner(&self) -> Option<String> {
        None
    }

    fn group(&self) -> Option<String> {
        None
    }

    /// Free space on the volume holding this resource, where meaningful.
    fn free_space(&self) -> Option<u64> {
        None
    }

    fn total_space(&self) -> Option<u64> {
        None
    }

    /// One level up in this handle's namespace.
    fn parent(&self) -> Option<HandleRef>;

    /// The writable archive this handle lives in, if any. Drives the
    /// flush-on-completion step of transfer jobs.
    fn parent_archive(&self) -> Option<Arc<dyn ArchiveContainer>> {
        None
    }

    /// Enumerates direct children. Finite, non-restartable; fails when the
    /// backend cannot enumerate (permission denied, disconnected).
    fn list(&self) -> VfsResult<Vec<HandleRef>>;

    /// Handle for a direct child of this (browsable) handle. The child need
    /// not exist yet; this is how jobs address destination files.
    fn resolve_child(&self, name: &str) -> VfsResult<HandleRef>;

    /// Opens the content for reading. Callers own the stream and must close
    /// it on every exit path (dropping it is closing it).
    fn open_read(&self) -> VfsResult<Box<dyn Read + Send>>;

    /// Opens the content for writing, creating the resource if needed.
    fn open_write(&self, mode: WriteMode) -> VfsResult<Box<dyn Write + Send>>;

    fn mkdir(&self) -> VfsResult<()>;

    /// Creates an empty file at this location.
    fn mkfile(&self) -> VfsResult<()>;

    /// Deletes this resource. Directories must be empty; symlinks are
    /// removed as links, never followed.
    fn delete(&self) -> VfsResult<()>;

    /// Whether this handle has a native move path to `dest`.
    fn move_hint(&self, _dest: &dyn FileHandle) -> CopyHint {
        CopyHint::MustNot
    }

    /// Native move. `Ok(true)` on success, `Ok(false)` when the native path
    /// turned out not to apply (caller falls back to copy+delete), `Err` on
    /// a real failure that must surface for a retry/skip/abort decision.
    fn move_to(&self, _dest: &dyn FileHandle) -> VfsResult<bool> {
        Ok(false)
    }

    /// Whether this handle has a native copy path to `dest`.
    fn copy_hint(&self, _dest: &dyn FileHandle) -> CopyHint {
        CopyHint::MustNot
    }

    /// Native copy, same contract as [`FileHandle::move_to`].
    fn copy_to(&self, _dest: &dyn FileHandle) -> VfsResult<bool> {
        Ok(false)
    }

    /// Target string of a symlink.
    fn read_link(&self) -> VfsResult<String> {
        Err(VfsError::Unsupported("read_link"))
    }

    /// Creates this handle's location as a symlink pointing at `target`.
    fn create_symlink(&self, _target: &str) -> VfsResult<()> {
        Err(VfsError::Unsupported("create_symlink"))
    }
}

/// Maximum filename length (POSIX limit).
const MAX_FILENAME_LENGTH: usize = 255;

/// Validates a single filename before it reaches a backend mkdir/mkfile/
/// rename. Rejects separators, control characters, reserved names and
/// over-long names.
pub fn validate_filename(name: &str) -> Result<(), VfsError> {
    if name.trim().is_empty() {
        return Err(VfsError::InvalidFilename("filename cannot be empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(VfsError::InvalidFilename(
            "filename cannot contain path separators",
        ));
    }
    if name.contains('\0') {
        return Err(VfsError::InvalidFilename(
            "filename cannot contain null bytes",
        ));
    }
    if name == "." || name == ".." {
        return Err(VfsError::InvalidFilename("reserved filename"));
    }
    if name.len() > MAX_FILENAME_LENGTH {
        return Err(VfsError::InvalidFilename(
            "filename too long (max 255 bytes)",
        ));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(VfsError::InvalidFilename(
            "filename cannot contain control characters",
        ));
    }
    if name != name.trim() {
        return Err(VfsError::InvalidFilename(
            "filename cannot start or end with whitespace",
        ));
    }
    Ok(())
}
