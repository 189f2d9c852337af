use std::cell::OnceCell;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::archive::ArchiveContainer;
use crate::vfs::url::FileUrl;
use crate::vfs::{CopyHint, FileHandle, HandleRef, Permissions, VfsResult, WriteMode};

/// Decorator that memoizes attribute getters of the wrapped handle.
///
/// Each getter queries the underlying handle once and then returns the first
/// observed value for the rest of the decorator's lifetime, even if the
/// underlying resource changes. Listing is never memoized, but with
/// `recurse` enabled every handle produced by this one (children, parent,
/// resolved names) is freshly wrapped in a new decorator.
///
/// Use this when a stable snapshot matters more than a live view — sorting a
/// directory panel, or walking a tree where each attribute is consulted
/// several times per entry.
pub struct CachedHandle {
    inner: HandleRef,
    recurse: bool,

    exists: OnceCell<bool>,
    is_directory: OnceCell<bool>,
    is_browsable: OnceCell<bool>,
    is_symlink: OnceCell<bool>,
    size: OnceCell<u64>,
    modified: OnceCell<Option<DateTime<Local>>>,
    permissions: OnceCell<Option<Permissions>>,
    owner: OnceCell<Option<String>>,
    group: OnceCell<Option<String>>,
    free_space: OnceCell<Option<u64>>,
    total_space: OnceCell<Option<u64>>,
    name: OnceCell<String>,
}

impl CachedHandle {
    pub fn new(inner: HandleRef, recurse: bool) -> Self {
        Self {
            inner,
            recurse,
            exists: OnceCell::new(),
            is_directory: OnceCell::new(),
            is_browsable: OnceCell::new(),
            is_symlink: OnceCell::new(),
            size: OnceCell::new(),
            modified: OnceCell::new(),
            permissions: OnceCell::new(),
            owner: OnceCell::new(),
            group: OnceCell::new(),
            free_space: OnceCell::new(),
            total_space: OnceCell::new(),
            name: OnceCell::new(),
        }
    }

    fn wrap(&self, handle: HandleRef) -> HandleRef {
        if self.recurse {
            Box::new(CachedHandle::new(handle, true))
        } else {
            handle
        }
    }
}

impl FileHandle for CachedHandle {
    fn url(&self) -> &FileUrl {
        self.inner.url()
    }

    fn name(&self) -> String {
        self.name.get_or_init(|| self.inner.name()).clone()
    }

    fn exists(&self) -> bool {
        *self.exists.get_or_init(|| self.inner.exists())
    }

    fn is_directory(&self) -> bool {
        *self.is_directory.get_or_init(|| self.inner.is_directory())
    }

    fn is_browsable(&self) -> bool {
        *self.is_browsable.get_or_init(|| self.inner.is_browsable())
    }

    fn is_symlink(&self) -> bool {
        *self.is_symlink.get_or_init(|| self.inner.is_symlink())
    }

    fn size(&self) -> u64 {
        *self.size.get_or_init(|| self.inner.size())
    }

    fn modified(&self) -> Option<DateTime<Local>> {
        *self.modified.get_or_init(|| self.inner.modified())
    }

    fn change_modified(&self, when: DateTime<Local>) -> VfsResult<()> {
        self.inner.change_modified(when)
    }

    fn permissions(&self) -> Option<Permissions> {
        *self.permissions.get_or_init(|| self.inner.permissions())
    }

    fn change_permission(&self, bit: u32, enabled: bool) -> VfsResult<()> {
        self.inner.change_permission(bit, enabled)
    }

    fn owner(&self) -> Option<String> {
        self.owner.get_or_init(|| self.inner.owner()).clone()
    }

    fn group(&self) -> Option<String> {
        self.group.get_or_init(|| self.inner.group()).clone()
    }

    fn free_space(&self) -> Option<u64> {
        *self.free_space.get_or_init(|| self.inner.free_space())
    }

    fn total_space(&self) -> Option<u64> {
        *self.total_space.get_or_init(|| self.inner.total_space())
    }

    fn parent(&self) -> Option<HandleRef> {
        self.inner.parent().map(|p| self.wrap(p))
    }

    fn parent_archive(&self) -> Option<Arc<dyn ArchiveContainer>> {
        self.inner.parent_archive()
    }

    fn list(&self) -> VfsResult<Vec<HandleRef>> {
        let children = self.inner.list()?;
        Ok(children.into_iter().map(|c| self.wrap(c)).collect())
    }

    fn resolve_child(&self, name: &str) -> VfsResult<HandleRef> {
        Ok(self.wrap(self.inner.resolve_child(name)?))
    }

    fn open_read(&self) -> VfsResult<Box<dyn Read + Send>> {
        self.inner.open_read()
    }

    fn open_write(&self, mode: WriteMode) -> VfsResult<Box<dyn Write + Send>> {
        self.inner.open_write(mode)
    }

    fn mkdir(&self) -> VfsResult<()> {
        self.inner.mkdir()
    }

    fn mkfile(&self) -> VfsResult<()> {
        self.inner.mkfile()
    }

    fn delete(&self) -> VfsResult<()> {
        self.inner.delete()
    }

    fn move_hint(&self, dest: &dyn FileHandle) -> CopyHint {
        self.inner.move_hint(dest)
    }

    fn move_to(&self, dest: &dyn FileHandle) -> VfsResult<bool> {
        self.inner.move_to(dest)
    }

    fn copy_hint(&self, dest: &dyn FileHandle) -> CopyHint {
        self.inner.copy_hint(dest)
    }

    fn copy_to(&self, dest: &dyn FileHandle) -> VfsResult<bool> {
        self.inner.copy_to(dest)
    }

    fn read_link(&self) -> VfsResult<String> {
        self.inner.read_link()
    }

    fn create_symlink(&self, target: &str) -> VfsResult<()> {
        self.inner.create_symlink(target)
    }
}
