use std::cell::OnceCell;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::vfs::factory::HandleFactory;
use crate::vfs::url::FileUrl;
use crate::vfs::{FileHandle, HandleRef, Permissions, VfsError, VfsResult, WriteMode};

/// A named shortcut to a location in any namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bookmark {
    pub name: String,
    pub location: String,
}

/// Permissions reported for every bookmark handle: rw- for the owner, with
/// only the owner bits changeable.
const BOOKMARK_PERMISSIONS: (u32, u32) = (0o600, 0o700);

/// Handle in the `bookmark://` namespace.
///
/// Structural operations are served by the handle the bookmark points at;
/// the target location is resolved through the factory at most once, on
/// first use, since resolving may open a remote session.
pub struct BookmarkHandle {
    bookmark: Bookmark,
    factory: Arc<HandleFactory>,
    url: FileUrl,
    target: OnceCell<HandleRef>,
}

impl BookmarkHandle {
    pub fn new(bookmark: Bookmark, factory: Arc<HandleFactory>) -> Self {
        let url = FileUrl::synthetic("bookmark", &bookmark.name);
        Self {
            bookmark,
            factory,
            url,
            target: OnceCell::new(),
        }
    }

    pub fn bookmark(&self) -> &Bookmark {
        &self.bookmark
    }

    fn target(&self) -> VfsResult<&HandleRef> {
        if self.target.get().is_none() {
            let resolved = self.factory.resolve(&self.bookmark.location)?;
            let _ = self.target.set(resolved);
        }
        self.target
            .get()
            .ok_or_else(|| VfsError::InvalidLocation(self.bookmark.location.clone()))
    }
}

impl FileHandle for BookmarkHandle {
    fn url(&self) -> &FileUrl {
        &self.url
    }

    fn name(&self) -> String {
        self.bookmark.name.clone()
    }

    fn exists(&self) -> bool {
        self.target().map(|t| t.exists()).unwrap_or(false)
    }

    fn is_directory(&self) -> bool {
        self.target().map(|t| t.is_directory()).unwrap_or(false)
    }

    fn is_browsable(&self) -> bool {
        self.target().map(|t| t.is_browsable()).unwrap_or(false)
    }

    fn is_symlink(&self) -> bool {
        false
    }

    fn size(&self) -> u64 {
        self.target().map(|t| t.size()).unwrap_or(0)
    }

    fn modified(&self) -> Option<DateTime<Local>> {
        self.target().ok().and_then(|t| t.modified())
    }

    fn permissions(&self) -> Option<Permissions> {
        let (mode, changeable) = BOOKMARK_PERMISSIONS;
        Some(Permissions::new(mode, changeable))
    }

    fn parent(&self) -> Option<HandleRef> {
        Some(Box::new(BookmarkRootHandle::new(Arc::clone(&self.factory))))
    }

    fn list(&self) -> VfsResult<Vec<HandleRef>> {
        self.target()?.list()
    }

    fn resolve_child(&self, name: &str) -> VfsResult<HandleRef> {
        self.target()?.resolve_child(name)
    }

    fn open_read(&self) -> VfsResult<Box<dyn Read + Send>> {
        self.target()?.open_read()
    }

    fn open_write(&self, mode: WriteMode) -> VfsResult<Box<dyn Write + Send>> {
        self.target()?.open_write(mode)
    }

    fn mkdir(&self) -> VfsResult<()> {
        self.target()?.mkdir()
    }

    fn mkfile(&self) -> VfsResult<()> {
        self.target()?.mkfile()
    }

    fn delete(&self) -> VfsResult<()> {
        // Deleting through a bookmark would silently destroy the target;
        // bookmark management is the embedding application's job.
        Err(VfsError::Unsupported("delete through a bookmark"))
    }
}

/// Root of the `bookmark://` namespace: lists one handle per bookmark.
pub struct BookmarkRootHandle {
    factory: Arc<HandleFactory>,
    url: FileUrl,
}

impl BookmarkRootHandle {
    pub fn new(factory: Arc<HandleFactory>) -> Self {
        Self {
            factory,
            url: FileUrl::synthetic("bookmark", "/"),
        }
    }
}

impl FileHandle for BookmarkRootHandle {
    fn url(&self) -> &FileUrl {
        &self.url
    }

    fn name(&self) -> String {
        "bookmarks".to_string()
    }

    fn exists(&self) -> bool {
        true
    }

    fn is_directory(&self) -> bool {
        true
    }

    fn is_symlink(&self) -> bool {
        false
    }

    fn size(&self) -> u64 {
        0
    }

    fn modified(&self) -> Option<DateTime<Local>> {
        None
    }

    fn permissions(&self) -> Option<Permissions> {
        let (mode, changeable) = BOOKMARK_PERMISSIONS;
        Some(Permissions::new(mode, changeable))
    }

    fn parent(&self) -> Option<HandleRef> {
        None
    }

    fn list(&self) -> VfsResult<Vec<HandleRef>> {
        Ok(self
            .factory
            .bookmarks()
            .iter()
            .map(|b| {
                Box::new(BookmarkHandle::new(b.clone(), Arc::clone(&self.factory))) as HandleRef
            })
            .collect())
    }

    fn resolve_child(&self, name: &str) -> VfsResult<HandleRef> {
        let bookmark = self
            .factory
            .bookmarks()
            .iter()
            .find(|b| b.name == name)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(format!("bookmark://{}", name)))?;
        Ok(Box::new(BookmarkHandle::new(
            bookmark,
            Arc::clone(&self.factory),
        )))
    }

    fn open_read(&self) -> VfsResult<Box<dyn Read + Send>> {
        Err(VfsError::Unsupported("open_read on the bookmark root"))
    }

    fn open_write(&self, _mode: WriteMode) -> VfsResult<Box<dyn Write + Send>> {
        Err(VfsError::Unsupported("open_write on the bookmark root"))
    }

    fn mkdir(&self) -> VfsResult<()> {
        Err(VfsError::Unsupported("mkdir on the bookmark root"))
    }

    fn mkfile(&self) -> VfsResult<()> {
        Err(VfsError::Unsupported("mkfile on the bookmark root"))
    }

    fn delete(&self) -> VfsResult<()> {
        Err(VfsError::Unsupported("delete on the bookmark root"))
    }
}
