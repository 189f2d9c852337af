use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::vfs::url::FileUrl;
use crate::vfs::{
    validate_filename, CopyHint, FileHandle, HandleRef, Permissions, VfsError, VfsResult, WriteMode,
};

pub mod tar;
pub mod zip;

/// One row of a container's flat entry table.
#[derive(Debug, Clone)]
pub struct ArchiveEntryInfo {
    /// Internal path, `/`-separated, no leading or trailing slash.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Local>>,
    pub mode: Option<u32>,
}

/// A physical archive file exposing its contents as entries.
///
/// Readers enumerate and stream entries. Writable containers additionally
/// accept staged mutations (put/mkdir/delete) that only become visible after
/// [`ArchiveContainer::flush`], which rewrites the whole container file
/// atomically: either the new container replaces the old one, or the old one
/// is left byte-for-byte untouched.
pub trait ArchiveContainer: Send + Sync {
    /// Location of the container file itself.
    fn url(&self) -> &FileUrl;

    /// Flat entry table, read from the physical container. Staged mutations
    /// are not reflected until flushed.
    fn entries(&self) -> VfsResult<Vec<ArchiveEntryInfo>>;

    /// Streams one entry's content.
    fn read_entry(&self, path: &str) -> VfsResult<Box<dyn Read + Send>>;

    fn is_writable(&self) -> bool;

    /// Stages a file entry; content is whatever has been written to the
    /// returned stream by the time `flush` runs. Replaces any existing entry
    /// at the same path.
    fn stage_put(&self, path: &str) -> VfsResult<Box<dyn Write + Send>>;

    /// Stages a directory entry.
    fn stage_mkdir(&self, path: &str) -> VfsResult<()>;

    /// Stages removal of an entry. Removing a directory removes everything
    /// beneath it.
    fn stage_delete(&self, path: &str) -> VfsResult<()>;

    /// True when staged mutations are waiting for a flush.
    fn has_staged(&self) -> bool;

    /// Commits all staged mutations by rewriting the container file.
    fn flush(&self) -> VfsResult<()>;
}

/// True for filenames this crate can open as an archive container.
pub fn is_archive_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".zip") || lower.ends_with(".jar") || lower.ends_with(".tar")
}

/// Opens the container for a local archive file, picking the backend from
/// the extension.
pub fn open_container(path: &Path) -> VfsResult<Arc<dyn ArchiveContainer>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".zip") || name.ends_with(".jar") {
        Ok(zip::ZipContainer::open(path)?)
    } else if name.ends_with(".tar") {
        Ok(tar::TarContainer::open(path)?)
    } else {
        Err(VfsError::Archive(format!(
            "unrecognized archive format: {}",
            path.display()
        )))
    }
}

/// Child rows of `prefix` synthesized from a flat entry table.
///
/// Formats with no native directory concept only list leaf paths; a
/// directory like `docs/` exists solely because `docs/a.txt` does. This
/// walks path segments and emits one row per distinct direct child,
/// preferring an explicit entry's metadata when the format has one.
pub fn synthesize_children(entries: &[ArchiveEntryInfo], prefix: &str) -> Vec<ArchiveEntryInfo> {
    let prefix = normalize_entry_path(prefix);
    let mut out: Vec<ArchiveEntryInfo> = Vec::new();

    for entry in entries {
        let rest = match strip_prefix(&entry.path, &prefix) {
            Some(rest) if !rest.is_empty() => rest,
            _ => continue,
        };

        match rest.split_once('/') {
            None => {
                // Direct child with an explicit entry.
                match out.iter_mut().find(|c| c.path == entry.path) {
                    Some(existing) => {
                        // An explicit row wins over a previously synthesized one.
                        *existing = entry.clone();
                    }
                    None => out.push(entry.clone()),
                }
            }
            Some((first, _)) => {
                let child_path = if prefix.is_empty() {
                    first.to_string()
                } else {
                    format!("{}/{}", prefix, first)
                };
                if !out.iter().any(|c| c.path == child_path) {
                    out.push(ArchiveEntryInfo {
                        path: child_path,
                        is_dir: true,
                        size: 0,
                        modified: None,
                        mode: None,
                    });
                }
            }
        }
    }

    out
}

fn normalize_entry_path(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// A [`FileHandle`] addressing one entry inside a container.
///
/// The empty entry path addresses the container root, which is browsable but
/// not a directory — entering it is a namespace change, the file itself is
/// still a regular file on its own filesystem.
pub struct ArchiveEntryHandle {
    container: Arc<dyn ArchiveContainer>,
    entry_path: String,
    url: FileUrl,
}

impl ArchiveEntryHandle {
    pub fn new(container: Arc<dyn ArchiveContainer>, entry_path: &str) -> Self {
        let entry_path = normalize_entry_path(entry_path);
        let url = entry_url(container.url(), &entry_path);
        Self {
            container,
            entry_path,
            url,
        }
    }

    pub fn root(container: Arc<dyn ArchiveContainer>) -> Self {
        Self::new(container, "")
    }

    pub fn container(&self) -> &Arc<dyn ArchiveContainer> {
        &self.container
    }

    pub fn entry_path(&self) -> &str {
        &self.entry_path
    }

    fn is_root(&self) -> bool {
        self.entry_path.is_empty()
    }

    /// Current row for this entry, synthesizing directory rows that only
    /// exist as path prefixes of deeper entries.
    fn info(&self) -> Option<ArchiveEntryInfo> {
        let entries = self.container.entries().ok()?;
        if let Some(found) = entries.iter().find(|e| e.path == self.entry_path) {
            return Some(found.clone());
        }
        let dir_prefix = format!("{}/", self.entry_path);
        if entries.iter().any(|e| e.path.starts_with(&dir_prefix)) {
            return Some(ArchiveEntryInfo {
                path: self.entry_path.clone(),
                is_dir: true,
                size: 0,
                modified: None,
                mode: None,
            });
        }
        None
    }

    fn require_writable(&self) -> VfsResult<()> {
        if self.container.is_writable() {
            Ok(())
        } else {
            Err(VfsError::ReadOnlyArchive(self.container.url().normalized()))
        }
    }
}

fn entry_url(container_url: &FileUrl, entry_path: &str) -> FileUrl {
    if entry_path.is_empty() {
        container_url.clone()
    } else {
        let mut url = container_url.clone();
        for segment in entry_path.split('/') {
            url = url.child(segment);
        }
        url
    }
}

impl FileHandle for ArchiveEntryHandle {
    fn url(&self) -> &FileUrl {
        &self.url
    }

    fn name(&self) -> String {
        if self.is_root() {
            self.container.url().name()
        } else {
            self.entry_path
                .rsplit('/')
                .next()
                .unwrap_or(&self.entry_path)
                .to_string()
        }
    }

    fn exists(&self) -> bool {
        if self.is_root() {
            return true;
        }
        self.info().is_some()
    }

    fn is_directory(&self) -> bool {
        if self.is_root() {
            return false;
        }
        self.info().map(|i| i.is_dir).unwrap_or(false)
    }

    fn is_browsable(&self) -> bool {
        self.is_root() || self.is_directory()
    }

    fn is_symlink(&self) -> bool {
        false
    }

    fn size(&self) -> u64 {
        self.info().map(|i| i.size).unwrap_or(0)
    }

    fn modified(&self) -> Option<DateTime<Local>> {
        self.info().and_then(|i| i.modified)
    }

    fn permissions(&self) -> Option<Permissions> {
        let mode = self.info().and_then(|i| i.mode)?;
        // Entry modes are recorded at pack time; nothing here can chmod them
        // short of a rewrite, so the changeable mask is empty.
        Some(Permissions::new(mode, 0))
    }

    fn parent(&self) -> Option<HandleRef> {
        if self.is_root() {
            return None;
        }
        match self.entry_path.rsplit_once('/') {
            Some((parent, _)) => Some(Box::new(ArchiveEntryHandle::new(
                Arc::clone(&self.container),
                parent,
            ))),
            None => Some(Box::new(ArchiveEntryHandle::root(Arc::clone(
                &self.container,
            )))),
        }
    }

    fn parent_archive(&self) -> Option<Arc<dyn ArchiveContainer>> {
        Some(Arc::clone(&self.container))
    }

    fn list(&self) -> VfsResult<Vec<HandleRef>> {
        if !self.is_browsable() {
            return Err(VfsError::NotFound(self.url.normalized()));
        }
        let entries = self.container.entries()?;
        let children = synthesize_children(&entries, &self.entry_path);
        Ok(children
            .into_iter()
            .map(|c| {
                Box::new(ArchiveEntryHandle::new(Arc::clone(&self.container), &c.path))
                    as HandleRef
            })
            .collect())
    }

    fn resolve_child(&self, name: &str) -> VfsResult<HandleRef> {
        validate_filename(name)?;
        let child_path = if self.is_root() {
            name.to_string()
        } else {
            format!("{}/{}", self.entry_path, name)
        };
        Ok(Box::new(ArchiveEntryHandle::new(
            Arc::clone(&self.container),
            &child_path,
        )))
    }

    fn open_read(&self) -> VfsResult<Box<dyn Read + Send>> {
        if self.is_browsable() {
            return Err(VfsError::Unsupported("open_read on a directory entry"));
        }
        self.container.read_entry(&self.entry_path)
    }

    fn open_write(&self, mode: WriteMode) -> VfsResult<Box<dyn Write + Send>> {
        self.require_writable()?;
        if mode == WriteMode::Append {
            // Entries are rewritten whole at flush time; there is no byte
            // position to resume from.
            return Err(VfsError::Unsupported("append into an archive entry"));
        }
        self.container.stage_put(&self.entry_path)
    }

    fn mkdir(&self) -> VfsResult<()> {
        self.require_writable()?;
        self.container.stage_mkdir(&self.entry_path)
    }

    fn mkfile(&self) -> VfsResult<()> {
        self.require_writable()?;
        let mut writer = self.container.stage_put(&self.entry_path)?;
        writer.flush()?;
        Ok(())
    }

    fn delete(&self) -> VfsResult<()> {
        self.require_writable()?;
        self.container.stage_delete(&self.entry_path)
    }

    fn move_hint(&self, _dest: &dyn FileHandle) -> CopyHint {
        CopyHint::MustNot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, is_dir: bool, size: u64) -> ArchiveEntryInfo {
        ArchiveEntryInfo {
            path: path.to_string(),
            is_dir,
            size,
            modified: None,
            mode: None,
        }
    }

    #[test]
    fn test_synthesize_children_top_level() {
        let entries = vec![
            entry("a.txt", false, 3),
            entry("docs/readme.md", false, 10),
            entry("docs/deep/x", false, 1),
        ];
        let children = synthesize_children(&entries, "");
        let names: Vec<&str> = children.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "docs"]);
        assert!(children[1].is_dir);
    }

    #[test]
    fn test_synthesize_children_nested() {
        let entries = vec![
            entry("docs/readme.md", false, 10),
            entry("docs/deep/x", false, 1),
        ];
        let children = synthesize_children(&entries, "docs");
        let names: Vec<&str> = children.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(names, vec!["docs/readme.md", "docs/deep"]);
    }

    #[test]
    fn test_synthesize_children_explicit_dir_row_wins() {
        // Formats with native directory entries list them explicitly; the
        // explicit row must replace the synthesized placeholder.
        let entries = vec![
            entry("docs/a", false, 1),
            entry("docs", true, 0),
        ];
        let children = synthesize_children(&entries, "");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, "docs");
        assert!(children[0].is_dir);
    }

    #[test]
    fn test_is_archive_name() {
        assert!(is_archive_name("a.zip"));
        assert!(is_archive_name("A.ZIP"));
        assert!(is_archive_name("lib.jar"));
        assert!(is_archive_name("backup.tar"));
        assert!(!is_archive_name("notes.txt"));
        assert!(!is_archive_name("tarball"));
    }
}
