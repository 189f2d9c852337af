use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::archive::{self, ArchiveEntryHandle};
use crate::vfs::url::FileUrl;
use crate::vfs::{
    validate_filename, CopyHint, FileHandle, HandleRef, Permissions, VfsError, VfsResult, WriteMode,
};

/// Handle over a path on the local filesystem.
///
/// Attribute getters stat the path on every call; none of them follow
/// symlinks, so a link to a directory reports as a link, not a directory.
pub struct LocalHandle {
    path: PathBuf,
    url: FileUrl,
}

impl LocalHandle {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            url: FileUrl::local(&path.to_string_lossy()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stat(&self) -> Option<fs::Metadata> {
        fs::symlink_metadata(&self.path).ok()
    }

    fn is_archive_file(&self) -> bool {
        archive::is_archive_name(&self.name())
            && self.stat().map(|m| m.is_file()).unwrap_or(false)
    }

    /// Rejects device files, sockets and pipes before a stream open.
    fn check_streamable(&self) -> VfsResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;
            if let Some(meta) = self.stat() {
                let file_type = meta.file_type();
                if file_type.is_block_device()
                    || file_type.is_char_device()
                    || file_type.is_fifo()
                    || file_type.is_socket()
                {
                    return Err(VfsError::Unsupported(
                        "cannot stream special file (device, socket, or pipe)",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl FileHandle for LocalHandle {
    fn url(&self) -> &FileUrl {
        &self.url
    }

    fn exists(&self) -> bool {
        self.stat().is_some()
    }

    fn is_directory(&self) -> bool {
        self.stat().map(|m| m.file_type().is_dir()).unwrap_or(false)
    }

    fn is_browsable(&self) -> bool {
        self.is_directory() || self.is_archive_file()
    }

    fn is_symlink(&self) -> bool {
        self.stat()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn size(&self) -> u64 {
        self.stat().map(|m| m.len()).unwrap_or(0)
    }

    fn modified(&self) -> Option<DateTime<Local>> {
        self.stat()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Local>::from)
    }

    fn change_modified(&self, when: DateTime<Local>) -> VfsResult<()> {
        let file = File::open(&self.path)?;
        file.set_modified(when.into())?;
        Ok(())
    }

    fn permissions(&self) -> Option<Permissions> {
        let meta = self.stat()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            Some(Permissions::new(meta.permissions().mode(), 0o777))
        }
        #[cfg(not(unix))]
        {
            let mode = if meta.permissions().readonly() {
                0o444
            } else {
                0o666
            };
            Some(Permissions::new(mode, 0o200))
        }
    }

    fn change_permission(&self, bit: u32, enabled: bool) -> VfsResult<()> {
        let current = self
            .permissions()
            .ok_or_else(|| VfsError::NotFound(self.url.normalized()))?;
        if bit & current.changeable_mask() == 0 {
            return Err(VfsError::Unsupported("permission bit not changeable"));
        }
        let new_mode = current.with_bit(bit, enabled).mode();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(new_mode))?;
        }
        #[cfg(not(unix))]
        {
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_readonly(new_mode & 0o200 == 0);
            fs::set_permissions(&self.path, perms)?;
        }
        Ok(())
    }

    fn owner(&self) -> Option<String> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            self.stat().map(|m| m.uid().to_string())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    fn group(&self) -> Option<String> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            self.stat().map(|m| m.gid().to_string())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    fn free_space(&self) -> Option<u64> {
        volume_space(&self.path).map(|(free, _)| free)
    }

    fn total_space(&self) -> Option<u64> {
        volume_space(&self.path).map(|(_, total)| total)
    }

    fn parent(&self) -> Option<HandleRef> {
        let parent = self.path.parent()?;
        Some(Box::new(LocalHandle::new(parent)))
    }

    fn list(&self) -> VfsResult<Vec<HandleRef>> {
        if self.is_archive_file() {
            let container = archive::open_container(&self.path)?;
            return ArchiveEntryHandle::root(container).list();
        }

        let mut children: Vec<HandleRef> = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            children.push(Box::new(LocalHandle::new(&entry.path())));
        }
        Ok(children)
    }

    fn resolve_child(&self, name: &str) -> VfsResult<HandleRef> {
        validate_filename(name)?;
        if self.is_archive_file() {
            let container = archive::open_container(&self.path)?;
            return ArchiveEntryHandle::root(container).resolve_child(name);
        }
        Ok(Box::new(LocalHandle::new(&self.path.join(name))))
    }

    fn open_read(&self) -> VfsResult<Box<dyn Read + Send>> {
        self.check_streamable()?;
        Ok(Box::new(File::open(&self.path)?))
    }

    fn open_write(&self, mode: WriteMode) -> VfsResult<Box<dyn Write + Send>> {
        self.check_streamable()?;
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        match mode {
            WriteMode::Truncate => options.truncate(true),
            WriteMode::Append => options.append(true),
        };
        Ok(Box::new(options.open(&self.path)?))
    }

    fn mkdir(&self) -> VfsResult<()> {
        fs::create_dir(&self.path)?;
        Ok(())
    }

    fn mkfile(&self) -> VfsResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        Ok(())
    }

    fn delete(&self) -> VfsResult<()> {
        let meta = fs::symlink_metadata(&self.path)?;
        if meta.file_type().is_symlink() {
            // Remove the link itself, never its target.
            fs::remove_file(&self.path)?;
        } else if meta.is_dir() {
            fs::remove_dir(&self.path)?;
        } else {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn move_hint(&self, dest: &dyn FileHandle) -> CopyHint {
        if dest.url().scheme() == "file" && dest.parent_archive().is_none() {
            CopyHint::Should
        } else {
            CopyHint::MustNot
        }
    }

    fn move_to(&self, dest: &dyn FileHandle) -> VfsResult<bool> {
        if dest.url().scheme() != "file" || dest.parent_archive().is_some() {
            return Ok(false);
        }
        let dest_path = PathBuf::from(dest.url().path());
        match fs::rename(&self.path, &dest_path) {
            Ok(()) => Ok(true),
            // Cross-device: report "no native path" so the caller falls back
            // to copy + delete.
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => Ok(false),
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    fn copy_hint(&self, dest: &dyn FileHandle) -> CopyHint {
        let plain_file = self.stat().map(|m| m.is_file()).unwrap_or(false);
        if plain_file && dest.url().scheme() == "file" && dest.parent_archive().is_none() {
            CopyHint::Should
        } else {
            CopyHint::MustNot
        }
    }

    fn copy_to(&self, dest: &dyn FileHandle) -> VfsResult<bool> {
        if dest.url().scheme() != "file" || dest.parent_archive().is_some() {
            return Ok(false);
        }
        if !self.stat().map(|m| m.is_file()).unwrap_or(false) {
            return Ok(false);
        }
        let dest_path = PathBuf::from(dest.url().path());
        fs::copy(&self.path, &dest_path)?;
        Ok(true)
    }

    fn read_link(&self) -> VfsResult<String> {
        let target = fs::read_link(&self.path)?;
        Ok(target.to_string_lossy().to_string())
    }

    fn create_symlink(&self, target: &str) -> VfsResult<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, &self.path)?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(VfsError::Unsupported("create_symlink"))
        }
    }
}

#[cfg(unix)]
fn volume_space(path: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as u64;
    Some((stat.f_bavail as u64 * frsize, stat.f_blocks as u64 * frsize))
}

#[cfg(not(unix))]
fn volume_space(_path: &Path) -> Option<(u64, u64)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_temp_dir() -> PathBuf {
        let unique_id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir().join(format!(
            "openvfs_local_test_{}_{}",
            std::process::id(),
            unique_id
        ));
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).expect("Failed to create temp dir");
        temp_dir
    }

    fn cleanup_temp_dir(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    #[test]
    fn test_attributes_of_regular_file() {
        let temp_dir = create_temp_dir();
        let file_path = temp_dir.join("f.txt");
        fs::write(&file_path, b"12345").unwrap();

        let handle = LocalHandle::new(&file_path);
        assert!(handle.exists());
        assert!(!handle.is_directory());
        assert!(!handle.is_symlink());
        assert_eq!(handle.size(), 5);
        assert!(handle.modified().is_some());
        assert_eq!(handle.name(), "f.txt");

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_missing_file_reports_nonexistence() {
        let temp_dir = create_temp_dir();
        let handle = LocalHandle::new(&temp_dir.join("nope"));
        assert!(!handle.exists());
        assert!(!handle.is_directory());
        assert_eq!(handle.size(), 0);
        assert!(handle.modified().is_none());
        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_list_and_resolve_child() {
        let temp_dir = create_temp_dir();
        fs::write(temp_dir.join("a"), b"x").unwrap();
        fs::create_dir(temp_dir.join("sub")).unwrap();

        let handle = LocalHandle::new(&temp_dir);
        let mut names: Vec<String> = handle.list().unwrap().iter().map(|h| h.name()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "sub"]);

        let child = handle.resolve_child("b.txt").unwrap();
        assert!(!child.exists());
        assert_eq!(child.name(), "b.txt");
        assert!(handle.resolve_child("bad/name").is_err());

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_list_fails_on_missing_dir() {
        let temp_dir = create_temp_dir();
        let handle = LocalHandle::new(&temp_dir.join("ghost"));
        assert!(handle.list().is_err());
        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_mkdir_mkfile_delete() {
        let temp_dir = create_temp_dir();
        let dir = LocalHandle::new(&temp_dir.join("d"));
        dir.mkdir().unwrap();
        assert!(dir.is_directory());

        let file = LocalHandle::new(&temp_dir.join("d/f"));
        file.mkfile().unwrap();
        assert!(file.exists());
        // mkfile refuses to clobber.
        assert!(file.mkfile().is_err());

        // Non-empty directory delete fails at the handle level.
        assert!(dir.delete().is_err());
        file.delete().unwrap();
        dir.delete().unwrap();
        assert!(!dir.exists());

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_move_to_same_filesystem() {
        let temp_dir = create_temp_dir();
        let src_path = temp_dir.join("src.txt");
        fs::write(&src_path, b"move me").unwrap();

        let src = LocalHandle::new(&src_path);
        let dest = LocalHandle::new(&temp_dir.join("dst.txt"));
        assert_eq!(src.move_hint(&dest), CopyHint::Should);
        assert!(src.move_to(&dest).unwrap());
        assert!(!src.exists());
        assert_eq!(fs::read(temp_dir.join("dst.txt")).unwrap(), b"move me");

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_native_copy() {
        let temp_dir = create_temp_dir();
        let src_path = temp_dir.join("src.txt");
        fs::write(&src_path, b"data").unwrap();

        let src = LocalHandle::new(&src_path);
        let dest = LocalHandle::new(&temp_dir.join("copy.txt"));
        assert!(src.copy_to(&dest).unwrap());
        assert!(src.exists());
        assert_eq!(fs::read(temp_dir.join("copy.txt")).unwrap(), b"data");

        cleanup_temp_dir(&temp_dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_round_trip() {
        let temp_dir = create_temp_dir();
        fs::write(temp_dir.join("target"), b"t").unwrap();

        let link = LocalHandle::new(&temp_dir.join("link"));
        link.create_symlink("target").unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.read_link().unwrap(), "target");

        // Deleting the link leaves the target alone.
        link.delete().unwrap();
        assert!(!link.exists());
        assert!(temp_dir.join("target").exists());

        cleanup_temp_dir(&temp_dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_to_dir_is_not_a_directory() {
        let temp_dir = create_temp_dir();
        fs::create_dir(temp_dir.join("real")).unwrap();
        std::os::unix::fs::symlink(temp_dir.join("real"), temp_dir.join("link")).unwrap();

        let link = LocalHandle::new(&temp_dir.join("link"));
        assert!(link.is_symlink());
        assert!(!link.is_directory());

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_open_write_append() {
        let temp_dir = create_temp_dir();
        let path = temp_dir.join("log.txt");
        fs::write(&path, b"one").unwrap();

        let handle = LocalHandle::new(&path);
        let mut writer = handle.open_write(WriteMode::Append).unwrap();
        writer.write_all(b"two").unwrap();
        drop(writer);
        assert_eq!(fs::read(&path).unwrap(), b"onetwo");

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_archive_file_is_browsable() {
        let temp_dir = create_temp_dir();
        let zip_path = temp_dir.join("a.zip");
        let container = crate::archive::zip::ZipContainer::create(&zip_path);
        let mut writer = container.stage_put("inner.txt").unwrap();
        writer.write_all(b"zip content").unwrap();
        drop(writer);
        container.flush().unwrap();

        let handle = LocalHandle::new(&zip_path);
        assert!(!handle.is_directory());
        assert!(handle.is_browsable());
        let children = handle.list().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "inner.txt");

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_change_modified() {
        let temp_dir = create_temp_dir();
        let path = temp_dir.join("dated.txt");
        fs::write(&path, b"x").unwrap();

        let handle = LocalHandle::new(&path);
        let past = Local::now() - chrono::Duration::days(3);
        handle.change_modified(past).unwrap();
        let reported = handle.modified().unwrap();
        assert!((reported - past).num_seconds().abs() < 2);

        cleanup_temp_dir(&temp_dir);
    }
}
