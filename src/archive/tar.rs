use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};

use crate::archive::{ArchiveContainer, ArchiveEntryInfo};
use crate::vfs::url::FileUrl;
use crate::vfs::{VfsError, VfsResult};

/// Read-only tar container. Tar write access would mean re-streaming the
/// whole file for every mutation; packing goes through the zip backend
/// instead.
pub struct TarContainer {
    path: PathBuf,
    url: FileUrl,
}

impl TarContainer {
    pub fn open(path: &Path) -> VfsResult<Arc<Self>> {
        if !path.exists() {
            return Err(VfsError::NotFound(path.display().to_string()));
        }
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            url: FileUrl::local(&path.to_string_lossy()),
        }))
    }

    fn read_only(&self) -> VfsError {
        VfsError::ReadOnlyArchive(self.url.normalized())
    }
}

impl ArchiveContainer for TarContainer {
    fn url(&self) -> &FileUrl {
        &self.url
    }

    fn entries(&self) -> VfsResult<Vec<ArchiveEntryInfo>> {
        let mut archive = tar::Archive::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            let path = entry
                .path()?
                .to_string_lossy()
                .trim_matches('/')
                .to_string();
            if path.is_empty() || path == "." {
                continue;
            }
            let header = entry.header();
            entries.push(ArchiveEntryInfo {
                is_dir: header.entry_type().is_dir(),
                size: header.size().unwrap_or(0),
                modified: header
                    .mtime()
                    .ok()
                    .and_then(|t| Local.timestamp_opt(t as i64, 0).single()),
                mode: header.mode().ok(),
                path,
            });
        }
        Ok(entries)
    }

    fn read_entry(&self, path: &str) -> VfsResult<Box<dyn Read + Send>> {
        // Tar is sequential: scan to the matching header, then buffer the
        // content since the entry reader borrows the archive.
        let mut archive = tar::Archive::new(File::open(&self.path)?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry
                .path()?
                .to_string_lossy()
                .trim_matches('/')
                .to_string();
            if entry_path == path {
                let mut data = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
                entry.read_to_end(&mut data)?;
                return Ok(Box::new(Cursor::new(data)));
            }
        }
        Err(VfsError::NotFound(path.to_string()))
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn stage_put(&self, _path: &str) -> VfsResult<Box<dyn Write + Send>> {
        Err(self.read_only())
    }

    fn stage_mkdir(&self, _path: &str) -> VfsResult<()> {
        Err(self.read_only())
    }

    fn stage_delete(&self, _path: &str) -> VfsResult<()> {
        Err(self.read_only())
    }

    fn has_staged(&self) -> bool {
        false
    }

    fn flush(&self) -> VfsResult<()> {
        Err(self.read_only())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::synthesize_children;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_temp_dir() -> PathBuf {
        let unique_id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir().join(format!(
            "openvfs_tar_test_{}_{}",
            std::process::id(),
            unique_id
        ));
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).expect("Failed to create temp dir");
        temp_dir
    }

    fn build_sample_tar(path: &Path) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);

        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "hello.txt", &b"hello"[..])
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o600);
        header.set_cksum();
        builder
            .append_data(&mut header, "sub/inner.txt", &b"abc"[..])
            .unwrap();

        builder.finish().unwrap();
    }

    #[test]
    fn test_list_and_read() {
        let temp_dir = create_temp_dir();
        let tar_path = temp_dir.join("sample.tar");
        build_sample_tar(&tar_path);

        let container = TarContainer::open(&tar_path).unwrap();
        let entries = container.entries().unwrap();
        let top = synthesize_children(&entries, "");
        let names: Vec<&str> = top.iter().map(|e| e.path.as_str()).collect();
        assert!(names.contains(&"hello.txt"));
        assert!(names.contains(&"sub"));

        let mut reader = container.read_entry("sub/inner.txt").unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"abc");

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_writes_rejected() {
        let temp_dir = create_temp_dir();
        let tar_path = temp_dir.join("ro.tar");
        build_sample_tar(&tar_path);

        let container = TarContainer::open(&tar_path).unwrap();
        assert!(!container.is_writable());
        assert!(matches!(
            container.stage_delete("hello.txt"),
            Err(VfsError::ReadOnlyArchive(_))
        ));
        assert!(container.stage_put("x").is_err());

        let _ = fs::remove_dir_all(&temp_dir);
    }
}
