use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::archive::{ArchiveContainer, ArchiveEntryInfo};
use crate::vfs::url::FileUrl;
use crate::vfs::{VfsError, VfsResult};

/// Counter for unique spool file names.
static SPOOL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn zip_err(err: zip::result::ZipError) -> VfsError {
    VfsError::Archive(err.to_string())
}

fn spool_path() -> PathBuf {
    let unique = SPOOL_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "openvfs_spool_{}_{}",
        std::process::id(),
        unique
    ))
}

enum StagedOp {
    Put { path: String, spool: PathBuf },
    Mkdir { path: String },
    Delete { path: String },
}

/// Read/write zip container.
///
/// Mutations are staged (file content spooled to temp files) and committed
/// by [`ZipContainer::flush`], which serializes a complete new archive next
/// to the original and renames it into place. A failed flush removes the
/// half-written temp file and leaves the original container untouched.
pub struct ZipContainer {
    path: PathBuf,
    url: FileUrl,
    staged: Mutex<Vec<StagedOp>>,
}

impl ZipContainer {
    /// Opens an existing zip file.
    pub fn open(path: &Path) -> VfsResult<Arc<Self>> {
        if !path.exists() {
            return Err(VfsError::NotFound(path.display().to_string()));
        }
        Ok(Arc::new(Self::with_path(path)))
    }

    /// Addresses a zip file that does not exist yet; the physical file
    /// appears on the first flush.
    pub fn create(path: &Path) -> Arc<Self> {
        Arc::new(Self::with_path(path))
    }

    fn with_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            url: FileUrl::local(&path.to_string_lossy()),
            staged: Mutex::new(Vec::new()),
        }
    }

    fn staged_lock(&self) -> std::sync::MutexGuard<'_, Vec<StagedOp>> {
        // A poisoned lock means a panic mid-staging; the staged list is
        // still structurally valid, so keep going.
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_rebuilt(&self, temp: &Path, ops: &[StagedOp]) -> VfsResult<()> {
        let mut deleted: HashSet<String> = HashSet::new();
        let mut dir_deletes: Vec<String> = Vec::new();
        let mut puts: HashMap<String, &PathBuf> = HashMap::new();
        let mut mkdirs: Vec<&String> = Vec::new();

        for op in ops {
            match op {
                StagedOp::Delete { path } => {
                    deleted.insert(path.clone());
                    dir_deletes.push(format!("{}/", path));
                }
                StagedOp::Put { path, spool } => {
                    puts.insert(path.clone(), spool);
                }
                StagedOp::Mkdir { path } => mkdirs.push(path),
            }
        }

        // Staged entries supersede same-named rows in the old container.
        let removed = |name: &str| -> bool {
            deleted.contains(name)
                || dir_deletes.iter().any(|p| name.starts_with(p.as_str()))
                || puts.contains_key(name)
                || mkdirs.iter().any(|p| p.as_str() == name)
        };

        let out = File::create(temp)?;
        let mut writer = ZipWriter::new(out);
        let options = SimpleFileOptions::default();

        // Carry over surviving entries from the current container without
        // recompressing them.
        if self.path.exists() {
            let mut archive = ZipArchive::new(File::open(&self.path)?).map_err(zip_err)?;
            for index in 0..archive.len() {
                let entry = archive.by_index_raw(index).map_err(zip_err)?;
                let name = entry.name().trim_matches('/').to_string();
                if removed(&name) {
                    continue;
                }
                writer.raw_copy_file(entry).map_err(zip_err)?;
            }
        }

        let mut made: HashSet<&str> = HashSet::new();
        for path in mkdirs {
            if deleted.contains(path) || puts.contains_key(path) || !made.insert(path.as_str()) {
                continue;
            }
            writer
                .add_directory(path.as_str(), options)
                .map_err(zip_err)?;
        }

        for (path, spool) in &puts {
            if deleted.contains(path) {
                continue;
            }
            writer.start_file(path.as_str(), options).map_err(zip_err)?;
            let mut input = File::open(spool)?;
            io::copy(&mut input, &mut writer)?;
        }

        writer.finish().map_err(zip_err)?;
        Ok(())
    }
}

impl ArchiveContainer for ZipContainer {
    fn url(&self) -> &FileUrl {
        &self.url
    }

    fn entries(&self) -> VfsResult<Vec<ArchiveEntryInfo>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut archive = ZipArchive::new(File::open(&self.path)?).map_err(zip_err)?;
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index(index).map_err(zip_err)?;
            let raw_name = entry.name().to_string();
            let path = raw_name.trim_matches('/').to_string();
            if path.is_empty() {
                continue;
            }
            entries.push(ArchiveEntryInfo {
                is_dir: entry.is_dir() || raw_name.ends_with('/'),
                size: entry.size(),
                modified: entry.last_modified().and_then(zip_datetime_to_local),
                mode: entry.unix_mode(),
                path,
            });
        }
        Ok(entries)
    }

    fn read_entry(&self, path: &str) -> VfsResult<Box<dyn Read + Send>> {
        let mut archive = ZipArchive::new(File::open(&self.path)?).map_err(zip_err)?;
        let mut entry = match archive.by_name(path) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(VfsError::NotFound(path.to_string()))
            }
            Err(err) => return Err(zip_err(err)),
        };
        // ZipFile borrows the archive, so the content is buffered before the
        // reader is handed out.
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn stage_put(&self, path: &str) -> VfsResult<Box<dyn Write + Send>> {
        let spool = spool_path();
        let file = File::create(&spool)?;
        self.staged_lock().push(StagedOp::Put {
            path: path.trim_matches('/').to_string(),
            spool,
        });
        Ok(Box::new(file))
    }

    fn stage_mkdir(&self, path: &str) -> VfsResult<()> {
        self.staged_lock().push(StagedOp::Mkdir {
            path: path.trim_matches('/').to_string(),
        });
        Ok(())
    }

    fn stage_delete(&self, path: &str) -> VfsResult<()> {
        self.staged_lock().push(StagedOp::Delete {
            path: path.trim_matches('/').to_string(),
        });
        Ok(())
    }

    fn has_staged(&self) -> bool {
        !self.staged_lock().is_empty()
    }

    fn flush(&self) -> VfsResult<()> {
        let mut staged = self.staged_lock();
        if staged.is_empty() {
            return Ok(());
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| VfsError::InvalidLocation(self.path.display().to_string()))?;
        let temp = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".{}.tmp", file_name));

        debug!(container = %self.path.display(), ops = staged.len(), "rewriting zip container");

        if let Err(err) = self.write_rebuilt(&temp, &staged) {
            // Staged ops are kept so the flush can be retried.
            let _ = fs::remove_file(&temp);
            warn!(container = %self.path.display(), error = %err, "zip rewrite failed");
            return Err(err);
        }

        fs::rename(&temp, &self.path).map_err(|err| {
            let _ = fs::remove_file(&temp);
            VfsError::Io(err)
        })?;

        for op in staged.drain(..) {
            if let StagedOp::Put { spool, .. } = op {
                let _ = fs::remove_file(spool);
            }
        }
        Ok(())
    }
}

fn zip_datetime_to_local(dt: zip::DateTime) -> Option<DateTime<Local>> {
    Local
        .with_ymd_and_hms(
            dt.year() as i32,
            dt.month() as u32,
            dt.day() as u32,
            dt.hour() as u32,
            dt.minute() as u32,
            dt.second() as u32,
        )
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::synthesize_children;

    /// Counter for unique temp directory names.
    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_temp_dir() -> PathBuf {
        let unique_id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir().join(format!(
            "openvfs_zip_test_{}_{}",
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

    fn write_entry(container: &ZipContainer, path: &str, content: &[u8]) {
        let mut writer = container.stage_put(path).unwrap();
        writer.write_all(content).unwrap();
        writer.flush().unwrap();
    }

    fn read_entry_bytes(container: &ZipContainer, path: &str) -> Vec<u8> {
        let mut reader = container.read_entry(path).unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn test_create_flush_and_read_back() {
        let temp_dir = create_temp_dir();
        let container = ZipContainer::create(&temp_dir.join("new.zip"));

        write_entry(&container, "a.txt", b"alpha");
        write_entry(&container, "docs/b.txt", b"beta");
        container.stage_mkdir("empty").unwrap();
        assert!(container.has_staged());

        container.flush().unwrap();
        assert!(!container.has_staged());

        assert_eq!(read_entry_bytes(&container, "a.txt"), b"alpha");
        assert_eq!(read_entry_bytes(&container, "docs/b.txt"), b"beta");

        let entries = container.entries().unwrap();
        let top = synthesize_children(&entries, "");
        let names: Vec<&str> = top.iter().map(|e| e.path.as_str()).collect();
        assert!(names.contains(&"a.txt"));
        assert!(names.contains(&"docs"));
        assert!(names.contains(&"empty"));

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_staged_mutations_invisible_until_flush() {
        let temp_dir = create_temp_dir();
        let container = ZipContainer::create(&temp_dir.join("a.zip"));
        write_entry(&container, "first.txt", b"1");
        container.flush().unwrap();

        write_entry(&container, "second.txt", b"2");
        let names: Vec<String> = container
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["first.txt"]);

        container.flush().unwrap();
        let names: Vec<String> = container
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert!(names.contains(&"second.txt".to_string()));

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_replace_and_delete_in_one_session() {
        let temp_dir = create_temp_dir();
        let container = ZipContainer::create(&temp_dir.join("m.zip"));
        write_entry(&container, "keep.txt", b"keep");
        write_entry(&container, "replace.txt", b"old");
        write_entry(&container, "drop.txt", b"drop");
        container.flush().unwrap();

        // Three staged mutations: replace one entry, delete another, add a
        // third. One flush must reflect all of them.
        write_entry(&container, "replace.txt", b"new");
        container.stage_delete("drop.txt").unwrap();
        write_entry(&container, "added.txt", b"added");
        container.flush().unwrap();

        assert_eq!(read_entry_bytes(&container, "keep.txt"), b"keep");
        assert_eq!(read_entry_bytes(&container, "replace.txt"), b"new");
        assert_eq!(read_entry_bytes(&container, "added.txt"), b"added");
        assert!(matches!(
            container.read_entry("drop.txt"),
            Err(VfsError::NotFound(_))
        ));

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_directory_delete_removes_subtree() {
        let temp_dir = create_temp_dir();
        let container = ZipContainer::create(&temp_dir.join("d.zip"));
        write_entry(&container, "docs/a.txt", b"a");
        write_entry(&container, "docs/deep/b.txt", b"b");
        write_entry(&container, "top.txt", b"t");
        container.flush().unwrap();

        container.stage_delete("docs").unwrap();
        container.flush().unwrap();

        let names: Vec<String> = container
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["top.txt"]);

        cleanup_temp_dir(&temp_dir);
    }

    #[test]
    fn test_failed_flush_leaves_original_untouched() {
        let temp_dir = create_temp_dir();
        let zip_path = temp_dir.join("orig.zip");
        let container = ZipContainer::create(&zip_path);
        write_entry(&container, "a.txt", b"original");
        container.flush().unwrap();
        let before = fs::read(&zip_path).unwrap();

        // Stage a put whose spool file is gone: the rebuild must fail.
        {
            let mut staged = container.staged_lock();
            staged.push(StagedOp::Put {
                path: "broken.txt".to_string(),
                spool: temp_dir.join("missing_spool"),
            });
        }
        assert!(container.flush().is_err());

        let after = fs::read(&zip_path).unwrap();
        assert_eq!(before, after, "failed flush must not modify the container");
        // Staged ops survive a failed flush so it can be retried.
        assert!(container.has_staged());

        cleanup_temp_dir(&temp_dir);
    }
}
