use std::fs;
use std::path::Path;

use crate::vfs::{VfsError, VfsResult};

/// Fixed-capacity ring of shell commands.
///
/// Adding to a full ring evicts the oldest entry. Owned by a single thread;
/// there is no internal locking, and iterating while inserting is not
/// supported.
pub struct ShellHistory {
    /// One spare slot distinguishes full from empty.
    buf: Vec<Option<String>>,
    head: usize,
    tail: usize,
}

impl ShellHistory {
    pub fn new(capacity: usize) -> Self {
        let slots = capacity.max(1) + 1;
        Self {
            buf: vec![None; slots],
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn len(&self) -> usize {
        (self.tail + self.buf.len() - self.head) % self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Appends a command. Empty and whitespace-only commands are ignored.
    /// At capacity, the oldest entry is evicted.
    pub fn add(&mut self, command: &str) {
        if command.trim().is_empty() {
            return;
        }

        self.buf[self.tail] = Some(command.to_string());
        self.tail = (self.tail + 1) % self.buf.len();

        if self.tail == self.head {
            self.buf[self.head] = None;
            self.head = (self.head + 1) % self.buf.len();
        }
    }

    /// Iterates from oldest to newest. The iterator is finite and
    /// non-restartable: once exhausted it keeps returning `None`.
    pub fn iter(&self) -> HistoryIter<'_> {
        HistoryIter {
            history: self,
            index: self.head,
        }
    }

    /// Loads history from a JSON list, oldest first. Entries beyond
    /// capacity fall off the head, same as live insertion.
    pub fn load(path: &Path, capacity: usize) -> VfsResult<Self> {
        let content = fs::read_to_string(path)?;
        let commands: Vec<String> = serde_json::from_str(&content)
            .map_err(|e| VfsError::Other(format!("Invalid history file: {}", e)))?;
        let mut history = Self::new(capacity);
        for command in &commands {
            history.add(command);
        }
        Ok(history)
    }

    /// Writes the history as an ordered JSON list, oldest first. Atomic
    /// write pattern: temp file first, then rename.
    pub fn save(&self, path: &Path) -> VfsResult<()> {
        let commands: Vec<&str> = self.iter().collect();
        let content = serde_json::to_string_pretty(&commands)
            .map_err(|e| VfsError::Other(format!("Failed to encode history: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

pub struct HistoryIter<'a> {
    history: &'a ShellHistory,
    index: usize,
}

impl<'a> Iterator for HistoryIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.index == self.history.tail {
            return None;
        }
        let value = self.history.buf[self.index].as_deref();
        self.index = (self.index + 1) % self.history.buf.len();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn create_temp_dir() -> PathBuf {
        let unique_id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let temp_dir = std::env::temp_dir().join(format!(
            "openvfs_history_test_{}_{}",
            std::process::id(),
            unique_id
        ));
        let _ = fs::remove_dir_all(&temp_dir);
        fs::create_dir_all(&temp_dir).expect("Failed to create temp dir");
        temp_dir
    }

    #[test]
    fn test_insertion_order() {
        let mut history = ShellHistory::new(10);
        history.add("ls");
        history.add("cd /tmp");
        history.add("make");

        let commands: Vec<&str> = history.iter().collect();
        assert_eq!(commands, vec!["ls", "cd /tmp", "make"]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_empty_command_ignored() {
        let mut history = ShellHistory::new(5);
        history.add("");
        history.add("   ");
        history.add("\t\n");
        assert!(history.is_empty());
        history.add("real");
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut history = ShellHistory::new(3);
        history.add("one");
        history.add("two");
        history.add("three");
        history.add("four");

        let commands: Vec<&str> = history.iter().collect();
        assert_eq!(commands, vec!["two", "three", "four"]);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_capacity_exactly_filled() {
        let mut history = ShellHistory::new(3);
        history.add("a");
        history.add("b");
        history.add("c");
        let commands: Vec<&str> = history.iter().collect();
        assert_eq!(commands, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_wraparound_repeatedly() {
        let mut history = ShellHistory::new(2);
        for i in 0..7 {
            history.add(&format!("cmd{}", i));
        }
        let commands: Vec<&str> = history.iter().collect();
        assert_eq!(commands, vec!["cmd5", "cmd6"]);
    }

    #[test]
    fn test_iterator_not_restartable() {
        let mut history = ShellHistory::new(4);
        history.add("a");
        history.add("b");

        let mut iter = history.iter();
        assert_eq!(iter.next(), Some("a"));
        assert_eq!(iter.next(), Some("b"));
        assert_eq!(iter.next(), None);
        // Exhausted for good.
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = create_temp_dir();
        let path = temp_dir.join("shell_history.json");

        let mut history = ShellHistory::new(5);
        history.add("ls -la");
        history.add("grep foo bar.txt");
        history.save(&path).unwrap();

        let restored = ShellHistory::load(&path, 5).unwrap();
        let commands: Vec<&str> = restored.iter().collect();
        assert_eq!(commands, vec!["ls -la", "grep foo bar.txt"]);

        let _ = fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_load_respects_smaller_capacity() {
        let temp_dir = create_temp_dir();
        let path = temp_dir.join("h.json");

        let mut history = ShellHistory::new(10);
        for i in 0..6 {
            history.add(&format!("c{}", i));
        }
        history.save(&path).unwrap();

        let restored = ShellHistory::load(&path, 3).unwrap();
        let commands: Vec<&str> = restored.iter().collect();
        assert_eq!(commands, vec!["c3", "c4", "c5"]);

        let _ = fs::remove_dir_all(&temp_dir);
    }
}
