use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::vfs::bookmark::Bookmark;
use crate::vfs::sftp::RemoteProfile;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Stream copy chunk size in KiB.
    #[serde(default = "default_copy_buffer_kib")]
    pub copy_buffer_kib: usize,
    /// Capacity of the shell history ring.
    #[serde(default = "default_shell_history_size")]
    pub shell_history_size: usize,
    /// Remote server profiles for SSH/SFTP connections
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote_profiles: Vec<RemoteProfile>,
    /// Bookmarked locations exposed under `bookmark://`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bookmarks: Vec<Bookmark>,
}

fn default_copy_buffer_kib() -> usize {
    64
}

fn default_shell_history_size() -> usize {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            copy_buffer_kib: default_copy_buffer_kib(),
            shell_history_size: default_shell_history_size(),
            remote_profiles: Vec::new(),
            bookmarks: Vec::new(),
        }
    }
}

impl Settings {
    /// Returns the config directory path (~/.openvfs)
    pub fn config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".openvfs"))
    }

    /// Returns the config file path (~/.openvfs/settings.json)
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("settings.json"))
    }

    /// Returns the credential store file path (~/.openvfs/credentials.json)
    pub fn credentials_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("credentials.json"))
    }

    /// Returns the shell history file path (~/.openvfs/shell_history.json)
    pub fn shell_history_path() -> Option<PathBuf> {
        Self::config_dir().map(|d| d.join("shell_history.json"))
    }

    /// Ensures the config directory and a default settings file exist.
    pub fn ensure_config_exists() {
        if let Some(config_dir) = Self::config_dir() {
            if !config_dir.exists() && fs::create_dir_all(&config_dir).is_ok() {
                // Profiles may hold obfuscated passwords: user-only access.
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = fs::Permissions::from_mode(0o700);
                    let _ = fs::set_permissions(&config_dir, perms);
                }
            }
        }

        if let Some(config_path) = Self::config_path() {
            if !config_path.exists() {
                let _ = Self::default().save();
            }
        }
    }

    /// Loads settings from the config file, returns default if not found or invalid
    pub fn load() -> Self {
        Self::load_with_error().unwrap_or_default()
    }

    /// Loads settings from the config file with error information
    pub fn load_with_error() -> Result<Self, String> {
        Self::ensure_config_exists();

        let config_path =
            Self::config_path().ok_or_else(|| "Could not determine config path".to_string())?;

        let content = fs::read_to_string(&config_path)
            .map_err(|e| format!("Failed to read settings file: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Invalid JSON in settings.json: {}", e))
    }

    /// Saves settings to the config file using atomic write pattern
    pub fn save(&self) -> io::Result<()> {
        let Some(config_dir) = Self::config_dir() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "Could not determine config directory",
            ));
        };

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = fs::Permissions::from_mode(0o700);
                let _ = fs::set_permissions(&config_dir, perms);
            }
        }

        let config_path = config_dir.join("settings.json");
        let temp_path = config_dir.join("settings.json.tmp");
        let content = serde_json::to_string_pretty(self)?;

        // Atomic write: write to temp file first, then rename
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, &config_path)?;

        Ok(())
    }

    /// Copy buffer size in bytes, clamped to something sane.
    pub fn copy_buffer_bytes(&self) -> usize {
        self.copy_buffer_kib.clamp(4, 16 * 1024) * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.copy_buffer_kib, 64);
        assert_eq!(settings.shell_history_size, 100);
        assert!(settings.remote_profiles.is_empty());
        assert!(settings.bookmarks.is_empty());
    }

    #[test]
    fn test_parse_partial_json() {
        let json = r#"{"shell_history_size": 25}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.shell_history_size, 25);
        assert_eq!(settings.copy_buffer_kib, 64);
    }

    #[test]
    fn test_copy_buffer_clamped() {
        let settings = Settings {
            copy_buffer_kib: 1,
            ..Settings::default()
        };
        assert_eq!(settings.copy_buffer_bytes(), 4 * 1024);
        let settings = Settings {
            copy_buffer_kib: 1_000_000,
            ..Settings::default()
        };
        assert_eq!(settings.copy_buffer_bytes(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_bookmarks_round_trip() {
        let json = r#"{"bookmarks":[{"name":"work","location":"/srv/work"}]}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.bookmarks.len(), 1);
        assert_eq!(settings.bookmarks[0].name, "work");
        let out = serde_json::to_string(&settings).unwrap();
        assert!(out.contains("/srv/work"));
    }
}
