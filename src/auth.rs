use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vfs::url::FileUrl;
use crate::vfs::{VfsError, VfsResult};

// Obfuscation key for stored passwords (NOT real encryption — prevents
// casual viewing only)
const OBFUSCATION_KEY: &[u8] = b"openvfs_credential_v1_key";

/// Obfuscate a string for storage (XOR + base64, prefixed with "enc:")
pub fn obfuscate(plaintext: &str) -> String {
    let xored: Vec<u8> = plaintext
        .as_bytes()
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ OBFUSCATION_KEY[i % OBFUSCATION_KEY.len()])
        .collect();
    use base64::Engine;
    format!("enc:{}", base64::engine::general_purpose::STANDARD.encode(&xored))
}

/// Deobfuscate a stored string (reverse of obfuscate, with plaintext fallback)
pub fn deobfuscate(stored: &str) -> String {
    if let Some(encoded) = stored.strip_prefix("enc:") {
        use base64::Engine;
        if let Ok(xored) = base64::engine::general_purpose::STANDARD.decode(encoded) {
            let plain: Vec<u8> = xored
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ OBFUSCATION_KEY[i % OBFUSCATION_KEY.len()])
                .collect();
            return String::from_utf8(plain).unwrap_or_else(|_| stored.to_string());
        }
    }
    // Fallback: treat as plaintext (backward compatibility)
    stored.to_string()
}

pub(crate) mod obfuscated_string {
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::{deobfuscate, obfuscate};

    pub fn serialize<S>(value: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&obfuscate(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(deobfuscate(&s))
    }
}

pub(crate) mod obfuscated_option_string {
    use serde::{self, Deserialize, Deserializer, Serializer};

    use super::{deobfuscate, obfuscate};

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(&obfuscate(v)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<String>::deserialize(deserializer)?;
        Ok(opt.map(|s| deobfuscate(&s)))
    }
}

/// A login/password pair for one remote location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub login: String,
    #[serde(with = "obfuscated_string")]
    pub password: String,
}

impl Credential {
    pub fn new(login: &str, password: &str) -> Self {
        Self {
            login: login.to_string(),
            password: password.to_string(),
        }
    }
}

/// Table mapping normalized locations (credentials stripped) to credentials.
///
/// Lookup tries an exact key first, then falls back to the stored key that
/// is the longest string prefix of the query. When two keys of equal maximal
/// length both match, which one wins is unspecified — it depends on map
/// iteration order and callers must not rely on it.
///
/// The table is shared and mutable from any thread; each operation locks the
/// map, so readers racing a `put` see either the old entry or the new one,
/// never a torn value.
pub struct CredentialStore {
    entries: Mutex<HashMap<String, Credential>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Credential>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upserts the credential for a normalized location key.
    pub fn put(&self, key: &str, credential: Credential) {
        debug!(key, login = %credential.login, "storing credential");
        self.lock().insert(key.to_string(), credential);
    }

    /// Exact match first, then the longest stored key that prefixes `key`.
    pub fn get(&self, key: &str) -> Option<Credential> {
        let entries = self.lock();
        if let Some(found) = entries.get(key) {
            return Some(found.clone());
        }

        let mut best: Option<(&String, &Credential)> = None;
        for (stored_key, credential) in entries.iter() {
            if key.starts_with(stored_key.as_str()) {
                match best {
                    Some((best_key, _)) if stored_key.len() <= best_key.len() => {}
                    _ => best = Some((stored_key, credential)),
                }
            }
        }
        best.map(|(_, c)| c.clone())
    }

    /// Removes the entry under exactly this key. Prefix matches are not
    /// touched.
    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Observe-and-learn step used when resolving a location:
    /// a URL that carries embedded credentials has them recorded under its
    /// stripped key; a URL without credentials gets the best stored match
    /// injected, if any.
    pub fn authenticate(&self, url: &mut FileUrl) {
        let key = url.normalized();
        if let (Some(login), password) = (url.login(), url.password()) {
            self.put(&key, Credential::new(login, password.unwrap_or("")));
        } else if let Some(found) = self.get(&key) {
            url.set_credentials(&found.login, &found.password);
        }
    }

    /// Writes the table to disk; passwords are obfuscated by the serde
    /// adapter. Atomic write pattern: temp file first, then rename.
    pub fn save(&self, path: &Path) -> VfsResult<()> {
        let entries = self.lock().clone();
        let content = serde_json::to_string_pretty(&entries)
            .map_err(|e| VfsError::Other(format!("Failed to encode credentials: {}", e)))?;

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(path, perms);
        }
        Ok(())
    }

    /// Loads a previously saved table, replacing the current contents.
    pub fn load(&self, path: &Path) -> VfsResult<()> {
        let content = fs::read_to_string(path)?;
        let loaded: HashMap<String, Credential> = serde_json::from_str(&content)
            .map_err(|e| VfsError::Other(format!("Invalid credentials file: {}", e)))?;
        *self.lock() = loaded;
        Ok(())
    }
}
