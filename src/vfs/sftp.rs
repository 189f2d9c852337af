use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use russh::client;
use russh::keys::key;
use russh::Disconnect;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tracing::debug;

use crate::auth::{obfuscated_option_string, obfuscated_string};
use crate::vfs::url::FileUrl;
use crate::vfs::{
    validate_filename, CopyHint, FileHandle, HandleRef, Permissions, VfsError, VfsResult, WriteMode,
};

/// Remote authentication method
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteAuth {
    #[serde(rename = "password")]
    Password {
        #[serde(with = "obfuscated_string")]
        password: String,
    },
    #[serde(rename = "key_file")]
    KeyFile {
        path: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "obfuscated_option_string"
        )]
        passphrase: Option<String>,
    },
}

/// Remote server profile stored in settings.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub auth: RemoteAuth,
    #[serde(default)]
    pub default_path: String,
}

fn default_port() -> u16 {
    22
}

impl RemoteProfile {
    /// The URL this profile authenticates: `sftp://host[:port]/`.
    pub fn root_url(&self) -> FileUrl {
        FileUrl::remote("sftp", &self.host, self.port, "/")
    }
}

/// Find matching profile from profiles list by user, host, port
pub fn find_matching_profile<'a>(
    profiles: &'a [RemoteProfile],
    user: &str,
    host: &str,
    port: u16,
) -> Option<&'a RemoteProfile> {
    profiles
        .iter()
        .find(|p| p.user == user && p.host == host && p.port == port)
}

/// SSH client handler for russh
pub(crate) struct SshHandler;

#[async_trait::async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like ssh -o StrictHostKeyChecking=no).
        // Known-hosts verification belongs to the embedding application.
        Ok(true)
    }
}

/// Blocking SFTP session facade.
///
/// Owns its tokio runtime and drives every SFTP call with `block_on`, so the
/// handle layer and the job engine stay synchronous. One session is shared
/// by every handle addressing the same server.
pub struct SftpSession {
    runtime: Runtime,
    user: String,
    host: String,
    port: u16,
    ssh_handle: Option<client::Handle<SshHandler>>,
    sftp: Option<RusshSftpSession>,
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("host", &self.host)
            .field("connected", &self.sftp.is_some())
            .finish()
    }
}

impl SftpSession {
    /// Connect to remote host via SSH and open SFTP channel
    pub fn connect(profile: &RemoteProfile) -> VfsResult<Arc<Self>> {
        let runtime =
            Runtime::new().map_err(|e| VfsError::Other(format!("Failed to create runtime: {}", e)))?;

        let profile = profile.clone();
        let (ssh_handle, sftp) = runtime.block_on(Self::connect_async(&profile))?;

        debug!(host = %profile.host, port = profile.port, "sftp session established");
        Ok(Arc::new(Self {
            runtime,
            user: profile.user,
            host: profile.host,
            port: profile.port,
            ssh_handle: Some(ssh_handle),
            sftp: Some(sftp),
        }))
    }

    async fn connect_async(
        profile: &RemoteProfile,
    ) -> VfsResult<(client::Handle<SshHandler>, RusshSftpSession)> {
        let config = client::Config {
            inactivity_timeout: Some(std::time::Duration::from_secs(300)),
            keepalive_interval: Some(std::time::Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let mut ssh = client::connect(
            Arc::new(config),
            (profile.host.as_str(), profile.port),
            SshHandler,
        )
        .await
        .map_err(|e| VfsError::Other(format!("SSH connection failed: {}", e)))?;

        let auth_result = match &profile.auth {
            RemoteAuth::Password { password } => ssh
                .authenticate_password(&profile.user, password)
                .await
                .map_err(|e| VfsError::Other(format!("Password auth failed: {}", e)))?,
            RemoteAuth::KeyFile { path, passphrase } => {
                let key_path = expand_home(path);
                let key_pair = russh_keys::load_secret_key(&key_path, passphrase.as_deref())
                    .map_err(|e| VfsError::Other(format!("Failed to load key: {}", e)))?;
                ssh.authenticate_publickey(&profile.user, Arc::new(key_pair))
                    .await
                    .map_err(|e| VfsError::Other(format!("Key auth failed: {}", e)))?
            }
        };

        if !auth_result {
            return Err(VfsError::auth(&profile.root_url()));
        }

        let channel = ssh
            .channel_open_session()
            .await
            .map_err(|e| VfsError::Other(format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| VfsError::Other(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| VfsError::Other(format!("Failed to init SFTP session: {}", e)))?;

        Ok((ssh, sftp))
    }

    fn sftp(&self) -> VfsResult<&RusshSftpSession> {
        self.sftp.as_ref().ok_or(VfsError::Disconnected)
    }

    /// True when `other` addresses the same server and account, which makes
    /// a server-side rename possible.
    pub fn same_server(&self, url: &FileUrl) -> bool {
        url.scheme() == "sftp"
            && url.host() == Some(self.host.as_str())
            && url.port().unwrap_or(22) == self.port
            && url.login().map(|l| l == self.user).unwrap_or(true)
    }

    fn stat(&self, path: &str) -> VfsResult<FileAttributes> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.symlink_metadata(path)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to stat '{}': {}", path, e)))
        })
    }

    fn read_dir(&self, path: &str) -> VfsResult<Vec<String>> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            let dir = sftp
                .read_dir(path)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to read dir '{}': {}", path, e)))?;
            let mut names = Vec::new();
            for entry in dir {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                names.push(name);
            }
            Ok(names)
        })
    }

    fn remove_file(&self, path: &str) -> VfsResult<()> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.remove_file(path)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to remove '{}': {}", path, e)))
        })
    }

    fn remove_dir(&self, path: &str) -> VfsResult<()> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.remove_dir(path)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to remove dir '{}': {}", path, e)))
        })
    }

    fn create_dir(&self, path: &str) -> VfsResult<()> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.create_dir(path)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to create dir '{}': {}", path, e)))
        })
    }

    fn rename(&self, old_path: &str, new_path: &str) -> VfsResult<()> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.rename(old_path, new_path).await.map_err(|e| {
                VfsError::Other(format!(
                    "Failed to rename '{}' to '{}': {}",
                    old_path, new_path, e
                ))
            })
        })
    }

    fn read_link(&self, path: &str) -> VfsResult<String> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.read_link(path)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to read link '{}': {}", path, e)))
        })
    }

    fn symlink(&self, path: &str, target: &str) -> VfsResult<()> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.symlink(path, target).await.map_err(|e| {
                VfsError::Other(format!("Failed to create symlink '{}': {}", path, e))
            })
        })
    }

    fn set_metadata(&self, path: &str, attrs: FileAttributes) -> VfsResult<()> {
        let sftp = self.sftp()?;
        self.runtime.block_on(async {
            sftp.set_metadata(path, attrs)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to update '{}': {}", path, e)))
        })
    }

    fn open_read(self: &Arc<Self>, path: &str) -> VfsResult<SftpReader> {
        let sftp = self.sftp()?;
        let file = self.runtime.block_on(async {
            sftp.open(path)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to open '{}': {}", path, e)))
        })?;
        Ok(SftpReader {
            session: Arc::clone(self),
            file,
        })
    }

    fn open_write(self: &Arc<Self>, path: &str, mode: WriteMode) -> VfsResult<SftpWriter> {
        let sftp = self.sftp()?;
        let file = self.runtime.block_on(async {
            let flags = match mode {
                WriteMode::Truncate => {
                    OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE
                }
                WriteMode::Append => OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::APPEND,
            };
            sftp.open_with_flags(path, flags)
                .await
                .map_err(|e| VfsError::Other(format!("Failed to open '{}': {}", path, e)))
        })?;
        Ok(SftpWriter {
            session: Arc::clone(self),
            file: Some(file),
        })
    }

    /// Disconnect from remote host
    pub fn disconnect(&mut self) {
        // Drop SFTP first, then SSH
        self.sftp = None;
        if let Some(ssh) = self.ssh_handle.take() {
            let _ = self
                .runtime
                .block_on(async { ssh.disconnect(Disconnect::ByApplication, "", "en").await });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sftp.is_some()
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn expand_home(path: &str) -> PathBuf {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

/// Synchronous reader over a remote file; each read drives the session
/// runtime for one chunk.
pub struct SftpReader {
    session: Arc<SftpSession>,
    file: russh_sftp::client::fs::File,
}

impl Read for SftpReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        self.session.runtime.block_on(self.file.read(buf))
    }
}

/// Synchronous writer over a remote file. The remote handle is shut down on
/// drop; callers that need to observe close errors call `flush` first.
pub struct SftpWriter {
    session: Arc<SftpSession>,
    file: Option<russh_sftp::client::fs::File>,
}

impl Write for SftpWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use tokio::io::AsyncWriteExt;
        match self.file.as_mut() {
            Some(file) => self.session.runtime.block_on(file.write(buf)),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        match self.file.as_mut() {
            Some(file) => self.session.runtime.block_on(file.flush()),
            None => Ok(()),
        }
    }
}

impl Drop for SftpWriter {
    fn drop(&mut self) {
        use tokio::io::AsyncWriteExt;
        if let Some(mut file) = self.file.take() {
            let _ = self.session.runtime.block_on(file.shutdown());
        }
    }
}

/// Handle over a path on an SFTP server. Attribute getters stat the remote
/// path per call and never follow symlinks.
pub struct SftpHandle {
    session: Arc<SftpSession>,
    url: FileUrl,
}

impl SftpHandle {
    pub fn new(session: Arc<SftpSession>, url: FileUrl) -> Self {
        Self { session, url }
    }

    fn remote_path(&self) -> &str {
        self.url.path()
    }

    fn stat(&self) -> Option<FileAttributes> {
        self.session.stat(self.remote_path()).ok()
    }
}

impl FileHandle for SftpHandle {
    fn url(&self) -> &FileUrl {
        &self.url
    }

    fn exists(&self) -> bool {
        self.stat().is_some()
    }

    fn is_directory(&self) -> bool {
        self.stat().map(|a| a.is_dir()).unwrap_or(false)
    }

    fn is_symlink(&self) -> bool {
        self.stat().map(|a| a.is_symlink()).unwrap_or(false)
    }

    fn size(&self) -> u64 {
        self.stat().and_then(|a| a.size).unwrap_or(0)
    }

    fn modified(&self) -> Option<DateTime<Local>> {
        self.stat()
            .and_then(|a| a.mtime)
            .and_then(|t| Local.timestamp_opt(t as i64, 0).single())
    }

    fn change_modified(&self, when: DateTime<Local>) -> VfsResult<()> {
        let mut attrs = self.session.stat(self.remote_path())?;
        attrs.mtime = Some(when.timestamp() as u32);
        self.session.set_metadata(self.remote_path(), attrs)
    }

    fn permissions(&self) -> Option<Permissions> {
        let mode = self.stat().and_then(|a| a.permissions)?;
        Some(Permissions::new(mode & 0o777, 0o777))
    }

    fn change_permission(&self, bit: u32, enabled: bool) -> VfsResult<()> {
        let current = self
            .permissions()
            .ok_or_else(|| VfsError::NotFound(self.url.normalized()))?;
        let mut attrs = FileAttributes::default();
        attrs.permissions = Some(current.with_bit(bit, enabled).mode());
        self.session.set_metadata(self.remote_path(), attrs)
    }

    fn owner(&self) -> Option<String> {
        self.stat().and_then(|a| a.uid).map(|v| v.to_string())
    }

    fn group(&self) -> Option<String> {
        self.stat().and_then(|a| a.gid).map(|v| v.to_string())
    }

    fn parent(&self) -> Option<HandleRef> {
        let parent_url = self.url.parent()?;
        Some(Box::new(SftpHandle::new(
            Arc::clone(&self.session),
            parent_url,
        )))
    }

    fn list(&self) -> VfsResult<Vec<HandleRef>> {
        let names = self.session.read_dir(self.remote_path())?;
        Ok(names
            .into_iter()
            .map(|name| {
                Box::new(SftpHandle::new(
                    Arc::clone(&self.session),
                    self.url.child(&name),
                )) as HandleRef
            })
            .collect())
    }

    fn resolve_child(&self, name: &str) -> VfsResult<HandleRef> {
        validate_filename(name)?;
        Ok(Box::new(SftpHandle::new(
            Arc::clone(&self.session),
            self.url.child(name),
        )))
    }

    fn open_read(&self) -> VfsResult<Box<dyn Read + Send>> {
        Ok(Box::new(self.session.open_read(self.remote_path())?))
    }

    fn open_write(&self, mode: WriteMode) -> VfsResult<Box<dyn Write + Send>> {
        Ok(Box::new(self.session.open_write(self.remote_path(), mode)?))
    }

    fn mkdir(&self) -> VfsResult<()> {
        self.session.create_dir(self.remote_path())
    }

    fn mkfile(&self) -> VfsResult<()> {
        let writer = self.session.open_write(self.remote_path(), WriteMode::Truncate)?;
        drop(writer);
        Ok(())
    }

    fn delete(&self) -> VfsResult<()> {
        if self.is_directory() {
            self.session.remove_dir(self.remote_path())
        } else {
            // Covers regular files and symlinks; the link itself is removed.
            self.session.remove_file(self.remote_path())
        }
    }

    fn move_hint(&self, dest: &dyn FileHandle) -> CopyHint {
        if self.session.same_server(dest.url()) {
            CopyHint::Should
        } else {
            CopyHint::MustNot
        }
    }

    fn move_to(&self, dest: &dyn FileHandle) -> VfsResult<bool> {
        if !self.session.same_server(dest.url()) {
            return Ok(false);
        }
        self.session.rename(self.remote_path(), dest.url().path())?;
        Ok(true)
    }

    fn read_link(&self) -> VfsResult<String> {
        self.session.read_link(self.remote_path())
    }

    fn create_symlink(&self, target: &str) -> VfsResult<()> {
        self.session.symlink(self.remote_path(), target)
    }
}
