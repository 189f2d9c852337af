use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::archive::{self, ArchiveEntryHandle};
use crate::auth::CredentialStore;
use crate::config::Settings;
use crate::vfs::bookmark::{Bookmark, BookmarkHandle};
use crate::vfs::local::LocalHandle;
use crate::vfs::sftp::{
    find_matching_profile, RemoteAuth, RemoteProfile, SftpHandle, SftpSession,
};
use crate::vfs::url::FileUrl;
use crate::vfs::{HandleRef, VfsError, VfsResult};

/// Creates handles from location strings.
///
/// Schemes are dispatched through a fixed table — `file`, `sftp`,
/// `bookmark` — built at construction; there is no runtime backend
/// discovery. Local paths that cross an archive file resolve into the
/// archive namespace. Credential resolution happens here, before a backend
/// sees the location.
///
/// One factory is built per application context and passed to the components
/// that need it; there is no process-wide instance.
pub struct HandleFactory {
    credentials: Arc<CredentialStore>,
    profiles: Vec<RemoteProfile>,
    bookmarks: Vec<Bookmark>,
    sessions: Mutex<HashMap<String, Arc<SftpSession>>>,
}

impl HandleFactory {
    pub fn new(
        credentials: Arc<CredentialStore>,
        profiles: Vec<RemoteProfile>,
        bookmarks: Vec<Bookmark>,
    ) -> Arc<Self> {
        Arc::new(Self {
            credentials,
            profiles,
            bookmarks,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings(settings: &Settings, credentials: Arc<CredentialStore>) -> Arc<Self> {
        Self::new(
            credentials,
            settings.remote_profiles.clone(),
            settings.bookmarks.clone(),
        )
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn bookmarks(&self) -> &[Bookmark] {
        &self.bookmarks
    }

    /// Resolves a location string into a handle.
    pub fn resolve(self: &Arc<Self>, location: &str) -> VfsResult<HandleRef> {
        let mut url = FileUrl::parse(location)
            .ok_or_else(|| VfsError::InvalidLocation(location.to_string()))?;
        // Observe embedded credentials or inject stored ones.
        self.credentials.authenticate(&mut url);
        self.resolve_url(&url)
    }

    /// Resolves an already-parsed (and authenticated) URL.
    pub fn resolve_url(self: &Arc<Self>, url: &FileUrl) -> VfsResult<HandleRef> {
        match url.scheme() {
            "file" => resolve_local(url.path()),
            "sftp" => {
                let session = self.session_for(url)?;
                Ok(Box::new(SftpHandle::new(session, url.clone())))
            }
            "bookmark" => {
                let name = url.name();
                let bookmark = self
                    .bookmarks
                    .iter()
                    .find(|b| b.name == name)
                    .cloned()
                    .ok_or_else(|| VfsError::NotFound(url.normalized()))?;
                Ok(Box::new(BookmarkHandle::new(bookmark, Arc::clone(self))))
            }
            other => Err(VfsError::UnknownScheme(other.to_string())),
        }
    }

    /// Returns the cached session for this server, connecting if needed.
    ///
    /// A URL that carries credentials (typed in or injected from the store)
    /// connects with password auth; otherwise a configured profile for the
    /// same server is used. With neither, resolution fails with an auth
    /// error carrying the location, so a UI can prompt and retry.
    fn session_for(self: &Arc<Self>, url: &FileUrl) -> VfsResult<Arc<SftpSession>> {
        let host = url
            .host()
            .ok_or_else(|| VfsError::InvalidLocation(url.normalized()))?;
        let port = url.port().unwrap_or(22);

        let profile = if let Some(login) = url.login() {
            match find_matching_profile(&self.profiles, login, host, port) {
                Some(profile) if url.password().is_none() => profile.clone(),
                _ => RemoteProfile {
                    name: format!("{}@{}", login, host),
                    host: host.to_string(),
                    port,
                    user: login.to_string(),
                    auth: RemoteAuth::Password {
                        password: url.password().unwrap_or("").to_string(),
                    },
                    default_path: String::new(),
                },
            }
        } else {
            self.profiles
                .iter()
                .find(|p| p.host == host && p.port == port)
                .cloned()
                .ok_or_else(|| VfsError::auth(url))?
        };

        let key = format!("{}@{}:{}", profile.user, profile.host, profile.port);
        {
            let sessions = self.sessions_lock();
            if let Some(session) = sessions.get(&key) {
                if session.is_connected() {
                    return Ok(Arc::clone(session));
                }
            }
        }

        debug!(server = %key, "opening sftp session");
        let session = SftpSession::connect(&profile)?;
        self.sessions_lock().insert(key, Arc::clone(&session));
        Ok(session)
    }

    fn sessions_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SftpSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves a local path, descending into an archive container when a path
/// component names an archive file that is not the final component.
fn resolve_local(path: &str) -> VfsResult<HandleRef> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut current = PathBuf::from("/");

    for (index, segment) in segments.iter().enumerate() {
        current.push(segment);
        let is_last = index + 1 == segments.len();
        if !is_last && archive::is_archive_name(segment) && current.is_file() {
            let container = archive::open_container(&current)?;
            let inner = segments[index + 1..].join("/");
            return Ok(Box::new(ArchiveEntryHandle::new(container, &inner)));
        }
    }

    Ok(Box::new(LocalHandle::new(Path::new(path))))
}
