//! Storage and transfer core for multi-panel file managers.
//!
//! `openvfs` provides a uniform [`vfs::FileHandle`] contract over local disk,
//! SFTP, archive contents and bookmarks, a credential store with
//! longest-prefix lookup, and a cancellable worker-thread job engine for
//! recursive copy/move/delete/pack/unpack operations. UI concerns (progress
//! dialogs, collision prompts) stay outside: jobs talk to them through the
//! callback traits in [`jobs`].

pub mod archive;
pub mod auth;
pub mod config;
pub mod jobs;
pub mod shell_history;
pub mod vfs;

pub use auth::{Credential, CredentialStore};
pub use config::Settings;
pub use jobs::delete::DeleteJob;
pub use jobs::pack::PackJob;
pub use jobs::transfer::{TransferJob, TransferMode, TransferOptions};
pub use jobs::unpack::UnpackJob;
pub use jobs::{
    CollisionAction, CollisionChoice, CollisionPolicy, CollisionResolver, ErrorAction,
    ErrorReporter, JobControl, JobFailure, JobProgress, JobReport, JobState, RunningJob,
};
pub use shell_history::ShellHistory;
pub use vfs::{
    cached::CachedHandle, factory::HandleFactory, url::FileUrl, CopyHint, FileHandle, HandleRef,
    Permissions, VfsError, VfsResult, WriteMode,
};
