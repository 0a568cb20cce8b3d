//! Error types for sandbox builds.
//!
//! Everything the library returns funnels through [`BuildError`]. Low-level
//! filesystem helpers keep using `anyhow` with context messages and land in
//! [`BuildError::Other`].

use std::path::PathBuf;

use thiserror::Error;

/// The result of a sandbuild operation.
pub type BuildResult<T> = Result<T, BuildError>;

/// An error raised while preparing, running or tearing down a build.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The requested profile is not in the configured allow-list.
    #[error("'{name}' is not a known profile")]
    InvalidProfile { name: String },

    /// The backing image for a profile has not been installed yet.
    #[error("cannot find profile '{profile}'. Did you forget to run init?")]
    NotInstalled { profile: String },

    /// A privileged operation was attempted without root.
    #[error("you must be root to {operation}")]
    PermissionDenied { operation: &'static str },

    /// The package descriptor could not be parsed.
    #[error("failed to parse package descriptor '{}': {reason}", .path.display())]
    DescriptorParse { path: PathBuf, reason: String },

    /// The file is neither a legacy nor a modern package descriptor.
    #[error("unrecognized package format: '{}'", .0.display())]
    UnrecognizedFormat(PathBuf),

    /// A source could not be downloaded.
    #[error("failed to fetch '{uri}': {reason}")]
    FetchFailed { uri: String, reason: String },

    /// A downloaded or cached source does not hash to the declared value.
    #[error("checksum mismatch for '{uri}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        uri: String,
        expected: String,
        actual: String,
    },

    /// One or more sources were not available when the build needed them.
    #[error("sources unavailable: {}", .uris.join(", "))]
    SourcesUnavailable { uris: Vec<String> },

    /// A mount or bind mount could not be established.
    #[error("failed to mount '{}': {reason}", .target.display())]
    MountFailed { target: PathBuf, reason: String },

    /// A mount could not be released.
    #[error("failed to unmount '{}': {reason}", .target.display())]
    UnmountFailed { target: PathBuf, reason: String },

    /// A command exited unsuccessfully.
    #[error("command `{command}` failed ({})", describe_exit(.code))]
    CommandFailed { command: String, code: Option<i32> },

    /// Another build or update holds the profile.
    #[error("profile '{profile}' is locked by another process ({})", .lock.display())]
    ProfileLocked { profile: String, lock: PathBuf },

    /// The build finished but produced nothing to collect.
    #[error("no build artifacts found in '{}'", .0.display())]
    NoArtifacts(PathBuf),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error, usually carrying filesystem context.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Builds a [`BuildError::CommandFailed`] from a finished process status.
    pub fn command_failed(command: impl Into<String>, status: std::process::ExitStatus) -> Self {
        BuildError::CommandFailed {
            command: command.into(),
            code: status.code(),
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}
