//! Error kinds specific to [`crate::local::LocalBackend`], folded into a
//! [`repair_core::error::RepairError`] at every call site the way the
//! teacher's `LocalBackendErrorKind` feeds `RusticError`.
use std::num::TryFromIntError;

use displaydoc::Display;
use thiserror::Error;

/// Describes the errors that can be returned by an action on the filesystem
/// underlying a [`crate::local::LocalBackend`].
#[derive(Error, Debug, Display)]
#[non_exhaustive]
pub enum LocalBackendErrorKind {
    /// directory creation failed: `{0:?}`
    DirectoryCreationFailed(std::io::Error),
    /// querying metadata failed: `{0:?}`
    QueryingMetadataFailed(std::io::Error),
    /// querying walkdir metadata failed: `{0:?}`
    QueryingWalkDirMetadataFailed(walkdir::Error),
    /// execution of post-command failed: `{0:?}`
    CommandExecutionFailed(std::io::Error),
    /// post-command was not successful for file `{file_name}`: {status}
    CommandNotSuccessful {
        /// File name
        file_name: String,
        /// Exit status
        status: std::process::ExitStatus,
    },
    /// error building automaton `{0:?}`
    FromAhoCorasick(aho_corasick::BuildError),
    /// {0:?}
    #[error(transparent)]
    FromTryIntError(TryFromIntError),
    /// removing file failed: `{0:?}`
    FileRemovalFailed(std::io::Error),
    /// opening file failed: `{0:?}`
    OpeningFileFailed(std::io::Error),
    /// copying file contents failed: `{0:?}`
    CopyingContentsFailed(std::io::Error),
    /// reading file contents failed: `{0:?}`
    ReadingContentsOfFileFailed(std::io::Error),
    /// failed to sync OS metadata to disk: `{0:?}`
    SyncingOfOsMetadataFailed(std::io::Error),
    /// destination folder `{0}` does not exist
    FolderMissing(String),
}
