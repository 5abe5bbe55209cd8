//! The rich error type used throughout the repair engine.
use std::fmt;

use displaydoc::Display;
use smol_str::SmolStr;
use thiserror::Error;

/// Result type used across `repair_core`.
pub type RepairResult<T> = Result<T, Box<RepairError>>;

/// Coarse-grained classification of what went wrong.
///
/// New variants may be added without a semver break; callers must not match
/// exhaustively on this enum.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// remote backend failure
    Backend,
    /// local database failure
    Database,
    /// volume codec / manifest failure
    Codec,
    /// compression or hash module failure
    Module,
    /// repair engine internal-consistency failure
    Internal,
    /// the operation was cancelled
    Cancelled,
    /// local filesystem I/O failure
    Io,
    /// a condition that requires caller attention before repair can proceed
    UserInformation,
}

/// The spec-mandated, user-facing classification of a blocking precondition.
///
/// Each variant corresponds to a distinct `helpId`-style diagnostic a caller
/// can show verbatim to an operator.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum UserInformationKind {
    /// repair cannot be combined with a passphrase change
    PassphraseChangeUnsupported,
    /// the local database file does not exist
    RepairDatabaseFileDoesNotExist,
    /// the local database was only partially recreated by a previous run
    DatabaseIsPartiallyRecreated,
    /// a repair is already in progress according to the guarded flags
    DatabaseIsInRepairState,
    /// the local database failed its own consistency check and cannot be safely repaired
    DatabaseFailedConsistencyCheck,
    /// the local database has no recorded fileset times to compare freshness against
    LocalDatabaseHasNoFilesetTimes,
    /// remote files are newer than the local database; run a re-fetch before repairing
    RemoteFilesNewerThanLocalDatabase,
    /// the remote folder is empty under the configured volume prefix
    RemoteFolderEmptyWithPrefix,
    /// no remote files are missing; there is nothing to repair
    NoRemoteFilesMissing,
    /// one or more data volumes are missing and rebuilding them was not requested
    MissingDblockFiles,
    /// the configured compression module could not be loaded
    FailedToLoadCompressionModule,
    /// a missing block could not be recovered from any known source
    RepairIsNotPossible,
    /// the local database does not exist and cannot be queried
    DatabaseDoesNotExist,
}

/// The rich, boxed error type returned by every fallible operation in this crate.
///
/// Modeled as a single struct carrying a [`ErrorKind`] tag, an optional
/// source, human guidance, and a small ordered context map, so a caller can
/// render a complete diagnostic without downcasting.
#[derive(Error)]
pub struct RepairError {
    kind: ErrorKind,
    user_information: Option<UserInformationKind>,
    message: SmolStr,
    context: Vec<(&'static str, SmolStr)>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl RepairError {
    /// Start building a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<SmolStr>) -> Box<Self> {
        Box::new(Self {
            kind,
            user_information: None,
            message: message.into(),
            context: Vec::new(),
            source: None,
        })
    }

    /// Build a [`UserInformationKind`] error, the variant callers are expected
    /// to special-case and surface directly to an operator.
    pub fn user_information(kind: UserInformationKind, message: impl Into<SmolStr>) -> Box<Self> {
        Box::new(Self {
            kind: ErrorKind::UserInformation,
            user_information: Some(kind),
            message: message.into(),
            context: Vec::new(),
            source: None,
        })
    }

    /// Attach a context key/value pair, preserving insertion order.
    #[must_use]
    pub fn context(mut self: Box<Self>, key: &'static str, value: impl Into<SmolStr>) -> Box<Self> {
        self.context.push((key, value.into()));
        self
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn source(mut self: Box<Self>, source: impl std::error::Error + Send + Sync + 'static) -> Box<Self> {
        self.source = Some(Box::new(source));
        self
    }

    /// The coarse classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The user-facing classification, if this is a [`ErrorKind::UserInformation`] error.
    #[must_use]
    pub fn user_information_kind(&self) -> Option<UserInformationKind> {
        self.user_information
    }

    /// `true` if this error, or a cause in its chain, is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for RepairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(uik) = self.user_information {
            write!(f, " ({uik})")?;
        }
        for (key, value) in &self.context {
            write!(f, "\n  {key}: {value}")?;
        }
        if let Some(source) = &self.source {
            write!(f, "\n  caused by: {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RepairError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_source() {
        let io_err = std::io::Error::other("disk full");
        let err = RepairError::new(ErrorKind::Backend, "failed to upload volume")
            .context("volume", "dblock-abc.zip")
            .source(io_err);
        let rendered = err.to_string();
        assert!(rendered.contains("failed to upload volume"));
        assert!(rendered.contains("dblock-abc.zip"));
        assert!(rendered.contains("disk full"));
    }

    #[test]
    fn user_information_round_trips() {
        let err = RepairError::user_information(
            UserInformationKind::DatabaseIsInRepairState,
            "a repair is already running",
        );
        assert_eq!(err.kind(), ErrorKind::UserInformation);
        assert_eq!(
            err.user_information_kind(),
            Some(UserInformationKind::DatabaseIsInRepairState)
        );
    }
}
