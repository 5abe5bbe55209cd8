//! The `Backend` trait: the remote-store surface the repair engine consumes.
//!
//! Shaped after `rustic_core::backend::{ReadBackend, WriteBackend}` — a small
//! trait a concrete transport implements, with the engine itself never
//! knowing whether it's talking to a local directory, an object store, or
//! anything else. `repair_backend::LocalBackend` is the one transport
//! shipped in this workspace; others are supplied out of tree.
use std::path::PathBuf;

use displaydoc::Display;
use thiserror::Error;

use crate::error::{ErrorKind, RepairError, RepairResult};
use crate::id::Id;

/// The three kinds of remote volume this engine reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[non_exhaustive]
pub enum VolumeKind {
    /// a data volume holding raw block payloads
    #[strum(serialize = "blocks")]
    Blocks,
    /// an index volume holding block manifests
    #[strum(serialize = "index")]
    Index,
    /// a fileset volume holding a snapshot manifest
    #[strum(serialize = "files")]
    Files,
}

/// Tag describing why a `Backend` call failed, mirroring
/// `rustic_backend::error::BackendAccessErrorKind`'s role for `LocalBackend`.
#[derive(Error, Debug, Display)]
#[non_exhaustive]
pub enum BackendErrorKind {
    /// the destination folder does not exist or is not reachable
    FolderMissing,
    /// the remote TLS certificate could not be validated
    InvalidCertificate,
    /// the remote host key could not be verified
    HostKey,
    /// a condition the caller must resolve before retrying, not a transient fault
    UserInformation,
    /// an otherwise unclassified backend failure
    Generic,
}

/// One entry returned by [`Backend::list`].
#[derive(Debug, Clone)]
pub struct RemoteListing {
    /// The volume's filename, exactly as stored remotely.
    pub name: String,
    /// Size in bytes, when the backend can report it cheaply alongside a listing.
    pub size: Option<u64>,
}

/// A downloaded volume, materialized to a local temp path so block/manifest
/// readers can seek it without holding the whole file in memory.
#[derive(Debug)]
pub struct DownloadedFile {
    /// Path to the local copy of the volume.
    pub path: PathBuf,
    /// Size in bytes of the local copy.
    pub size: u64,
}

/// The remote-store surface the repair engine consumes (spec.md §6,
/// "Backend (consumed)").
///
/// A transport crate (`repair_backend`, or an out-of-tree one) implements
/// this once; the engine's analyzer, locator, and reconciler never construct
/// a concrete transport themselves.
pub trait Backend: Send + Sync {
    /// List every remote entry whose name starts with `prefix`.
    fn list(&self, prefix: &str) -> RepairResult<Vec<RemoteListing>>;

    /// Download `name` to a local temp file.
    fn get(&self, name: &str) -> RepairResult<DownloadedFile>;

    /// Download `name`, additionally reporting the hash and declared size the
    /// backend itself may already know about the object (used by the locator
    /// to validate a sibling candidate before committing to it).
    fn get_with_info(&self, name: &str) -> RepairResult<(DownloadedFile, Option<Id>, u64)> {
        let file = self.get(name)?;
        let size = file.size;
        Ok((file, None, size))
    }

    /// Download several names with overlapped fetches, returning one result
    /// per input name in the same order. A failure to fetch one name must
    /// not prevent the others from being returned.
    fn get_overlapped(
        &self,
        names: &[String],
    ) -> RepairResult<Vec<RepairResult<(DownloadedFile, u64, String)>>> {
        Ok(names
            .iter()
            .map(|name| self.get(name).map(|file| {
                let size = file.size;
                (file, size, name.clone())
            }))
            .collect())
    }

    /// Upload the file at `local_path` under `name`.
    fn put(&self, name: &str, local_path: &std::path::Path) -> RepairResult<()>;

    /// Delete the remote entry `name`, whose size is `size` (some backends
    /// need it for accounting/quota bookkeeping on delete).
    fn delete(&self, name: &str, size: u64) -> RepairResult<()>;

    /// Ensure the destination folder exists.
    fn create_folder(&self) -> RepairResult<()>;

    /// Verify connectivity and credentials without mutating anything.
    fn test(&self) -> RepairResult<()>;

    /// Block until every queued upload/delete issued through this backend has
    /// completed. The sole upload-queue drain barrier (§5).
    fn wait_for_empty(&self) -> RepairResult<()> {
        Ok(())
    }
}

/// Convenience constructor for a [`BackendErrorKind::FolderMissing`] error.
pub fn folder_missing(path: impl Into<String>) -> Box<RepairError> {
    RepairError::new(ErrorKind::Backend, "destination folder is missing")
        .context("path", path.into())
}
