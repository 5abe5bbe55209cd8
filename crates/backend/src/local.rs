//! A local-filesystem [`repair_core::backend::Backend`]: every remote volume
//! is a flat file under one directory, named exactly as `repair_core`'s
//! volume-name grammar produces it. Grounded on
//! `rustic_backend::local::LocalBackend` — the same directory-walk listing,
//! the same `post-create-command`/`post-delete-command` hook shape via
//! `aho_corasick` placeholder substitution — generalized from a
//! `FileType`-keyed hex-id layout to this engine's flat, prefix-filtered
//! filename layout.
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use aho_corasick::AhoCorasick;
use log::{debug, trace, warn};
use repair_core::backend::{Backend, DownloadedFile, RemoteListing};
use repair_core::error::{ErrorKind, RepairError, RepairResult};
use walkdir::WalkDir;

use crate::error::LocalBackendErrorKind;

/// A [`Backend`] backed by a single directory on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    path: PathBuf,
    post_create_command: Option<String>,
    post_delete_command: Option<String>,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `path`.
    ///
    /// Supported `options`: `post-create-command`, `post-delete-command`,
    /// each a shell command template accepting the placeholders `%file` (the
    /// absolute path of the affected volume) and `%name` (its remote name).
    /// Unknown options are logged and otherwise ignored, the way the teacher
    /// backend tolerates unsupported URL options rather than failing outright.
    #[must_use]
    pub fn new(path: impl AsRef<Path>, options: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut post_create_command = None;
        let mut post_delete_command = None;
        for (option, value) in options {
            match option.as_str() {
                "post-create-command" => post_create_command = Some(value),
                "post-delete-command" => post_delete_command = Some(value),
                other => warn!("option {other} is not supported by LocalBackend; ignoring it"),
            }
        }
        Self { path: path.as_ref().to_path_buf(), post_create_command, post_delete_command }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    fn call_command(name: &str, file: &Path, command: &str) -> RepairResult<()> {
        let patterns = &["%file", "%name"];
        let ac = AhoCorasick::new(patterns).map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to build placeholder automaton for post-command")
                .source(LocalBackendErrorKind::FromAhoCorasick(err))
        })?;
        let replace_with = &[file.to_string_lossy().into_owned(), name.to_string()];
        let actual_command = ac.replace_all(command, replace_with);

        debug!("calling {actual_command}...");
        let mut parts = actual_command.split_whitespace();
        let Some(program) = parts.next() else {
            return Ok(());
        };
        let status = Command::new(program).args(parts).status().map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to execute post-command")
                .source(LocalBackendErrorKind::CommandExecutionFailed(err))
        })?;
        if !status.success() {
            return Err(RepairError::new(ErrorKind::Backend, "post-command exited unsuccessfully").source(
                LocalBackendErrorKind::CommandNotSuccessful { file_name: name.to_string(), status },
            ));
        }
        Ok(())
    }
}

impl Backend for LocalBackend {
    fn list(&self, prefix: &str) -> RepairResult<Vec<RemoteListing>> {
        trace!("listing volumes under prefix {prefix:?}");
        if !self.path.exists() {
            return Err(RepairError::new(ErrorKind::Backend, "destination folder is missing")
                .source(LocalBackendErrorKind::FolderMissing(self.path.display().to_string())));
        }
        let entries = WalkDir::new(&self.path)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with(prefix) {
                    return None;
                }
                let size = entry.metadata().ok().map(|meta| meta.len());
                Some(RemoteListing { name, size })
            })
            .collect();
        Ok(entries)
    }

    fn get(&self, name: &str) -> RepairResult<DownloadedFile> {
        trace!("downloading {name}");
        let source = self.path_for(name);
        let bytes = fs::read(&source).map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to read volume from local backend")
                .context("name", name.to_string())
                .source(LocalBackendErrorKind::ReadingContentsOfFileFailed(err))
        })?;
        let mut temp = tempfile::NamedTempFile::new().map_err(|err| {
            RepairError::new(ErrorKind::Io, "failed to create a temp file for a downloaded volume").source(err)
        })?;
        temp.write_all(&bytes).map_err(|err| {
            RepairError::new(ErrorKind::Io, "failed to write downloaded volume to temp file").source(err)
        })?;
        let size = bytes.len() as u64;
        let (_file, path) = temp.keep().map_err(|err| {
            RepairError::new(ErrorKind::Io, "failed to persist downloaded volume temp file").source(err.error)
        })?;
        Ok(DownloadedFile { path, size })
    }

    fn put(&self, name: &str, local_path: &Path) -> RepairResult<()> {
        trace!("uploading {name}");
        let destination = self.path_for(name);
        let mut source = File::open(local_path).map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to open local file for upload")
                .context("name", name.to_string())
                .source(LocalBackendErrorKind::OpeningFileFailed(err))
        })?;
        let mut dest = fs::OpenOptions::new().create(true).truncate(true).write(true).open(&destination).map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to open destination file for upload")
                .context("name", name.to_string())
                .source(LocalBackendErrorKind::OpeningFileFailed(err))
        })?;
        std::io::copy(&mut source, &mut dest).map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to copy volume contents to the local backend")
                .context("name", name.to_string())
                .source(LocalBackendErrorKind::CopyingContentsFailed(err))
        })?;
        dest.sync_all().map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to sync uploaded volume to disk")
                .context("name", name.to_string())
                .source(LocalBackendErrorKind::SyncingOfOsMetadataFailed(err))
        })?;
        if let Some(command) = &self.post_create_command {
            if let Err(err) = Self::call_command(name, &destination, command) {
                warn!("post-create command failed for {name}: {err}");
            }
        }
        Ok(())
    }

    fn delete(&self, name: &str, _size: u64) -> RepairResult<()> {
        trace!("deleting {name}");
        let path = self.path_for(name);
        fs::remove_file(&path).map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to remove volume from local backend")
                .context("name", name.to_string())
                .source(LocalBackendErrorKind::FileRemovalFailed(err))
        })?;
        if let Some(command) = &self.post_delete_command {
            if let Err(err) = Self::call_command(name, &path, command) {
                warn!("post-delete command failed for {name}: {err}");
            }
        }
        Ok(())
    }

    fn create_folder(&self) -> RepairResult<()> {
        trace!("creating backend directory at {:?}", self.path);
        fs::create_dir_all(&self.path).map_err(|err| {
            RepairError::new(ErrorKind::Backend, "failed to create the backend directory")
                .context("path", self.path.display().to_string())
                .source(LocalBackendErrorKind::DirectoryCreationFailed(err))
        })
    }

    fn test(&self) -> RepairResult<()> {
        if !self.path.exists() {
            return Err(RepairError::new(ErrorKind::Backend, "destination folder is missing")
                .source(LocalBackendErrorKind::FolderMissing(self.path.display().to_string())));
        }
        let probe = self.path.join(".repair_backend_probe");
        fs::write(&probe, b"probe").map_err(|err| {
            RepairError::new(ErrorKind::Backend, "backend directory is not writable")
                .context("path", self.path.display().to_string())
                .source(err)
        })?;
        let _ = fs::remove_file(&probe);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repair_core::backend::Backend as _;

    #[test]
    fn round_trips_a_volume_through_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path(), Vec::new());
        backend.create_folder().unwrap();

        let mut source = tempfile::NamedTempFile::new().unwrap();
        source.write_all(b"volume payload").unwrap();

        backend.put("set-bAAAA-abcd.zstd", source.path()).unwrap();

        let listed = backend.list("set-").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "set-bAAAA-abcd.zstd");

        let downloaded = backend.get("set-bAAAA-abcd.zstd").unwrap();
        assert_eq!(fs::read(downloaded.path).unwrap(), b"volume payload");

        backend.delete("set-bAAAA-abcd.zstd", 14).unwrap();
        assert!(backend.list("set-").unwrap().is_empty());
    }

    #[test]
    fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path(), Vec::new());
        backend.create_folder().unwrap();
        fs::write(dir.path().join("alpha-bAAAA-x.zstd"), b"a").unwrap();
        fs::write(dir.path().join("beta-bAAAA-x.zstd"), b"b").unwrap();

        let listed = backend.list("alpha-").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "alpha-bAAAA-x.zstd");
    }

    #[test]
    fn test_fails_when_folder_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let backend = LocalBackend::new(&missing, Vec::new());
        assert!(backend.test().is_err());
    }
}
