//! An in-memory [`repair_core::backend::Backend`], used by `repair_core`'s own
//! integration tests and by downstream crates exercising the repair engine
//! without real I/O. Grounded on the teacher's `InMemoryBackend` (an
//! `EnumMap`-keyed map behind a `RwLock`), generalized from a
//! `FileType`-keyed store to this engine's flat, name-keyed one.
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::RwLock;

use repair_core::backend::{Backend, DownloadedFile, RemoteListing};
use repair_core::error::{ErrorKind, RepairError, RepairResult};

/// In-memory [`Backend`] for tests: every remote volume is a `Vec<u8>` keyed
/// by its name in a `BTreeMap`, so listing order is deterministic.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    waits: RwLock<u64>,
}

impl InMemoryBackend {
    /// A fresh, empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend with a volume already present, as if uploaded by an
    /// earlier (untested) run.
    #[must_use]
    pub fn with_object(self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.objects.write().unwrap().insert(name.into(), data.into());
        self
    }

    /// `true` if this object currently exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.objects.read().unwrap().contains_key(name)
    }

    /// The raw bytes stored under `name`, if any.
    #[must_use]
    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().get(name).cloned()
    }

    /// How many times [`Backend::wait_for_empty`] has been called, for tests
    /// asserting the §5 drain barrier actually ran.
    #[must_use]
    pub fn wait_count(&self) -> u64 {
        *self.waits.read().unwrap()
    }
}

impl Backend for InMemoryBackend {
    fn list(&self, prefix: &str) -> RepairResult<Vec<RemoteListing>> {
        Ok(self
            .objects
            .read()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| RemoteListing { name: name.clone(), size: Some(data.len() as u64) })
            .collect())
    }

    fn get(&self, name: &str) -> RepairResult<DownloadedFile> {
        let data = self.objects.read().unwrap().get(name).cloned().ok_or_else(|| {
            RepairError::new(ErrorKind::Backend, "no such object in the in-memory backend")
                .context("name", name.to_string())
        })?;
        let mut temp = tempfile::NamedTempFile::new()
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to create temp file").source(err))?;
        temp.write_all(&data)
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to write temp file").source(err))?;
        let size = data.len() as u64;
        let (_file, path) = temp
            .keep()
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to persist temp file").source(err.error))?;
        Ok(DownloadedFile { path, size })
    }

    fn put(&self, name: &str, local_path: &std::path::Path) -> RepairResult<()> {
        let data = std::fs::read(local_path)
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to read local file for upload").source(err))?;
        self.objects.write().unwrap().insert(name.to_string(), data);
        Ok(())
    }

    fn delete(&self, name: &str, _size: u64) -> RepairResult<()> {
        self.objects.write().unwrap().remove(name).ok_or_else(|| {
            RepairError::new(ErrorKind::Backend, "no such object in the in-memory backend")
                .context("name", name.to_string())
        })?;
        Ok(())
    }

    fn create_folder(&self) -> RepairResult<()> {
        Ok(())
    }

    fn test(&self) -> RepairResult<()> {
        Ok(())
    }

    fn wait_for_empty(&self) -> RepairResult<()> {
        *self.waits.write().unwrap() += 1;
        Ok(())
    }
}
