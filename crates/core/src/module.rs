//! Dynamic module lookup for compression codecs (see design note in `SPEC_FULL.md` §9).
//!
//! The engine never hard-codes a codec; volume filenames carry a module id
//! (`.zstd`, `.gz`, ...) and the engine looks it up in a [`ModuleRegistry`]
//! the way a teacher backend is chosen by URL scheme in `choose.rs`.
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ErrorKind, RepairError, RepairResult};

/// A pluggable (de)compression codec.
pub trait CompressionModule: Send + Sync {
    /// Stable identifier used as the volume filename's compression extension.
    fn id(&self) -> &'static str;
    /// Compress `data`.
    fn compress(&self, data: &[u8]) -> RepairResult<Vec<u8>>;
    /// Decompress `data`.
    fn decompress(&self, data: &[u8]) -> RepairResult<Vec<u8>>;
}

/// The default codec, zstd, at its library default level.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZstdModule;

impl CompressionModule for ZstdModule {
    fn id(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> RepairResult<Vec<u8>> {
        zstd::stream::encode_all(data, 0)
            .map_err(|err| RepairError::new(ErrorKind::Module, "zstd compression failed").source(err))
    }

    fn decompress(&self, data: &[u8]) -> RepairResult<Vec<u8>> {
        zstd::stream::decode_all(data)
            .map_err(|err| RepairError::new(ErrorKind::Module, "zstd decompression failed").source(err))
    }
}

/// A lookup table from module id to a shared module instance.
///
/// Generic over the trait object so it serves both `CompressionModule` and
/// `HashModule` registries without duplicating the lookup logic.
pub struct ModuleRegistry<T: ?Sized> {
    modules: HashMap<&'static str, Arc<T>>,
}

impl<T: ?Sized> ModuleRegistry<T> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Register a module under its own id.
    pub fn register(&mut self, id: &'static str, module: Arc<T>) {
        _ = self.modules.insert(id, module);
    }

    /// Resolve a module by id.
    pub fn get(&self, id: &str) -> RepairResult<Arc<T>> {
        self.modules.get(id).cloned().ok_or_else(|| {
            RepairError::new(ErrorKind::Module, "unknown module id").context("id", id.to_string())
        })
    }
}

impl<T: ?Sized> Default for ModuleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry<dyn CompressionModule> {
    /// A registry pre-populated with the built-in `zstd` codec.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("zstd", Arc::new(ZstdModule));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_round_trips() {
        let module = ZstdModule;
        let data = b"hello repair engine, this text should compress decently well when repeated. ".repeat(8);
        let compressed = module.compress(&data).unwrap();
        let decompressed = module.decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn registry_resolves_by_id() {
        let registry = ModuleRegistry::<dyn CompressionModule>::with_defaults();
        let module = registry.get("zstd").unwrap();
        assert_eq!(module.id(), "zstd");
    }

    #[test]
    fn registry_rejects_unknown_id() {
        let registry = ModuleRegistry::<dyn CompressionModule>::with_defaults();
        assert!(registry.get("lz4").is_err());
    }
}
