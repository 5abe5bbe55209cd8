//! Hashing: the default `HashModule` implementation, resolved by id from a
//! [`crate::module::ModuleRegistry`] the way a compression codec is resolved.
use std::io::{ErrorKind, Read, Result};

use sha2::{Digest, Sha256};

use crate::id::Id;

/// A pluggable hash algorithm. The engine never assumes SHA-256 directly;
/// it resolves a `HashModule` by id the same way it resolves a
/// [`crate::module::CompressionModule`].
pub trait HashModule: Send + Sync {
    /// Stable identifier stored in manifests, e.g. `"sha256"`.
    fn id(&self) -> &'static str;
    /// Hash a complete in-memory buffer.
    fn hash(&self, data: &[u8]) -> Id;
    /// Hash a stream, without buffering it all in memory.
    fn hash_reader(&self, reader: &mut dyn Read) -> Result<Id>;
}

/// The default hash module, SHA-256.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Module;

impl HashModule for Sha256Module {
    fn id(&self) -> &'static str {
        "sha256"
    }

    fn hash(&self, data: &[u8]) -> Id {
        hash(data)
    }

    fn hash_reader(&self, reader: &mut dyn Read) -> Result<Id> {
        hash_reader(reader)
    }
}

/// Hashes the given data.
///
/// # Arguments
///
/// * `data` - The data to hash.
///
/// # Returns
///
/// The hash Id of the data.
#[must_use]
pub fn hash(data: &[u8]) -> Id {
    Id::new(Sha256::digest(data).into())
}

/// Hashes the data from a [`Read`]er.
///
/// # Arguments
///
/// * `reader` - The reader to read the data to hash from.
///
/// # Returns
///
/// # Errors
/// - if the reader encounters an error
///
/// The hash Id of the data.
pub fn hash_reader(mut reader: impl Read) -> Result<Id> {
    let mut buffer = [0; 4096];
    let mut hasher = Sha256::default();

    loop {
        match reader.read(&mut buffer) {
            Err(err) => {
                if err.kind() != ErrorKind::Interrupted {
                    break Err(err);
                }
            }
            Ok(count) => {
                if count == 0 {
                    let id = hasher.finalize();
                    break Ok(Id::new(id.into()));
                }
                hasher.update(&buffer[..count]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn hash_reader_is_identical_to_hash(bytes in prop::collection::vec(prop::num::u8::ANY, 0..65536))  {
            let hash1 = hash(&bytes);
            let hash2 = hash_reader(&*bytes).unwrap();
            prop_assert_eq!(hash1, hash2);
        }
    }
}
