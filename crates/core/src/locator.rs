//! Block locator (§4.3): recover the bytes of a missing block from a local
//! file hint first, then from a sibling remote data volume holding the same
//! `(hash, size)`, batching overlapped fetches. Never uploads a partial
//! volume — a block this locator cannot recover leaves the volume it would
//! have completed unrecreated, not fabricated with a gap.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use log::{debug, warn};

use crate::backend::Backend;
use crate::db::Database;
use crate::error::{ErrorKind, RepairError, RepairResult};
use crate::hash::HashModule;
use crate::id::Id;

/// A block this locator is trying to recover.
#[derive(Debug, Clone, Copy)]
pub struct WantedBlock {
    /// The block's content hash.
    pub hash: Id,
    /// The block's declared length.
    pub length: u64,
}

/// The recovered bytes for one wanted block.
#[derive(Debug)]
pub struct RecoveredBlock {
    /// The block that was recovered.
    pub hash: Id,
    /// Its raw (uncompressed) bytes.
    pub data: Vec<u8>,
}

/// Attempt to recover every block in `wanted`, given sibling candidate
/// volume names that are known to contain blocks of the same kind.
///
/// Returns one [`RecoveredBlock`] per block it managed to recover; blocks it
/// could not find anywhere are simply absent from the result — callers must
/// check that every wanted block was recovered before treating a data
/// volume as reconstructable, per the no-fabrication invariant.
pub fn locate(
    backend: &dyn Backend,
    db: &dyn Database,
    hasher: &dyn HashModule,
    wanted: &[WantedBlock],
    sibling_candidates: &[String],
) -> RepairResult<Vec<RecoveredBlock>> {
    let mut recovered = Vec::new();
    let mut still_wanted: Vec<WantedBlock> = wanted.to_vec();

    recover_from_local_hints(db, hasher, &mut still_wanted, &mut recovered);

    if !still_wanted.is_empty() && !sibling_candidates.is_empty() {
        recover_from_siblings(backend, hasher, &mut still_wanted, sibling_candidates, &mut recovered)?;
    }

    if !still_wanted.is_empty() {
        warn!(
            "could not recover {} of {} wanted blocks from local hints or sibling volumes",
            still_wanted.len(),
            wanted.len()
        );
    }

    Ok(recovered)
}

fn recover_from_local_hints(
    db: &dyn Database,
    hasher: &dyn HashModule,
    still_wanted: &mut Vec<WantedBlock>,
    recovered: &mut Vec<RecoveredBlock>,
) {
    still_wanted.retain(|block| {
        let Ok(hints) = db.local_file_hints(&block.hash) else {
            return true;
        };
        for hint in hints {
            match read_hint(&hint, block, hasher) {
                Ok(Some(data)) => {
                    debug!("recovered block from local file hint {:?}", hint.path);
                    recovered.push(RecoveredBlock { hash: block.hash, data });
                    return false;
                }
                Ok(None) => continue,
                Err(err) => {
                    debug!("local file hint {:?} unusable: {err}", hint.path);
                    continue;
                }
            }
        }
        true
    });
}

fn read_hint(
    hint: &crate::db::LocalFileHint,
    block: &WantedBlock,
    hasher: &dyn HashModule,
) -> RepairResult<Option<Vec<u8>>> {
    if hint.length != block.length {
        return Ok(None);
    }
    let mut file = File::open(&hint.path)
        .map_err(|err| RepairError::new(ErrorKind::Io, "failed to open local hint file").source(err))?;
    file.seek(SeekFrom::Start(hint.offset))
        .map_err(|err| RepairError::new(ErrorKind::Io, "failed to seek in local hint file").source(err))?;
    let mut buf = vec![0; hint.length as usize];
    if file.read_exact(&mut buf).is_err() {
        return Ok(None);
    }
    if hasher.hash(&buf) != block.hash {
        return Ok(None);
    }
    Ok(Some(buf))
}

fn recover_from_siblings(
    backend: &dyn Backend,
    hasher: &dyn HashModule,
    still_wanted: &mut Vec<WantedBlock>,
    sibling_candidates: &[String],
    recovered: &mut Vec<RecoveredBlock>,
) -> RepairResult<()> {
    const BATCH_SIZE: usize = 8;

    for batch in sibling_candidates.chunks(BATCH_SIZE) {
        if still_wanted.is_empty() {
            break;
        }
        let fetched = backend.get_overlapped(batch)?;
        for result in fetched {
            let (file, _size, name) = match result {
                Ok(triple) => triple,
                Err(err) => {
                    debug!("sibling volume fetch failed: {err}");
                    continue;
                }
            };
            let Ok(contents) = std::fs::read(&file.path) else {
                debug!("could not read downloaded sibling volume {name}");
                continue;
            };
            still_wanted.retain(|block| {
                if let Some(offset) = find_block(&contents, block, hasher) {
                    let data = contents[offset..offset + block.length as usize].to_vec();
                    recovered.push(RecoveredBlock { hash: block.hash, data });
                    false
                } else {
                    true
                }
            });
        }
    }
    Ok(())
}

/// Search `haystack` for a `block.length`-byte window whose hash matches.
/// A production locator would use the sibling's own index manifest to find
/// the exact offset directly; this linear scan is the fallback when a
/// manifest is unavailable or untrusted.
fn find_block(haystack: &[u8], block: &WantedBlock, hasher: &dyn HashModule) -> Option<usize> {
    let length = block.length as usize;
    if length == 0 || length > haystack.len() {
        return None;
    }
    (0..=haystack.len() - length).find(|&offset| hasher.hash(&haystack[offset..offset + length]) == block.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Sha256Module;

    #[test]
    fn find_block_locates_matching_window() {
        let hasher = Sha256Module;
        let payload = b"hello";
        let hash = hasher.hash(payload);
        let haystack = [b"garbage-".as_slice(), payload, b"-more-garbage".as_slice()].concat();
        let block = WantedBlock { hash, length: payload.len() as u64 };
        let offset = find_block(&haystack, &block, &hasher).unwrap();
        assert_eq!(&haystack[offset..offset + payload.len()], payload);
    }

    #[test]
    fn find_block_returns_none_when_absent() {
        let hasher = Sha256Module;
        let block = WantedBlock { hash: Id::random(), length: 4 };
        assert!(find_block(b"abcdefgh", &block, &hasher).is_none());
    }
}
