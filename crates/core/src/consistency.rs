//! Database consistency pass (§4.6): four idempotent local-only fixups that
//! run regardless of the `RepairInProgress`/`PartiallyRecreated` guarded
//! flags, proceeding with a warning rather than aborting under either.
use log::warn;

use crate::db::{Database, GuardedFlags};
use crate::error::RepairResult;

/// Parameters for the block-list-hash fixups, since both the block size and
/// the hash algorithm used for them are configurable per repository.
#[derive(Debug, Clone)]
pub struct BlocklistHashParams {
    /// The block size blocklist hashes were computed at.
    pub blocksize: u64,
    /// The hash digest size used for each blocklist entry.
    pub block_hash_size: u64,
    /// The hash algorithm id to (re)compute missing entries with.
    pub algorithm: String,
}

/// Tally of rows touched by each fixup, for logging and for the scenario
/// tests in §8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Rows merged by `FixDuplicateMetahash`.
    pub duplicate_metahash_fixed: u64,
    /// Rows merged by `FixDuplicateFileentries`.
    pub duplicate_fileentries_fixed: u64,
    /// Rows deduplicated by `FixDuplicateBlocklistHashes`.
    pub duplicate_blocklist_hashes_fixed: u64,
    /// Rows (re)computed by `FixMissingBlocklistHashes`.
    pub missing_blocklist_hashes_fixed: u64,
}

/// Run all four fixups in order, idempotently.
///
/// Proceeds even under [`GuardedFlags::repair_in_progress`] or
/// [`GuardedFlags::partially_recreated`] — this pass is local-only and safe
/// regardless of the remote store's state — but logs a warning so an
/// operator understands why it ran alongside an incomplete repair.
pub fn run(db: &dyn Database, params: &BlocklistHashParams) -> RepairResult<ConsistencyReport> {
    let flags = db.guarded_flags()?;
    warn_if_guarded(&flags);

    Ok(ConsistencyReport {
        duplicate_metahash_fixed: db.fix_duplicate_metahash()?,
        duplicate_fileentries_fixed: db.fix_duplicate_fileentries()?,
        duplicate_blocklist_hashes_fixed: db
            .fix_duplicate_blocklist_hashes(params.blocksize, params.block_hash_size)?,
        missing_blocklist_hashes_fixed: db
            .fix_missing_blocklist_hashes(&params.algorithm, params.blocksize)?,
    })
}

fn warn_if_guarded(flags: &GuardedFlags) {
    if flags.repair_in_progress {
        warn!("running the database consistency pass while a repair is already in progress");
    }
    if flags.partially_recreated {
        warn!("running the database consistency pass against a partially recreated database");
    }
}
