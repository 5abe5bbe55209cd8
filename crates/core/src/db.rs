//! The `Database` trait: the local-database surface the repair engine
//! consumes (spec.md §6, "Database (consumed)"). The schema itself is an
//! external collaborator's concern; this crate only needs the operations
//! listed here.
use crate::backend::VolumeKind;
use crate::error::RepairResult;
use crate::id::Id;

/// Lifecycle state of a remote volume as tracked by the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[non_exhaustive]
pub enum RemoteVolumeState {
    /// reserved a name but not yet uploaded
    Temporary,
    /// upload in flight
    Uploading,
    /// upload acknowledged by the backend
    Uploaded,
    /// content verified against its manifest
    Verified,
    /// delete in flight
    Deleting,
    /// delete acknowledged by the backend
    Deleted,
}

/// A remote volume row as known to the local database.
#[derive(Debug, Clone)]
pub struct RemoteVolumeRow {
    /// The volume's remote filename.
    pub name: String,
    /// Which kind of volume this is.
    pub kind: VolumeKind,
    /// The database's believed lifecycle state.
    pub state: RemoteVolumeState,
    /// The database's believed size in bytes, if known.
    pub size: Option<u64>,
    /// The database's believed content hash, if known.
    pub hash: Option<Id>,
}

/// The guarded flags (§3) that change how aggressively a repair proceeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardedFlags {
    /// A previous recreate-from-remote only partially completed.
    pub partially_recreated: bool,
    /// A repair is already recorded as in progress.
    pub repair_in_progress: bool,
    /// The process was terminated while uploads were still active.
    pub terminated_with_active_uploads: bool,
}

/// A candidate location for recovering a missing block's bytes from a local
/// source file, as recorded by a prior backup run.
#[derive(Debug, Clone)]
pub struct LocalFileHint {
    /// Path to the candidate local file.
    pub path: std::path::PathBuf,
    /// Offset within that file where the block's bytes should start.
    pub offset: u64,
    /// Expected length of the block.
    pub length: u64,
}

/// The local-database surface consumed by the repair engine.
///
/// A concrete schema implements this once; the engine's analyzer, locator,
/// coordinator, and consistency pass only ever see this trait.
pub trait Database: Send + Sync {
    /// `true` if the database file itself does not exist (§4.1 branch 1).
    fn is_missing(&self) -> bool;

    /// `true` if the database exists but records zero remote volumes (§4.1 branch 2).
    fn has_no_known_volumes(&self) -> RepairResult<bool>;

    /// The guarded flags currently recorded.
    fn guarded_flags(&self) -> RepairResult<GuardedFlags>;

    /// Set or clear `TerminatedWithActiveUploads` (§3, §5): set strictly
    /// before the first reupload `Put` of a burst, cleared strictly after
    /// that burst's drain. A schema that doesn't persist this flag can no-op
    /// here — it only ever affects what the *next* run sees after a crash.
    fn set_terminated_with_active_uploads(&self, _active: bool) -> RepairResult<()> {
        Ok(())
    }

    /// Every remote volume row the database currently knows about.
    fn remote_volumes(&self) -> RepairResult<Vec<RemoteVolumeRow>>;

    /// Record a newly observed remote volume.
    fn upsert_remote_volume(&self, row: RemoteVolumeRow) -> RepairResult<()>;

    /// Remove a remote volume row (the remote object itself is gone).
    fn remove_remote_volume(&self, name: &str) -> RepairResult<()>;

    /// Candidate local files that may still hold the bytes of block `hash`.
    fn local_file_hints(&self, hash: &Id) -> RepairResult<Vec<LocalFileHint>>;

    /// `true` if the database believes block `hash` is currently stored in
    /// some remote data volume, per the index manifests it has recorded.
    /// Used by fileset repair (§4.7) to decide which block references in a
    /// manifest still resolve.
    fn has_block(&self, hash: &Id) -> RepairResult<bool>;

    /// The `(hash, length)` of every block the named data volume was known
    /// to contain, for the block locator (§4.3) rebuilding a missing volume.
    /// Defaults to empty: a schema that cannot answer this may still satisfy
    /// the trait, at the cost of the locator recovering nothing for it.
    fn blocks_in_volume(&self, _volume_name: &str) -> RepairResult<Vec<(Id, u64)>> {
        Ok(Vec::new())
    }

    /// Other remote data volumes currently believed to also hold block
    /// `hash`, used as the locator's sibling-fetch candidates (§4.3 source b).
    fn sibling_volumes_for_block(&self, _hash: &Id) -> RepairResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// The filesets that reference block `hash`, used to name the affected
    /// filesets in a `RepairIsNotPossible` diagnostic (§4.3 step 3).
    fn filesets_using_block(&self, _hash: &Id) -> RepairResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// Index volumes the database believes describe zero blocks: leftovers
    /// from a data volume that was itself already removed (§3
    /// `EmptyIndexFiles`, §4.2 phase 8). Defaults to empty, for a schema that
    /// does not track block counts per index row and so never flags any.
    fn empty_index_files(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
        Ok(Vec::new())
    }

    /// Fileset rows the database still knows about that never got (or lost)
    /// a linked remote volume entirely, distinct from a volume that once
    /// existed remotely and vanished (§3 `MissingRemoteFilesets`, §4.2
    /// phase 4). Defaults to empty, for a schema that does not track
    /// fileset-to-volume linkage separately from the remote-volume table.
    fn missing_remote_filesets(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
        Ok(Vec::new())
    }

    /// `true` if the database's own internal consistency check
    /// (`VerifyConsistencyForRepair`, §4.2 precondition 4) passes. Defaults to
    /// `true`, for a schema that has no such check to run.
    fn verify_consistency_for_repair(&self) -> RepairResult<bool> {
        Ok(true)
    }

    /// Fully recreate the database from the remote store, used when no local
    /// database exists at all.
    fn recreate_from_remote(&self) -> RepairResult<()>;

    /// Rename the existing database file aside, `<name>.backup[-N]`, the
    /// first free suffix up to 1000 attempts, before a from-scratch recreate.
    fn rename_aside(&self) -> RepairResult<String>;

    /// §4.6: merge database rows that share an identical content hash.
    fn fix_duplicate_metahash(&self) -> RepairResult<u64>;

    /// §4.6: merge duplicate file-entry rows.
    fn fix_duplicate_fileentries(&self) -> RepairResult<u64>;

    /// §4.6: deduplicate block-list hash rows computed with the given block
    /// size and block-hash size.
    fn fix_duplicate_blocklist_hashes(&self, blocksize: u64, block_hash_size: u64) -> RepairResult<u64>;

    /// §4.6: (re)compute missing block-list hash rows using `algorithm` at `blocksize`.
    fn fix_missing_blocklist_hashes(&self, algorithm: &str, blocksize: u64) -> RepairResult<u64>;

    /// Record `EndTime` for the just-finished operation.
    fn record_end_time(&self) -> RepairResult<()>;

    /// Reconstruct the block-list manifest a DB-known index row should
    /// carry, for rebuilding it after its remote volume was lost while the
    /// data volume it describes is still present (§4.2 phase 6). Defaults to
    /// `None`: a schema that cannot answer this causes that index row to be
    /// dropped instead of rebuilt, since the repair engine has no content to
    /// reconstruct the volume from otherwise.
    fn index_manifest(&self, _volume_name: &str) -> RepairResult<Option<crate::volume::IndexManifest>> {
        Ok(None)
    }

    /// Reconstruct the fileset manifest a DB-known fileset row should carry,
    /// for reuploading it after its remote volume was lost (§4.2 phase 4).
    /// Defaults to `None`: a schema that cannot answer this causes that
    /// fileset's row to be dropped instead of reuploaded, since the repair
    /// engine has no content to fabricate the volume from otherwise.
    fn fileset_manifest(&self, _volume_name: &str) -> RepairResult<Option<crate::volume::FilesetManifest>> {
        Ok(None)
    }

    /// Link a newly (re)uploaded remote volume `new_name` to whatever the old
    /// volume `old_name` was linked to (its fileset, or the filesets/indices
    /// that referenced its blocks), then drop the old row. Defaults to a
    /// plain `remove_remote_volume(old_name)`, for schemas that don't track
    /// such links and so have nothing to carry over.
    fn relink_and_remove(&self, old_name: &str, _new_name: &str) -> RepairResult<()> {
        self.remove_remote_volume(old_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_flags_default_to_clear() {
        let flags = GuardedFlags::default();
        assert!(!flags.partially_recreated);
        assert!(!flags.repair_in_progress);
        assert!(!flags.terminated_with_active_uploads);
    }
}
