//! An in-memory [`repair_core::db::Database`], the local-database half of the
//! test-double pair. The teacher crate has no database concept of its own —
//! `rustic_core` only ever talks to backends — so this module has no single
//! teacher file it mirrors line-for-line; it is built in the same spirit as
//! [`crate::backend::InMemoryBackend`]: one `RwLock`-guarded map per
//! [`repair_core::db::Database`] method, with a small builder surface so
//! tests can seed exactly the state a scenario needs.
use std::collections::HashMap;
use std::sync::RwLock;

use repair_core::db::{Database, GuardedFlags, LocalFileHint, RemoteVolumeRow};
use repair_core::error::RepairResult;
use repair_core::id::Id;
use repair_core::volume::{FilesetManifest, IndexManifest};

/// In-memory [`Database`] for tests.
#[derive(Debug)]
pub struct InMemoryDatabase {
    missing: RwLock<bool>,
    flags: RwLock<GuardedFlags>,
    rows: RwLock<Vec<RemoteVolumeRow>>,
    local_hints: RwLock<HashMap<Id, Vec<LocalFileHint>>>,
    known_blocks: RwLock<HashMap<Id, bool>>,
    blocks_in_volume: RwLock<HashMap<String, Vec<(Id, u64)>>>,
    siblings_for_block: RwLock<HashMap<Id, Vec<String>>>,
    filesets_using_block: RwLock<HashMap<Id, Vec<String>>>,
    empty_index_files: RwLock<Vec<RemoteVolumeRow>>,
    missing_remote_filesets: RwLock<Vec<RemoteVolumeRow>>,
    consistent_for_repair: RwLock<bool>,
    fileset_manifests: RwLock<HashMap<String, FilesetManifest>>,
    index_manifests: RwLock<HashMap<String, IndexManifest>>,
    recreated: RwLock<bool>,
    renamed_aside: RwLock<Vec<String>>,
    end_time_recorded: RwLock<u64>,
    consistency_fixups: RwLock<(u64, u64, u64, u64)>,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self {
            missing: RwLock::new(false),
            flags: RwLock::new(GuardedFlags::default()),
            rows: RwLock::new(Vec::new()),
            local_hints: RwLock::new(HashMap::new()),
            known_blocks: RwLock::new(HashMap::new()),
            blocks_in_volume: RwLock::new(HashMap::new()),
            siblings_for_block: RwLock::new(HashMap::new()),
            filesets_using_block: RwLock::new(HashMap::new()),
            empty_index_files: RwLock::new(Vec::new()),
            missing_remote_filesets: RwLock::new(Vec::new()),
            consistent_for_repair: RwLock::new(true),
            fileset_manifests: RwLock::new(HashMap::new()),
            index_manifests: RwLock::new(HashMap::new()),
            recreated: RwLock::new(false),
            renamed_aside: RwLock::new(Vec::new()),
            end_time_recorded: RwLock::new(0),
            consistency_fixups: RwLock::new((0, 0, 0, 0)),
        }
    }
}

impl InMemoryDatabase {
    /// A fresh database that reports no local file at all (§4.1 branch 1).
    #[must_use]
    pub fn missing() -> Self {
        Self { missing: RwLock::new(true), ..Self::default() }
    }

    /// A fresh, existing database with no recorded remote volumes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a remote volume row, as if already known to the database.
    #[must_use]
    pub fn with_row(self, row: RemoteVolumeRow) -> Self {
        self.rows.write().unwrap().push(row);
        self
    }

    /// Seed the guarded flags.
    #[must_use]
    pub fn with_guarded_flags(self, flags: GuardedFlags) -> Self {
        *self.flags.write().unwrap() = flags;
        self
    }

    /// Seed a local-file recovery hint for a block.
    #[must_use]
    pub fn with_local_hint(self, hash: Id, hint: LocalFileHint) -> Self {
        self.local_hints.write().unwrap().entry(hash).or_default().push(hint);
        self
    }

    /// Mark a block as known to be present in some remote data volume.
    #[must_use]
    pub fn with_known_block(self, hash: Id) -> Self {
        self.known_blocks.write().unwrap().insert(hash, true);
        self
    }

    /// Seed the block list a named data volume is believed to contain.
    #[must_use]
    pub fn with_blocks_in_volume(self, volume_name: impl Into<String>, blocks: Vec<(Id, u64)>) -> Self {
        self.blocks_in_volume.write().unwrap().insert(volume_name.into(), blocks);
        self
    }

    /// Seed the sibling data volumes believed to also hold a block.
    #[must_use]
    pub fn with_siblings_for_block(self, hash: Id, siblings: Vec<String>) -> Self {
        self.siblings_for_block.write().unwrap().insert(hash, siblings);
        self
    }

    /// Seed the filesets that reference a block, for `RepairIsNotPossible` diagnostics.
    #[must_use]
    pub fn with_filesets_using_block(self, hash: Id, filesets: Vec<String>) -> Self {
        self.filesets_using_block.write().unwrap().insert(hash, filesets);
        self
    }

    /// Seed an index volume the database believes describes zero blocks.
    #[must_use]
    pub fn with_empty_index_file(self, row: RemoteVolumeRow) -> Self {
        self.empty_index_files.write().unwrap().push(row);
        self
    }

    /// Seed a fileset volume known to the database with no linked remote volume at all.
    #[must_use]
    pub fn with_missing_remote_fileset(self, row: RemoteVolumeRow) -> Self {
        self.missing_remote_filesets.write().unwrap().push(row);
        self
    }

    /// Make [`Database::verify_consistency_for_repair`] report failure, as if
    /// the database's own consistency check had found a problem.
    #[must_use]
    pub fn mark_inconsistent_for_repair(self) -> Self {
        *self.consistent_for_repair.write().unwrap() = false;
        self
    }

    /// Seed the reconstructable manifest for a fileset volume.
    #[must_use]
    pub fn with_fileset_manifest(self, volume_name: impl Into<String>, manifest: FilesetManifest) -> Self {
        self.fileset_manifests.write().unwrap().insert(volume_name.into(), manifest);
        self
    }

    /// Seed the reconstructable block-list manifest for an index volume.
    #[must_use]
    pub fn with_index_manifest(self, volume_name: impl Into<String>, manifest: IndexManifest) -> Self {
        self.index_manifests.write().unwrap().insert(volume_name.into(), manifest);
        self
    }

    /// `true` if [`Database::recreate_from_remote`] has been called.
    #[must_use]
    pub fn was_recreated(&self) -> bool {
        *self.recreated.read().unwrap()
    }

    /// The names this database renamed aside, in call order.
    #[must_use]
    pub fn renamed_aside_names(&self) -> Vec<String> {
        self.renamed_aside.read().unwrap().clone()
    }

    /// How many times `record_end_time` has been called.
    #[must_use]
    pub fn end_time_recorded_count(&self) -> u64 {
        *self.end_time_recorded.read().unwrap()
    }

    /// The current snapshot of remote volume rows, for test assertions.
    #[must_use]
    pub fn rows_snapshot(&self) -> Vec<RemoteVolumeRow> {
        self.rows.read().unwrap().clone()
    }
}

impl Database for InMemoryDatabase {
    fn is_missing(&self) -> bool {
        *self.missing.read().unwrap()
    }

    fn has_no_known_volumes(&self) -> RepairResult<bool> {
        Ok(self.rows.read().unwrap().is_empty())
    }

    fn guarded_flags(&self) -> RepairResult<GuardedFlags> {
        Ok(*self.flags.read().unwrap())
    }

    fn set_terminated_with_active_uploads(&self, active: bool) -> RepairResult<()> {
        self.flags.write().unwrap().terminated_with_active_uploads = active;
        Ok(())
    }

    fn remote_volumes(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
        Ok(self.rows.read().unwrap().clone())
    }

    fn upsert_remote_volume(&self, row: RemoteVolumeRow) -> RepairResult<()> {
        let mut rows = self.rows.write().unwrap();
        if let Some(existing) = rows.iter_mut().find(|existing| existing.name == row.name) {
            *existing = row;
        } else {
            rows.push(row);
        }
        Ok(())
    }

    fn remove_remote_volume(&self, name: &str) -> RepairResult<()> {
        self.rows.write().unwrap().retain(|row| row.name != name);
        Ok(())
    }

    fn local_file_hints(&self, hash: &Id) -> RepairResult<Vec<LocalFileHint>> {
        Ok(self.local_hints.read().unwrap().get(hash).cloned().unwrap_or_default())
    }

    fn has_block(&self, hash: &Id) -> RepairResult<bool> {
        Ok(self.known_blocks.read().unwrap().contains_key(hash))
    }

    fn blocks_in_volume(&self, volume_name: &str) -> RepairResult<Vec<(Id, u64)>> {
        Ok(self.blocks_in_volume.read().unwrap().get(volume_name).cloned().unwrap_or_default())
    }

    fn sibling_volumes_for_block(&self, hash: &Id) -> RepairResult<Vec<String>> {
        Ok(self.siblings_for_block.read().unwrap().get(hash).cloned().unwrap_or_default())
    }

    fn filesets_using_block(&self, hash: &Id) -> RepairResult<Vec<String>> {
        Ok(self.filesets_using_block.read().unwrap().get(hash).cloned().unwrap_or_default())
    }

    fn empty_index_files(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
        Ok(self.empty_index_files.read().unwrap().clone())
    }

    fn missing_remote_filesets(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
        Ok(self.missing_remote_filesets.read().unwrap().clone())
    }

    fn verify_consistency_for_repair(&self) -> RepairResult<bool> {
        Ok(*self.consistent_for_repair.read().unwrap())
    }

    fn recreate_from_remote(&self) -> RepairResult<()> {
        *self.recreated.write().unwrap() = true;
        *self.missing.write().unwrap() = false;
        Ok(())
    }

    fn rename_aside(&self) -> RepairResult<String> {
        let mut renamed = self.renamed_aside.write().unwrap();
        let suffix = if renamed.is_empty() { String::new() } else { format!("-{}", renamed.len()) };
        let name = format!("database.backup{suffix}");
        renamed.push(name.clone());
        Ok(name)
    }

    fn fix_duplicate_metahash(&self) -> RepairResult<u64> {
        let mut fixups = self.consistency_fixups.write().unwrap();
        fixups.0 += 1;
        Ok(0)
    }

    fn fix_duplicate_fileentries(&self) -> RepairResult<u64> {
        let mut fixups = self.consistency_fixups.write().unwrap();
        fixups.1 += 1;
        Ok(0)
    }

    fn fix_duplicate_blocklist_hashes(&self, _blocksize: u64, _block_hash_size: u64) -> RepairResult<u64> {
        let mut fixups = self.consistency_fixups.write().unwrap();
        fixups.2 += 1;
        Ok(0)
    }

    fn fix_missing_blocklist_hashes(&self, _algorithm: &str, _blocksize: u64) -> RepairResult<u64> {
        let mut fixups = self.consistency_fixups.write().unwrap();
        fixups.3 += 1;
        Ok(0)
    }

    fn record_end_time(&self) -> RepairResult<()> {
        *self.end_time_recorded.write().unwrap() += 1;
        Ok(())
    }

    fn fileset_manifest(&self, volume_name: &str) -> RepairResult<Option<FilesetManifest>> {
        Ok(self.fileset_manifests.read().unwrap().get(volume_name).cloned())
    }

    fn index_manifest(&self, volume_name: &str) -> RepairResult<Option<IndexManifest>> {
        Ok(self.index_manifests.read().unwrap().get(volume_name).cloned())
    }

    fn relink_and_remove(&self, old_name: &str, new_name: &str) -> RepairResult<()> {
        if let Some(manifest) = self.fileset_manifests.write().unwrap().remove(old_name) {
            self.fileset_manifests.write().unwrap().insert(new_name.to_string(), manifest);
        }
        if let Some(manifest) = self.index_manifests.write().unwrap().remove(old_name) {
            self.index_manifests.write().unwrap().insert(new_name.to_string(), manifest);
        }
        self.remove_remote_volume(old_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repair_core::backend::VolumeKind;
    use repair_core::db::RemoteVolumeState;

    fn row(name: &str, kind: VolumeKind, state: RemoteVolumeState) -> RemoteVolumeRow {
        RemoteVolumeRow { name: name.to_string(), kind, state, size: Some(10), hash: None }
    }

    #[test]
    fn upsert_replaces_an_existing_row_by_name() {
        let db = InMemoryDatabase::new()
            .with_row(row("set-bAAAA-x.zstd", VolumeKind::Blocks, RemoteVolumeState::Uploaded));
        db.upsert_remote_volume(row("set-bAAAA-x.zstd", VolumeKind::Blocks, RemoteVolumeState::Verified)).unwrap();
        let rows = db.remote_volumes().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, RemoteVolumeState::Verified);
    }

    #[test]
    fn remove_drops_the_row() {
        let db = InMemoryDatabase::new()
            .with_row(row("set-bAAAA-x.zstd", VolumeKind::Blocks, RemoteVolumeState::Uploaded));
        db.remove_remote_volume("set-bAAAA-x.zstd").unwrap();
        assert!(db.remote_volumes().unwrap().is_empty());
    }

    #[test]
    fn missing_database_reports_is_missing() {
        let db = InMemoryDatabase::missing();
        assert!(db.is_missing());
        db.recreate_from_remote().unwrap();
        assert!(!db.is_missing());
        assert!(db.was_recreated());
    }

    #[test]
    fn rename_aside_picks_successive_suffixes() {
        let db = InMemoryDatabase::new();
        assert_eq!(db.rename_aside().unwrap(), "database.backup");
        assert_eq!(db.rename_aside().unwrap(), "database.backup-1");
    }

    #[test]
    fn fresh_database_is_consistent_for_repair_by_default() {
        let db = InMemoryDatabase::new();
        assert!(db.verify_consistency_for_repair().unwrap());
    }

    #[test]
    fn marking_inconsistent_flips_the_consistency_check() {
        let db = InMemoryDatabase::new().mark_inconsistent_for_repair();
        assert!(!db.verify_consistency_for_repair().unwrap());
    }

    #[test]
    fn missing_remote_filesets_are_seeded_through_the_builder() {
        let seeded = row("set-fAAAA-x.zstd", VolumeKind::Files, RemoteVolumeState::Uploaded);
        let db = InMemoryDatabase::new().with_missing_remote_fileset(seeded.clone());
        let got = db.missing_remote_filesets().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, seeded.name);
    }

    #[test]
    fn relink_and_remove_carries_the_manifest_to_the_new_name() {
        let manifest = FilesetManifest { timestamp: None, entries: Vec::new() };
        let db = InMemoryDatabase::new().with_fileset_manifest("old-fAAAA-x.zstd", manifest);
        db.relink_and_remove("old-fAAAA-x.zstd", "new-fAAAA-x.zstd").unwrap();
        assert!(db.fileset_manifest("old-fAAAA-x.zstd").unwrap().is_none());
        assert!(db.fileset_manifest("new-fAAAA-x.zstd").unwrap().is_some());
    }
}
