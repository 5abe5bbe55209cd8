//! Remote inventory analyzer (§4.4): classify divergence between the
//! backend's listing and the local database's belief.
//!
//! Structurally grounded on `check_packs`/`check_packs_list` in
//! `rustic_core::commands::check`: the backend listing seeds a map, database
//! rows are reconciled against it by removal, and whatever remains on either
//! side becomes a discrepancy bucket.
use std::collections::HashMap;

use crate::backend::{Backend, RemoteListing, VolumeKind};
use crate::db::{Database, RemoteVolumeRow, RemoteVolumeState};
use crate::error::RepairResult;
use crate::volume::VolumeName;

/// The six discrepancy classes from §3.
#[derive(Debug, Clone, Default)]
pub struct Discrepancies {
    /// Remote volumes the backend has, that the database has never heard of.
    pub extra_volumes: Vec<RemoteListing>,
    /// Volumes the database believes exist remotely, that the backend does not have.
    pub missing_volumes: Vec<RemoteVolumeRow>,
    /// Volumes present on both sides but not yet `Verified`.
    pub verification_required: Vec<RemoteVolumeRow>,
    /// Fileset rows the database knows about that never had (or no longer
    /// have) any linked remote volume at all — distinct from
    /// `missing_volumes`, which covers a volume that *did* exist remotely
    /// and has since vanished. Sourced from the database directly, since the
    /// backend listing alone cannot tell the two apart.
    pub missing_remote_filesets: Vec<RemoteVolumeRow>,
    /// Fileset volumes the backend has, that the database has no row for.
    pub missing_local_filesets: Vec<RemoteListing>,
    /// Index volumes whose manifest describes zero blocks.
    pub empty_index_files: Vec<RemoteVolumeRow>,
}

impl Discrepancies {
    /// `true` if every bucket is empty — the remote store and local database
    /// already agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.extra_volumes.is_empty()
            && self.missing_volumes.is_empty()
            && self.verification_required.is_empty()
            && self.missing_remote_filesets.is_empty()
            && self.missing_local_filesets.is_empty()
            && self.empty_index_files.is_empty()
    }
}

/// Mode controlling how aggressively [`analyze`] treats unverified volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Only flag volumes the database has never marked `Verified`.
    Normal,
    /// Flag every non-fileset volume for re-verification, except the most
    /// recent fileset, which is exempted since it may still be mid-upload.
    VerifyAndCleanForced,
}

/// Classify the divergence between `backend`'s listing and `db`'s rows.
pub fn analyze(backend: &dyn Backend, db: &dyn Database, mode: VerifyMode) -> RepairResult<Discrepancies> {
    let listing = backend.list("")?;
    let mut remote_by_name: HashMap<String, RemoteListing> =
        listing.into_iter().map(|entry| (entry.name.clone(), entry)).collect();

    let mut rows = db.remote_volumes()?;
    let mut discrepancies = Discrepancies::default();

    let last_fileset_name = rows
        .iter()
        .filter(|r| r.kind == VolumeKind::Files)
        .max_by_key(|r| r.name.clone())
        .map(|r| r.name.clone());

    rows.retain(|row| {
        match remote_by_name.remove(&row.name) {
            None => {
                discrepancies.missing_volumes.push(row.clone());
                false
            }
            Some(_listing) => {
                let needs_verification = match mode {
                    VerifyMode::Normal => row.state != RemoteVolumeState::Verified,
                    VerifyMode::VerifyAndCleanForced => {
                        Some(&row.name) != last_fileset_name.as_ref()
                    }
                };
                if needs_verification {
                    discrepancies.verification_required.push(row.clone());
                }
                true
            }
        }
    });

    for (name, listing) in remote_by_name {
        match VolumeName::parse(&name) {
            Ok(parsed) if parsed.kind == VolumeKind::Files => {
                discrepancies.missing_local_filesets.push(listing);
            }
            _ => discrepancies.extra_volumes.push(listing),
        }
    }

    discrepancies.empty_index_files = db.empty_index_files()?;
    discrepancies.missing_remote_filesets = db.missing_remote_filesets()?;

    Ok(discrepancies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeBackend {
        listing: Vec<RemoteListing>,
    }

    impl Backend for FakeBackend {
        fn list(&self, _prefix: &str) -> RepairResult<Vec<RemoteListing>> {
            Ok(self.listing.clone())
        }
        fn get(&self, _name: &str) -> RepairResult<crate::backend::DownloadedFile> {
            unimplemented!()
        }
        fn put(&self, _name: &str, _local_path: &std::path::Path) -> RepairResult<()> {
            unimplemented!()
        }
        fn delete(&self, _name: &str, _size: u64) -> RepairResult<()> {
            unimplemented!()
        }
        fn create_folder(&self) -> RepairResult<()> {
            Ok(())
        }
        fn test(&self) -> RepairResult<()> {
            Ok(())
        }
    }

    impl Clone for RemoteListing {
        fn clone(&self) -> Self {
            Self { name: self.name.clone(), size: self.size }
        }
    }

    struct FakeDb {
        rows: Mutex<Vec<RemoteVolumeRow>>,
    }

    impl Database for FakeDb {
        fn is_missing(&self) -> bool {
            false
        }
        fn has_no_known_volumes(&self) -> RepairResult<bool> {
            Ok(self.rows.lock().unwrap().is_empty())
        }
        fn guarded_flags(&self) -> RepairResult<crate::db::GuardedFlags> {
            Ok(crate::db::GuardedFlags::default())
        }
        fn remote_volumes(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
            Ok(self.rows.lock().unwrap().clone())
        }
        fn upsert_remote_volume(&self, row: RemoteVolumeRow) -> RepairResult<()> {
            self.rows.lock().unwrap().push(row);
            Ok(())
        }
        fn remove_remote_volume(&self, name: &str) -> RepairResult<()> {
            self.rows.lock().unwrap().retain(|r| r.name != name);
            Ok(())
        }
        fn local_file_hints(&self, _hash: &crate::id::Id) -> RepairResult<Vec<crate::db::LocalFileHint>> {
            Ok(Vec::new())
        }
        fn has_block(&self, _hash: &crate::id::Id) -> RepairResult<bool> {
            Ok(false)
        }
        fn recreate_from_remote(&self) -> RepairResult<()> {
            Ok(())
        }
        fn rename_aside(&self) -> RepairResult<String> {
            Ok(String::new())
        }
        fn fix_duplicate_metahash(&self) -> RepairResult<u64> {
            Ok(0)
        }
        fn fix_duplicate_fileentries(&self) -> RepairResult<u64> {
            Ok(0)
        }
        fn fix_duplicate_blocklist_hashes(&self, _blocksize: u64, _block_hash_size: u64) -> RepairResult<u64> {
            Ok(0)
        }
        fn fix_missing_blocklist_hashes(&self, _algorithm: &str, _blocksize: u64) -> RepairResult<u64> {
            Ok(0)
        }
        fn record_end_time(&self) -> RepairResult<()> {
            Ok(())
        }
    }

    fn row(name: &str, kind: VolumeKind, state: RemoteVolumeState) -> RemoteVolumeRow {
        RemoteVolumeRow { name: name.to_string(), kind, state, size: Some(10), hash: None }
    }

    #[test]
    fn matching_verified_volume_is_consistent() {
        let backend = FakeBackend {
            listing: vec![RemoteListing { name: "set-bAAAA-abcd.zstd".into(), size: Some(10) }],
        };
        let db = FakeDb {
            rows: Mutex::new(vec![row("set-bAAAA-abcd.zstd", VolumeKind::Blocks, RemoteVolumeState::Verified)]),
        };
        let discrepancies = analyze(&backend, &db, VerifyMode::Normal).unwrap();
        assert!(discrepancies.is_consistent());
    }

    #[test]
    fn db_only_volume_is_missing() {
        let backend = FakeBackend { listing: vec![] };
        let db = FakeDb {
            rows: Mutex::new(vec![row("set-bAAAA-abcd.zstd", VolumeKind::Blocks, RemoteVolumeState::Uploaded)]),
        };
        let discrepancies = analyze(&backend, &db, VerifyMode::Normal).unwrap();
        assert_eq!(discrepancies.missing_volumes.len(), 1);
    }

    #[test]
    fn db_only_fileset_volume_is_missing_not_a_remote_fileset_gap() {
        let backend = FakeBackend { listing: vec![] };
        let db = FakeDb {
            rows: Mutex::new(vec![row("set-fAAAA-abcd.zstd", VolumeKind::Files, RemoteVolumeState::Uploaded)]),
        };
        let discrepancies = analyze(&backend, &db, VerifyMode::Normal).unwrap();
        assert_eq!(discrepancies.missing_volumes.len(), 1);
        assert!(discrepancies.missing_remote_filesets.is_empty());
    }

    #[test]
    fn backend_only_volume_is_extra() {
        let backend = FakeBackend {
            listing: vec![RemoteListing { name: "set-bAAAA-abcd.zstd".into(), size: Some(10) }],
        };
        let db = FakeDb { rows: Mutex::new(vec![]) };
        let discrepancies = analyze(&backend, &db, VerifyMode::Normal).unwrap();
        assert_eq!(discrepancies.extra_volumes.len(), 1);
    }

    #[test]
    fn unverified_volume_needs_verification() {
        let backend = FakeBackend {
            listing: vec![RemoteListing { name: "set-bAAAA-abcd.zstd".into(), size: Some(10) }],
        };
        let db = FakeDb {
            rows: Mutex::new(vec![row("set-bAAAA-abcd.zstd", VolumeKind::Blocks, RemoteVolumeState::Uploaded)]),
        };
        let discrepancies = analyze(&backend, &db, VerifyMode::Normal).unwrap();
        assert_eq!(discrepancies.verification_required.len(), 1);
    }

    #[derive(Default)]
    struct EmptyIndexDb {
        empty_index: Vec<RemoteVolumeRow>,
        missing_remote_filesets: Vec<RemoteVolumeRow>,
    }

    impl Database for EmptyIndexDb {
        fn is_missing(&self) -> bool {
            false
        }
        fn has_no_known_volumes(&self) -> RepairResult<bool> {
            Ok(false)
        }
        fn guarded_flags(&self) -> RepairResult<crate::db::GuardedFlags> {
            Ok(crate::db::GuardedFlags::default())
        }
        fn remote_volumes(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
            Ok(Vec::new())
        }
        fn upsert_remote_volume(&self, _row: RemoteVolumeRow) -> RepairResult<()> {
            Ok(())
        }
        fn remove_remote_volume(&self, _name: &str) -> RepairResult<()> {
            Ok(())
        }
        fn local_file_hints(&self, _hash: &crate::id::Id) -> RepairResult<Vec<crate::db::LocalFileHint>> {
            Ok(Vec::new())
        }
        fn has_block(&self, _hash: &crate::id::Id) -> RepairResult<bool> {
            Ok(false)
        }
        fn recreate_from_remote(&self) -> RepairResult<()> {
            Ok(())
        }
        fn rename_aside(&self) -> RepairResult<String> {
            Ok(String::new())
        }
        fn fix_duplicate_metahash(&self) -> RepairResult<u64> {
            Ok(0)
        }
        fn fix_duplicate_fileentries(&self) -> RepairResult<u64> {
            Ok(0)
        }
        fn fix_duplicate_blocklist_hashes(&self, _blocksize: u64, _block_hash_size: u64) -> RepairResult<u64> {
            Ok(0)
        }
        fn fix_missing_blocklist_hashes(&self, _algorithm: &str, _blocksize: u64) -> RepairResult<u64> {
            Ok(0)
        }
        fn record_end_time(&self) -> RepairResult<()> {
            Ok(())
        }
        fn empty_index_files(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
            Ok(self.empty_index.clone())
        }
        fn missing_remote_filesets(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
            Ok(self.missing_remote_filesets.clone())
        }
    }

    #[test]
    fn missing_remote_filesets_are_surfaced_from_the_database() {
        let backend = FakeBackend { listing: vec![] };
        let db = EmptyIndexDb {
            missing_remote_filesets: vec![row("set-fAAAA-orphan.zstd", VolumeKind::Files, RemoteVolumeState::Uploaded)],
            ..Default::default()
        };
        let discrepancies = analyze(&backend, &db, VerifyMode::Normal).unwrap();
        assert_eq!(discrepancies.missing_remote_filesets.len(), 1);
        assert!(!discrepancies.is_consistent());
    }

    #[test]
    fn empty_index_files_are_surfaced_from_the_database() {
        let backend = FakeBackend { listing: vec![] };
        let db = EmptyIndexDb {
            empty_index: vec![row("set-iAAAA-empty.zstd", VolumeKind::Index, RemoteVolumeState::Verified)],
            ..Default::default()
        };
        let discrepancies = analyze(&backend, &db, VerifyMode::Normal).unwrap();
        assert_eq!(discrepancies.empty_index_files.len(), 1);
        assert!(!discrepancies.is_consistent());
    }
}
