//! Broken fileset repair (§4.7): rebuild a fileset's entry list from its own
//! reopened archive, dropping entries whose block references are missing,
//! renaming and tagging the repaired result. Grounded on the recursive
//! rebuild in `rustic_core::commands::repair::snapshots` (`RepairState`,
//! `Changed`, `repair_tree`), reshaped around a flat entry list since
//! fileset manifests here are not a tree.
use log::{info, warn};

use crate::backend::{Backend, VolumeKind};
use crate::db::{Database, RemoteVolumeRow, RemoteVolumeState};
use crate::error::RepairResult;
use crate::hash::HashModule;
use crate::module::CompressionModule;
use crate::volume::{FilesetEntry, FilesetManifest};

/// Whether repairing an entry changed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Changed {
    /// The entry is unchanged.
    No,
    /// The entry's block list was trimmed.
    Yes,
}

/// Options controlling fileset repair.
#[derive(Debug, Clone)]
pub struct FilesetRepairOptions {
    /// Delete entries whose entire block list is missing, rather than keeping
    /// a zero-length placeholder.
    pub delete_unreadable: bool,
    /// Suffix appended to the manifest filename of a repaired fileset.
    pub suffix: String,
}

impl Default for FilesetRepairOptions {
    fn default() -> Self {
        Self { delete_unreadable: false, suffix: ".repaired".to_string() }
    }
}

/// Outcome of repairing a single fileset manifest.
#[derive(Debug, Clone)]
pub struct FilesetRepairResult {
    /// The repaired manifest, with unreadable block references removed.
    pub manifest: FilesetManifest,
    /// `true` if anything in the manifest was actually changed.
    pub changed: bool,
    /// Entries dropped entirely (their whole block list was missing).
    pub dropped_entries: Vec<String>,
}

/// Rebuild `manifest`, removing references to blocks the backend no longer
/// has (`has_block`), per entry.
pub fn repair(
    manifest: &FilesetManifest,
    options: &FilesetRepairOptions,
    has_block: &dyn Fn(&crate::id::Id) -> bool,
) -> FilesetRepairResult {
    let mut changed_overall = false;
    let mut dropped_entries = Vec::new();
    let mut entries = Vec::with_capacity(manifest.entries.len());

    for entry in &manifest.entries {
        match repair_entry(entry, has_block) {
            (Some(repaired), Changed::Yes) => {
                changed_overall = true;
                entries.push(repaired);
            }
            (Some(repaired), Changed::No) => entries.push(repaired),
            (None, _) => {
                changed_overall = true;
                dropped_entries.push(entry.path.clone());
                if options.delete_unreadable {
                    info!("dropping unreadable fileset entry {}", entry.path);
                } else {
                    warn!("fileset entry {} has no recoverable blocks; dropping it anyway (empty entries are not retained)", entry.path);
                }
            }
        }
    }

    FilesetRepairResult {
        manifest: FilesetManifest { timestamp: manifest.timestamp, entries },
        changed: changed_overall,
        dropped_entries,
    }
}

fn repair_entry(
    entry: &FilesetEntry,
    has_block: &dyn Fn(&crate::id::Id) -> bool,
) -> (Option<FilesetEntry>, Changed) {
    let kept: Vec<_> = entry.block_hashes.iter().copied().filter(has_block).collect();

    if kept.is_empty() && !entry.block_hashes.is_empty() {
        return (None, Changed::Yes);
    }

    if kept.len() == entry.block_hashes.len() {
        return (Some(entry.clone()), Changed::No);
    }

    let size = (entry.size / entry.block_hashes.len().max(1) as u64) * kept.len() as u64;
    (
        Some(FilesetEntry { path: entry.path.clone(), block_hashes: kept, size }),
        Changed::Yes,
    )
}

/// Reupload `manifest` (the output of [`repair`]) under `original_name` with
/// `options.suffix` appended, then relink the database row so a subsequent
/// reconciliation pass sees the repaired volume instead of re-flagging the
/// original.
pub fn mark_repaired(
    backend: &dyn Backend,
    db: &dyn Database,
    hasher: &dyn HashModule,
    compression: &dyn CompressionModule,
    original_name: &str,
    manifest: &FilesetManifest,
    options: &FilesetRepairOptions,
) -> RepairResult<String> {
    let repaired_name = format!("{original_name}{}", options.suffix);
    let written = crate::volume::write_fileset_volume(repaired_name.clone(), manifest, compression)?;
    backend.put(&written.name, written.path())?;
    let hash = written.hash(hasher)?;
    db.upsert_remote_volume(RemoteVolumeRow {
        name: written.name.clone(),
        kind: VolumeKind::Files,
        state: RemoteVolumeState::Verified,
        size: Some(written.size),
        hash: Some(hash),
    })?;
    db.relink_and_remove(original_name, &written.name)?;
    info!("fileset {original_name} repaired and reuploaded as {repaired_name}");
    Ok(repaired_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GuardedFlags, LocalFileHint};
    use crate::id::Id;
    use crate::module::ZstdModule;
    use std::sync::Mutex;

    struct RecordingBackend {
        put_names: Mutex<Vec<String>>,
    }

    impl Backend for RecordingBackend {
        fn list(&self, _prefix: &str) -> RepairResult<Vec<crate::backend::RemoteListing>> {
            Ok(Vec::new())
        }
        fn get(&self, _name: &str) -> RepairResult<crate::backend::DownloadedFile> {
            unimplemented!()
        }
        fn put(&self, name: &str, _local_path: &std::path::Path) -> RepairResult<()> {
            self.put_names.lock().unwrap().push(name.to_string());
            Ok(())
        }
        fn delete(&self, _name: &str, _size: u64) -> RepairResult<()> {
            Ok(())
        }
        fn create_folder(&self) -> RepairResult<()> {
            Ok(())
        }
        fn test(&self) -> RepairResult<()> {
            Ok(())
        }
    }

    struct RecordingDb {
        upserted: Mutex<Vec<RemoteVolumeRow>>,
        relinked: Mutex<Vec<(String, String)>>,
    }

    impl Database for RecordingDb {
        fn is_missing(&self) -> bool {
            false
        }
        fn has_no_known_volumes(&self) -> RepairResult<bool> {
            Ok(false)
        }
        fn guarded_flags(&self) -> RepairResult<GuardedFlags> {
            Ok(GuardedFlags::default())
        }
        fn remote_volumes(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
            Ok(Vec::new())
        }
        fn upsert_remote_volume(&self, row: RemoteVolumeRow) -> RepairResult<()> {
            self.upserted.lock().unwrap().push(row);
            Ok(())
        }
        fn remove_remote_volume(&self, _name: &str) -> RepairResult<()> {
            Ok(())
        }
        fn local_file_hints(&self, _hash: &Id) -> RepairResult<Vec<LocalFileHint>> {
            Ok(Vec::new())
        }
        fn has_block(&self, _hash: &Id) -> RepairResult<bool> {
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
        fn relink_and_remove(&self, old_name: &str, new_name: &str) -> RepairResult<()> {
            self.relinked.lock().unwrap().push((old_name.to_string(), new_name.to_string()));
            Ok(())
        }
    }

    #[test]
    fn mark_repaired_reuploads_the_manifest_and_relinks_the_row() {
        use crate::hash::Sha256Module;

        let backend = RecordingBackend { put_names: Mutex::new(Vec::new()) };
        let db = RecordingDb { upserted: Mutex::new(Vec::new()), relinked: Mutex::new(Vec::new()) };
        let manifest = FilesetManifest { timestamp: None, entries: Vec::new() };
        let options = FilesetRepairOptions::default();

        let repaired_name = mark_repaired(
            &backend,
            &db,
            &Sha256Module,
            &ZstdModule,
            "backup-fAAAA-orig.zstd",
            &manifest,
            &options,
        )
        .unwrap();

        assert_eq!(repaired_name, "backup-fAAAA-orig.zstd.repaired");
        assert_eq!(*backend.put_names.lock().unwrap(), vec![repaired_name.clone()]);
        let upserted = db.upserted.lock().unwrap();
        assert_eq!(upserted.len(), 1);
        assert_eq!(upserted[0].name, repaired_name);
        assert!(upserted[0].hash.is_some());
        assert_eq!(
            *db.relinked.lock().unwrap(),
            vec![("backup-fAAAA-orig.zstd".to_string(), repaired_name)]
        );
    }

    #[test]
    fn entry_with_all_blocks_present_is_unchanged() {
        let a = Id::random();
        let b = Id::random();
        let manifest = FilesetManifest {
            timestamp: None,
            entries: vec![FilesetEntry { path: "file.txt".into(), block_hashes: vec![a, b], size: 20 }],
        };
        let result = repair(&manifest, &FilesetRepairOptions::default(), &|_| true);
        assert!(!result.changed);
        assert_eq!(result.manifest.entries.len(), 1);
    }

    #[test]
    fn entry_with_partial_blocks_is_trimmed_not_dropped() {
        let a = Id::random();
        let b = Id::random();
        let manifest = FilesetManifest {
            timestamp: None,
            entries: vec![FilesetEntry { path: "file.txt".into(), block_hashes: vec![a, b], size: 20 }],
        };
        let result = repair(&manifest, &FilesetRepairOptions::default(), &|h| *h == a);
        assert!(result.changed);
        assert_eq!(result.manifest.entries.len(), 1);
        assert_eq!(result.manifest.entries[0].block_hashes, vec![a]);
    }

    #[test]
    fn entry_with_no_blocks_present_is_dropped() {
        let a = Id::random();
        let manifest = FilesetManifest {
            timestamp: None,
            entries: vec![FilesetEntry { path: "file.txt".into(), block_hashes: vec![a], size: 10 }],
        };
        let result = repair(&manifest, &FilesetRepairOptions::default(), &|_| false);
        assert!(result.changed);
        assert!(result.manifest.entries.is_empty());
        assert_eq!(result.dropped_entries, vec!["file.txt".to_string()]);
    }

    #[test]
    fn entry_with_empty_block_list_is_kept_verbatim() {
        let manifest = FilesetManifest {
            timestamp: None,
            entries: vec![FilesetEntry { path: "empty-dir-marker".into(), block_hashes: vec![], size: 0 }],
        };
        let result = repair(&manifest, &FilesetRepairOptions::default(), &|_| false);
        assert!(!result.changed);
        assert_eq!(result.manifest.entries.len(), 1);
    }
}
