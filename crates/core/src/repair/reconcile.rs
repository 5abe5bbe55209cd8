//! Remote reconciliation (§4.2): the fixed 8-phase processing order that
//! drives the backend and database back into agreement once §4.4's analyzer
//! has classified the divergence.
//!
//! Each phase is its own function taking `&mut ReconcileState`, a
//! transaction-scoped object per the "reusable transactions" design note
//! (§9), so the orchestrating function reads as the ordered phase list,
//! the same way `check_repository` in `rustic_core::commands::check` reads
//! as an ordered sequence of `check_*` calls.
use std::collections::HashMap;

use log::{info, warn};

use crate::analyzer::{analyze, Discrepancies, VerifyMode};
use crate::backend::{Backend, VolumeKind};
use crate::cancellation::Cancellation;
use crate::db::{Database, RemoteVolumeRow, RemoteVolumeState};
use crate::error::{ErrorKind, RepairError, RepairResult, UserInformationKind};
use crate::hash::{HashModule, Sha256Module};
use crate::id::Id;
use crate::locator::{self, WantedBlock};
use crate::module::{CompressionModule, ZstdModule};
use crate::progress::{Progress, ProgressBars, ProgressType};
use crate::volume::VolumeName;

use super::options::RepairOptions;

/// Tally of what each phase actually did, surfaced back to the caller for
/// logging and for the scenario tests in §8.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Volumes re-verified in phase 1.
    pub verified: Vec<String>,
    /// Extra index volumes adopted into the database in phase 2.
    pub adopted: Vec<String>,
    /// Extra remote volumes deleted as garbage in phase 2 (everything that
    /// wasn't a successfully adopted index volume).
    pub extras_deleted: Vec<String>,
    /// `true` if phase 3's missing-dblock guard blocked further repair.
    pub blocked_on_missing_dblocks: bool,
    /// DB-known filesets that lost their remote volume, reuploaded in phase 4.
    pub remote_filesets_recorded: Vec<String>,
    /// Remote-only fileset volumes downloaded and recorded in phase 5.
    pub local_filesets_removed: Vec<String>,
    /// Volumes re-created in phase 6, by kind.
    pub volumes_recreated: Vec<String>,
    /// `true` if phase 7 drained the upload queue.
    pub drained: bool,
    /// Empty index volumes deleted in phase 8.
    pub empty_index_files_removed: Vec<String>,
}

/// Per-call state threaded through every phase; a transaction scope in the
/// sense of §9 — built once per `reconcile` call, discarded at the end.
struct ReconcileState<'a> {
    backend: &'a dyn Backend,
    db: &'a dyn Database,
    options: &'a RepairOptions,
    progress: &'a dyn ProgressBars,
    cancellation: &'a dyn Cancellation,
    hasher: &'a dyn HashModule,
    compression: &'a dyn CompressionModule,
    bar: &'a Progress,
    report: ReconcileReport,
    /// Data volumes phase 3 fully recovered, awaiting phase 6's upload.
    recovered_data_volumes: Vec<(RemoteVolumeRow, HashMap<Id, Vec<u8>>)>,
}

/// Run the fixed 8-phase remote reconciliation.
///
/// Preconditions: the caller has already run §4.6 (database consistency) and
/// §4.7 (broken fileset repair, if any) before this is called, per §4.1's
/// top-level decision tree.
pub fn reconcile(
    backend: &dyn Backend,
    db: &dyn Database,
    options: &RepairOptions,
    progress: &dyn ProgressBars,
    cancellation: &dyn Cancellation,
) -> RepairResult<ReconcileReport> {
    check_preconditions(db)?;

    let mode = if options.verify_and_clean_forced {
        VerifyMode::VerifyAndCleanForced
    } else {
        VerifyMode::Normal
    };
    let discrepancies = analyze(backend, db, mode)?;
    info!(
        "reconciliation inventory: {} extra, {} missing, {} need verification, {} DB-only filesets, {} remote-only filesets, {} empty index files",
        discrepancies.extra_volumes.len(),
        discrepancies.missing_volumes.len(),
        discrepancies.verification_required.len(),
        discrepancies.missing_remote_filesets.len(),
        discrepancies.missing_local_filesets.len(),
        discrepancies.empty_index_files.len(),
    );

    check_freshness(db, &discrepancies, options)?;
    if options.dry_run {
        check_dry_run_sanity(&discrepancies, options)?;
    }

    let target = discrepancies.extra_volumes.len()
        + discrepancies.missing_volumes.len()
        + discrepancies.verification_required.len()
        + discrepancies.missing_remote_filesets.len()
        + discrepancies.missing_local_filesets.len()
        + discrepancies.empty_index_files.len();

    let bar = progress.progress(ProgressType::Counter, "reconciling remote store");
    bar.set_length(target as u64);

    let mut state = ReconcileState {
        backend,
        db,
        options,
        progress,
        cancellation,
        hasher: &Sha256Module,
        compression: &ZstdModule,
        bar: &bar,
        report: ReconcileReport::default(),
        recovered_data_volumes: Vec::new(),
    };

    phase1_verification_required(&mut state, &discrepancies)?;
    phase2_extras_adoption(&mut state, &discrepancies)?;
    phase3_missing_dblock_guard(&mut state, &discrepancies)?;
    if state.report.blocked_on_missing_dblocks {
        bar.finish();
        return Ok(state.report);
    }

    // Phases 4 and 6 are the reupload burst: a missing-remote-fileset row
    // reuploads a fresh fileset volume, and a missing index/data row
    // reuploads its rebuilt replacement. Mark the burst as active strictly
    // before the first `Put`, per §3/§5, so a crash mid-burst is visible to
    // the next run even if this process never reaches the drain below.
    let will_reupload = !discrepancies.missing_remote_filesets.is_empty()
        || discrepancies
            .missing_volumes
            .iter()
            .any(|r| r.kind == VolumeKind::Index || r.kind == VolumeKind::Files)
        || !state.recovered_data_volumes.is_empty();
    if will_reupload && !state.options.dry_run {
        state.db.set_terminated_with_active_uploads(true)?;
    }

    phase4_missing_remote_filesets(&mut state, &discrepancies)?;
    phase5_missing_local_filesets(&mut state, &discrepancies)?;
    phase6_missing_volumes_by_kind(&mut state, &discrepancies)?;
    phase7_drain(&mut state)?;
    if will_reupload && !state.options.dry_run {
        state.db.set_terminated_with_active_uploads(false)?;
    }
    phase8_empty_index_files(&mut state, &discrepancies)?;

    bar.finish();
    Ok(state.report)
}

/// §4.2's four preconditions, re-checked here (not only by
/// [`super::coordinator::Coordinator`]) since a caller may invoke this
/// function directly per spec's exposed sub-operations, bypassing the
/// coordinator's own branch selection.
fn check_preconditions(db: &dyn Database) -> RepairResult<()> {
    if db.is_missing() {
        return Err(RepairError::user_information(
            UserInformationKind::RepairDatabaseFileDoesNotExist,
            "no local database file exists; recreate it before reconciling",
        ));
    }
    let flags = db.guarded_flags()?;
    if flags.partially_recreated {
        return Err(RepairError::user_information(
            UserInformationKind::DatabaseIsPartiallyRecreated,
            "the local database was only partially recreated by a previous run",
        ));
    }
    if flags.repair_in_progress {
        return Err(RepairError::user_information(
            UserInformationKind::DatabaseIsInRepairState,
            "a repair is already recorded as in progress",
        ));
    }
    if !db.verify_consistency_for_repair()? {
        return Err(RepairError::user_information(
            UserInformationKind::DatabaseFailedConsistencyCheck,
            "the local database failed its own consistency check",
        ));
    }
    Ok(())
}

/// Compare the newest fileset timestamp the database knows about against the
/// newest parseable `Files`-kind volume the backend currently lists. A
/// remote store newer than the database means a backup ran since the
/// database was last updated — repairing now would silently regress it.
///
/// Re-checks `db.is_missing()` itself (`DatabaseDoesNotExist`), the same
/// defensively-reentrant reasoning as [`check_preconditions`]: this is the
/// one other helper in the module that queries the database for fileset
/// times, so it must not assume its caller already confirmed the database
/// exists.
fn check_freshness(db: &dyn Database, discrepancies: &Discrepancies, options: &RepairOptions) -> RepairResult<()> {
    if db.is_missing() {
        return Err(RepairError::user_information(
            UserInformationKind::DatabaseDoesNotExist,
            "cannot compare freshness: the local database does not exist",
        ));
    }

    let local_max = db
        .remote_volumes()?
        .iter()
        .filter(|row| row.kind == VolumeKind::Files)
        .filter_map(|row| VolumeName::parse(&row.name).ok())
        .map(|parsed| parsed.timestamp)
        .max();

    let remote_max = discrepancies
        .missing_local_filesets
        .iter()
        .filter_map(|listing| VolumeName::parse(&listing.name).ok())
        .map(|parsed| parsed.timestamp)
        .max();

    if local_max.is_none() && remote_max.is_some() {
        if !options.repair_ignore_outdated_database {
            return Err(RepairError::user_information(
                UserInformationKind::LocalDatabaseHasNoFilesetTimes,
                "the remote store has fileset volumes but the local database has no recorded fileset times to compare against",
            ));
        }
        warn!("local database has no recorded fileset times; proceeding because RepairIgnoreOutdatedDatabase is set");
    }

    if let (Some(local_max), Some(remote_max)) = (local_max, remote_max) {
        if remote_max > local_max && !options.repair_ignore_outdated_database {
            return Err(RepairError::user_information(
                UserInformationKind::RemoteFilesNewerThanLocalDatabase,
                "the remote store's newest fileset volume is newer than the local database's newest known fileset",
            ));
        }
        if remote_max > local_max {
            warn!("remote store is newer than the local database; proceeding because RepairIgnoreOutdatedDatabase is set");
        }
    }
    Ok(())
}

/// §4.2's dry-run-only diagnostics: only meaningful when the database has no
/// matched ("parsed") volumes at all, i.e. every remote entry is either
/// missing from the database or an unparsed extra.
fn check_dry_run_sanity(discrepancies: &Discrepancies, options: &RepairOptions) -> RepairResult<()> {
    let parsed_count = discrepancies.verification_required.len();
    if parsed_count > 0 || !discrepancies.missing_volumes.is_empty() || !discrepancies.missing_remote_filesets.is_empty() {
        return Ok(());
    }

    let own_prefix = format!("{}-", options.volume_prefix);
    let foreign_extras = discrepancies.extra_volumes.iter().any(|e| !e.name.starts_with(&own_prefix));
    let own_prefix_extras = discrepancies.extra_volumes.iter().any(|e| e.name.starts_with(&own_prefix));

    if foreign_extras && !discrepancies.extra_volumes.is_empty() {
        return Err(RepairError::user_information(
            UserInformationKind::RemoteFolderEmptyWithPrefix,
            "the remote folder has no volumes under the configured prefix",
        ));
    }
    if own_prefix_extras {
        return Err(RepairError::user_information(
            UserInformationKind::NoRemoteFilesMissing,
            "the database has no matched volumes but the remote folder already has this prefix's files; recreate instead of repairing",
        ));
    }
    Ok(())
}

/// §5's `ProgressRendezvous`: checked at the start of every phase iteration.
/// A cancellation observed here drains the backend's upload queue before
/// returning — so the queue is left quiescent — but the caller must not
/// clear `TerminatedWithActiveUploads` on this path: the next run needs to
/// see that a burst may have been left dangling.
fn check_cancelled(state: &ReconcileState) -> RepairResult<()> {
    if state.cancellation.is_cancelled() {
        let _ = state.backend.wait_for_empty();
        return Err(RepairError::new(ErrorKind::Cancelled, "repair was cancelled"));
    }
    Ok(())
}

/// Phase 1: re-verify every volume the analyzer flagged as needing it.
/// All updates this phase makes share one logical "transaction", in the
/// sense that they're only meaningful together; there is nothing to roll
/// back if a later row fails, since each row's verification is independent.
fn phase1_verification_required(state: &mut ReconcileState, discrepancies: &Discrepancies) -> RepairResult<()> {
    for row in &discrepancies.verification_required {
        check_cancelled(state)?;
        let downloaded = state.backend.get(&row.name)?;
        let actual_size = downloaded.size;
        let bytes = std::fs::read(&downloaded.path)
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to read downloaded volume for verification").source(err))?;
        let actual_hash = state.hasher.hash(&bytes);

        let mut consistent = row.size.map(|expected| expected == actual_size).unwrap_or(true);
        if consistent {
            if let Some(expected_hash) = row.hash {
                consistent = expected_hash == actual_hash;
            }
        }

        if consistent && row.kind == VolumeKind::Blocks {
            if let Some(manifest) = find_index_manifest_for_data_volume(state, &row.name)? {
                for block in &manifest.blocks {
                    let start = block.offset as usize;
                    let end = start + block.size as usize;
                    match bytes.get(start..end) {
                        Some(slice) if state.hasher.hash(slice) == block.hash => {}
                        _ => {
                            consistent = false;
                            break;
                        }
                    }
                }
            }
        }

        if consistent {
            if !state.options.dry_run {
                state.db.upsert_remote_volume(RemoteVolumeRow {
                    name: row.name.clone(),
                    kind: row.kind,
                    state: RemoteVolumeState::Verified,
                    size: Some(actual_size),
                    hash: Some(actual_hash),
                })?;
            }
            state.report.verified.push(row.name.clone());
        } else {
            warn!("volume {} failed verification: expected size {:?}, hash {:?}, got size {actual_size}", row.name, row.size, row.hash);
        }
        state.bar.inc(1);
    }
    Ok(())
}

/// Find the index manifest (if the database can still reconstruct one)
/// describing the data volume `data_volume_name`, for phase 1's per-block
/// re-verification of a data volume's content.
fn find_index_manifest_for_data_volume(
    state: &ReconcileState,
    data_volume_name: &str,
) -> RepairResult<Option<crate::volume::IndexManifest>> {
    for index_row in state.db.remote_volumes()?.into_iter().filter(|r| r.kind == VolumeKind::Index) {
        if let Some(manifest) = state.db.index_manifest(&index_row.name)? {
            if manifest.data_volume == data_volume_name {
                return Ok(Some(manifest));
            }
        }
    }
    Ok(None)
}

/// Phase 2: adopt remote volumes the database has never heard of. An extra
/// index volume is adopted in place (its block references are trustworthy
/// enough to keep) when `IndexfilePolicy` allows it and it passes
/// verification; everything else — a failed adoption, a non-index extra —
/// is simply deleted as garbage.
fn phase2_extras_adoption(state: &mut ReconcileState, discrepancies: &Discrepancies) -> RepairResult<()> {
    for listing in &discrepancies.extra_volumes {
        check_cancelled(state)?;
        let Ok(parsed) = VolumeName::parse(&listing.name) else {
            warn!("deleting extra remote entry with an unparseable name: {}", listing.name);
            if !state.options.dry_run {
                state.backend.delete(&listing.name, listing.size.unwrap_or(0))?;
            }
            state.report.extras_deleted.push(listing.name.clone());
            state.bar.inc(1);
            continue;
        };

        if parsed.kind == VolumeKind::Index
            && state.options.indexfile_policy != super::options::IndexfilePolicy::None
            && adopt_index_volume(state, listing).unwrap_or(false)
        {
            state.report.adopted.push(listing.name.clone());
            state.bar.inc(1);
            continue;
        }

        if state.options.dry_run {
            info!("would delete extra remote volume {}", listing.name);
        } else {
            state.backend.delete(&listing.name, listing.size.unwrap_or(0))?;
        }
        state.report.extras_deleted.push(listing.name.clone());
        state.bar.inc(1);
    }
    Ok(())
}

/// Attempt the §4.2 phase-2 index-adoption checks: the index's described
/// data volume must already be known to the database, in a plausible state,
/// matching size and hash, and every block it claims must resolve via
/// `has_block`. These checks are unconditional whenever this is called at
/// all (the caller already filters out `IndexfilePolicy::None`). Returns
/// `Ok(true)` only if every check passed and the row was inserted.
fn adopt_index_volume(state: &mut ReconcileState, listing: &crate::backend::RemoteListing) -> RepairResult<bool> {
    let downloaded = state.backend.get(&listing.name)?;
    let bytes = std::fs::read(&downloaded.path)
        .map_err(|err| RepairError::new(ErrorKind::Io, "failed to read downloaded index volume").source(err))?;
    let manifest: crate::volume::IndexManifest = serde_json::from_slice(&bytes)
        .map_err(|err| RepairError::new(ErrorKind::Codec, "failed to parse index manifest").source(err))?;

    let known_data_volumes = state.db.remote_volumes()?;
    let Some(data_row) = known_data_volumes.iter().find(|r| r.name == manifest.data_volume) else {
        return Ok(false);
    };
    if !matches!(
        data_row.state,
        RemoteVolumeState::Uploading | RemoteVolumeState::Uploaded | RemoteVolumeState::Verified
    ) {
        return Ok(false);
    }
    if let Some(expected_size) = manifest.data_volume_size {
        if data_row.size != Some(expected_size) {
            return Ok(false);
        }
    }
    if let (Some(expected_hash), Some(actual_hash)) = (manifest.data_volume_hash, data_row.hash) {
        if expected_hash != actual_hash {
            return Ok(false);
        }
    }
    for block in &manifest.blocks {
        if !state.db.has_block(&block.hash)? {
            return Ok(false);
        }
    }

    if state.options.dry_run {
        return Ok(true);
    }
    state.db.upsert_remote_volume(RemoteVolumeRow {
        name: listing.name.clone(),
        kind: VolumeKind::Index,
        state: RemoteVolumeState::Verified,
        size: listing.size,
        hash: Some(state.hasher.hash(&bytes)),
    })?;
    Ok(true)
}

/// Phase 3: a missing data (`dblock`) volume cannot simply be re-created like
/// an index or fileset volume — its bytes must be recovered from somewhere.
/// Without `RebuildMissingDblockFiles`, any missing data volume fails the
/// whole run rather than silently dropping the blocks it held. With it, the
/// block locator (§4.3) is tried for each one; a volume it fully recovers is
/// queued for phase 6's upload, and a volume it cannot fully recover blocks
/// the run (or, in dry-run, is only logged).
fn phase3_missing_dblock_guard(state: &mut ReconcileState, discrepancies: &Discrepancies) -> RepairResult<()> {
    let missing_dblocks: Vec<_> = discrepancies.missing_volumes.iter().filter(|row| row.kind == VolumeKind::Blocks).collect();

    if missing_dblocks.is_empty() {
        return Ok(());
    }

    if !state.options.rebuild_missing_dblock_files {
        return Err(RepairError::user_information(
            UserInformationKind::MissingDblockFiles,
            "one or more data volumes are missing; rerun with RebuildMissingDblockFiles to attempt recovery",
        ).context("count", missing_dblocks.len().to_string()));
    }

    for row in missing_dblocks {
        check_cancelled(state)?;
        let wanted: Vec<WantedBlock> = state
            .db
            .blocks_in_volume(&row.name)?
            .into_iter()
            .map(|(hash, length)| WantedBlock { hash, length })
            .collect();

        let mut siblings = std::collections::HashSet::new();
        for block in &wanted {
            for sibling in state.db.sibling_volumes_for_block(&block.hash)? {
                siblings.insert(sibling);
            }
        }
        let siblings: Vec<String> = siblings.into_iter().collect();

        let found = locator::locate(state.backend, state.db, state.hasher, &wanted, &siblings)?;
        if found.len() == wanted.len() {
            let by_hash: HashMap<Id, Vec<u8>> = found.into_iter().map(|r| (r.hash, r.data)).collect();
            state.recovered_data_volumes.push((row.clone(), by_hash));
            state.bar.inc(1);
            continue;
        }

        let recovered_hashes: std::collections::HashSet<Id> = found.iter().map(|r| r.hash).collect();
        let mut affected_filesets = std::collections::HashSet::new();
        for block in &wanted {
            if !recovered_hashes.contains(&block.hash) {
                for fileset in state.db.filesets_using_block(&block.hash)? {
                    affected_filesets.insert(fileset);
                }
            }
        }
        let missing_count = wanted.len() - found.len();

        if state.options.dry_run {
            warn!(
                "data volume {} would remain incomplete: {missing_count} block(s) unrecoverable, affecting filesets {:?}",
                row.name, affected_filesets
            );
            state.report.blocked_on_missing_dblocks = true;
        } else {
            return Err(RepairError::user_information(
                UserInformationKind::RepairIsNotPossible,
                "a data volume's blocks could not be fully recovered",
            )
            .context("volume", row.name.clone())
            .context("missing_blocks", missing_count.to_string())
            .context("affected_filesets", affected_filesets.into_iter().collect::<Vec<_>>().join(",")));
        }
        state.bar.inc(1);
    }
    Ok(())
}

/// Phase 4: for each DB-known fileset that lost its remote volume, rebuild a
/// fresh one from whatever the database can still reconstruct and reupload
/// it; a schema that cannot reconstruct a manifest leaves the row dropped,
/// since there is nothing left to upload.
fn phase4_missing_remote_filesets(state: &mut ReconcileState, discrepancies: &Discrepancies) -> RepairResult<()> {
    for row in &discrepancies.missing_remote_filesets {
        check_cancelled(state)?;
        let manifest = state.db.fileset_manifest(&row.name)?;
        match manifest {
            Some(manifest) if !state.options.dry_run => {
                let name = VolumeName::new(&state.options.volume_prefix, VolumeKind::Files, state.compression.id()).format();
                let written = crate::volume::write_fileset_volume(name, &manifest, state.compression)?;
                state.backend.put(&written.name, written.path())?;
                let hash = written.hash(state.hasher)?;
                state.db.upsert_remote_volume(RemoteVolumeRow {
                    name: written.name.clone(),
                    kind: VolumeKind::Files,
                    state: RemoteVolumeState::Uploaded,
                    size: Some(written.size),
                    hash: Some(hash),
                })?;
                state.db.relink_and_remove(&row.name, &written.name)?;
                state.report.remote_filesets_recorded.push(written.name);
            }
            Some(_) => {
                info!("would rebuild and reupload fileset volume for lost row {}", row.name);
                state.report.remote_filesets_recorded.push(row.name.clone());
            }
            None => {
                warn!(
                    "fileset row {} lost its remote volume and the database cannot reconstruct its contents; dropping the row",
                    row.name
                );
                if !state.options.dry_run {
                    state.db.remove_remote_volume(&row.name)?;
                }
            }
        }
        state.bar.inc(1);
    }
    Ok(())
}

/// Phase 5: download and record fileset volumes the backend has but the
/// database has no row for.
fn phase5_missing_local_filesets(state: &mut ReconcileState, discrepancies: &Discrepancies) -> RepairResult<()> {
    for listing in &discrepancies.missing_local_filesets {
        check_cancelled(state)?;
        if state.options.dry_run {
            state.report.local_filesets_removed.push(listing.name.clone());
            state.bar.inc(1);
            continue;
        }
        let downloaded = state.backend.get(&listing.name)?;
        let bytes = std::fs::read(&downloaded.path)
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to read downloaded fileset volume").source(err))?;

        // Decode and reparse the manifest before trusting the row: a volume
        // this engine never wrote (or wrote under a module it no longer has)
        // must not be linked in as if it were known-good.
        let decompressed = state.compression.decompress(&bytes).map_err(|err| {
            RepairError::user_information(
                UserInformationKind::FailedToLoadCompressionModule,
                "failed to decompress a remote-only fileset volume while ingesting it",
            )
            .context("volume", listing.name.clone())
            .source(err)
        })?;
        let manifest: crate::volume::FilesetManifest = serde_json::from_slice(&decompressed).map_err(|err| {
            RepairError::new(ErrorKind::Codec, "failed to parse a remote-only fileset manifest while ingesting it").source(err)
        })?;

        state.db.upsert_remote_volume(RemoteVolumeRow {
            name: listing.name.clone(),
            kind: VolumeKind::Files,
            state: RemoteVolumeState::Verified,
            size: Some(downloaded.size),
            hash: Some(state.hasher.hash(&bytes)),
        })?;
        info!("ingested remote-only fileset volume {} with {} entries", listing.name, manifest.entries.len());
        state.report.local_filesets_removed.push(listing.name.clone());
        state.bar.inc(1);
    }
    Ok(())
}

/// Phase 6: recreate missing non-fileset volumes — index and fileset volumes
/// by rebuilding them under their *original* name from whatever the database
/// can still reconstruct, dropping the row only when the schema can't answer
/// that; and data volumes phase 3 fully recovered, which are uploaded here
/// from their recovered bytes and move straight to `Verified` since their
/// content is already known-good (it was just re-derived from it).
fn phase6_missing_volumes_by_kind(state: &mut ReconcileState, discrepancies: &Discrepancies) -> RepairResult<()> {
    for row in discrepancies.missing_volumes.iter().filter(|r| r.kind == VolumeKind::Index) {
        check_cancelled(state)?;
        let manifest = state.db.index_manifest(&row.name)?;
        match manifest {
            Some(manifest) if !state.options.dry_run => {
                if state.options.indexfile_policy == super::options::IndexfilePolicy::Full {
                    let mut self_verified = true;
                    for block in &manifest.blocks {
                        if !state.db.has_block(&block.hash)? {
                            self_verified = false;
                            break;
                        }
                    }
                    if !self_verified {
                        warn!(
                            "index row {} could not be self-verified under IndexfilePolicy::Full; dropping the row",
                            row.name
                        );
                        state.db.remove_remote_volume(&row.name)?;
                        state.report.volumes_recreated.push(row.name.clone());
                        state.bar.inc(1);
                        continue;
                    }
                }
                let written = crate::volume::write_index_volume(row.name.clone(), &manifest, state.compression)?;
                state.backend.put(&written.name, written.path())?;
                let hash = written.hash(state.hasher)?;
                state.db.upsert_remote_volume(RemoteVolumeRow {
                    name: written.name.clone(),
                    kind: VolumeKind::Index,
                    state: RemoteVolumeState::Verified,
                    size: Some(written.size),
                    hash: Some(hash),
                })?;
                state.report.volumes_recreated.push(written.name);
            }
            Some(_) => {
                info!("would rebuild and reupload index volume for lost row {}", row.name);
                state.report.volumes_recreated.push(row.name.clone());
            }
            None => {
                warn!(
                    "index row {} lost its remote volume and the database cannot reconstruct its block list; dropping the row",
                    row.name
                );
                if !state.options.dry_run {
                    state.db.remove_remote_volume(&row.name)?;
                }
                state.report.volumes_recreated.push(row.name.clone());
            }
        }
        state.bar.inc(1);
    }

    for row in discrepancies.missing_volumes.iter().filter(|r| r.kind == VolumeKind::Files) {
        check_cancelled(state)?;
        let manifest = state.db.fileset_manifest(&row.name)?;
        match manifest {
            Some(manifest) if !state.options.dry_run => {
                let written = crate::volume::write_fileset_volume(row.name.clone(), &manifest, state.compression)?;
                state.backend.put(&written.name, written.path())?;
                let hash = written.hash(state.hasher)?;
                state.db.upsert_remote_volume(RemoteVolumeRow {
                    name: written.name.clone(),
                    kind: VolumeKind::Files,
                    state: RemoteVolumeState::Verified,
                    size: Some(written.size),
                    hash: Some(hash),
                })?;
                state.report.volumes_recreated.push(written.name);
            }
            Some(_) => {
                info!("would rebuild and reupload fileset volume for lost row {}", row.name);
                state.report.volumes_recreated.push(row.name.clone());
            }
            None => {
                warn!(
                    "fileset row {} lost its remote volume and the database cannot reconstruct its contents; dropping the row",
                    row.name
                );
                if !state.options.dry_run {
                    state.db.remove_remote_volume(&row.name)?;
                }
                state.report.volumes_recreated.push(row.name.clone());
            }
        }
        state.bar.inc(1);
    }

    let recovered = std::mem::take(&mut state.recovered_data_volumes);
    for (row, blocks) in recovered {
        check_cancelled(state)?;
        if state.options.dry_run {
            info!("would reupload recovered data volume {}", row.name);
            state.report.volumes_recreated.push(row.name.clone());
            state.bar.inc(1);
            continue;
        }

        let mut ordered_hashes: Vec<Id> = blocks.keys().copied().collect();
        ordered_hashes.sort();
        let mut index = crate::volume::IndexManifest { data_volume: row.name.clone(), blocks: Vec::new(), ..Default::default() };
        let mut offset = 0u64;
        for hash in &ordered_hashes {
            let size = blocks[hash].len() as u64;
            index.add(crate::volume::BlockEntry { hash: *hash, offset, size });
            offset += size;
        }

        let data_written = crate::volume::write_data_volume(row.name.clone(), &index, &blocks)?;
        state.backend.put(&data_written.name, data_written.path())?;
        let hash = data_written.hash(state.hasher)?;
        state.db.upsert_remote_volume(RemoteVolumeRow {
            name: data_written.name.clone(),
            kind: VolumeKind::Blocks,
            state: RemoteVolumeState::Verified,
            size: Some(data_written.size),
            hash: Some(hash),
        })?;

        state.report.volumes_recreated.push(row.name.clone());
        state.bar.inc(1);
    }
    Ok(())
}

/// Phase 7: the sole upload-queue drain barrier (§5 `WaitForEmpty`).
fn phase7_drain(state: &mut ReconcileState) -> RepairResult<()> {
    if !state.options.dry_run {
        state.backend.wait_for_empty()?;
    }
    state.report.drained = true;
    Ok(())
}

/// Phase 8: delete index volumes whose manifest describes zero blocks —
/// leftover from a data volume that was itself already deleted. A volume
/// larger than 2048 bytes is left alone: that much content suggests it is
/// not actually empty, and this phase never risks deleting real data.
fn phase8_empty_index_files(state: &mut ReconcileState, discrepancies: &Discrepancies) -> RepairResult<()> {
    const EMPTY_THRESHOLD: u64 = 2048;
    for row in &discrepancies.empty_index_files {
        check_cancelled(state)?;
        if row.size.unwrap_or(0) > EMPTY_THRESHOLD {
            warn!("index volume {} is flagged empty but larger than expected; leaving it alone", row.name);
            state.bar.inc(1);
            continue;
        }
        if !state.options.dry_run {
            state.backend.delete(&row.name, row.size.unwrap_or(0))?;
            state.db.remove_remote_volume(&row.name)?;
        }
        state.report.empty_index_files_removed.push(row.name.clone());
        state.bar.inc(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DownloadedFile, RemoteListing};
    use crate::cancellation::NeverCancelled;
    use crate::db::{GuardedFlags, LocalFileHint};
    use crate::progress::NoProgressBars;
    use std::collections::HashMap as StdHashMap;
    use std::path::Path;
    use std::sync::Mutex;

    struct FakeBackend {
        listing: Vec<RemoteListing>,
        objects: StdHashMap<String, Vec<u8>>,
        waited: Mutex<bool>,
        put_objects: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new(listing: Vec<RemoteListing>) -> Self {
            Self { listing, objects: StdHashMap::new(), waited: Mutex::new(false), put_objects: Mutex::new(Vec::new()) }
        }
    }

    impl Backend for FakeBackend {
        fn list(&self, _prefix: &str) -> RepairResult<Vec<RemoteListing>> {
            Ok(self.listing.clone())
        }
        fn get(&self, name: &str) -> RepairResult<DownloadedFile> {
            let bytes = self.objects.get(name).cloned().unwrap_or_default();
            let mut file = tempfile::NamedTempFile::new()
                .map_err(|err| RepairError::new(ErrorKind::Io, "failed to create temp file").source(err))?;
            std::io::Write::write_all(&mut file, &bytes)
                .map_err(|err| RepairError::new(ErrorKind::Io, "failed to write temp file").source(err))?;
            let (_file, path) = file
                .keep()
                .map_err(|err| RepairError::new(ErrorKind::Io, "failed to persist temp file").source(err.error))?;
            Ok(DownloadedFile { path, size: bytes.len() as u64 })
        }
        fn put(&self, name: &str, _local_path: &Path) -> RepairResult<()> {
            self.put_objects.lock().unwrap().push(name.to_string());
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
        fn wait_for_empty(&self) -> RepairResult<()> {
            *self.waited.lock().unwrap() = true;
            Ok(())
        }
    }

    struct FakeDb {
        rows: Mutex<Vec<RemoteVolumeRow>>,
        known_blocks: Vec<Id>,
    }

    impl FakeDb {
        fn new(rows: Vec<RemoteVolumeRow>) -> Self {
            Self { rows: Mutex::new(rows), known_blocks: Vec::new() }
        }
    }

    impl Database for FakeDb {
        fn is_missing(&self) -> bool {
            false
        }
        fn has_no_known_volumes(&self) -> RepairResult<bool> {
            Ok(self.rows.lock().unwrap().is_empty())
        }
        fn guarded_flags(&self) -> RepairResult<GuardedFlags> {
            Ok(GuardedFlags::default())
        }
        fn remote_volumes(&self) -> RepairResult<Vec<RemoteVolumeRow>> {
            Ok(self.rows.lock().unwrap().clone())
        }
        fn upsert_remote_volume(&self, row: RemoteVolumeRow) -> RepairResult<()> {
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|r| r.name != row.name);
            rows.push(row);
            Ok(())
        }
        fn remove_remote_volume(&self, name: &str) -> RepairResult<()> {
            self.rows.lock().unwrap().retain(|r| r.name != name);
            Ok(())
        }
        fn local_file_hints(&self, _hash: &Id) -> RepairResult<Vec<LocalFileHint>> {
            Ok(Vec::new())
        }
        fn has_block(&self, hash: &Id) -> RepairResult<bool> {
            Ok(self.known_blocks.contains(hash))
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

    fn volume_name(kind: VolumeKind, epoch_secs: i64) -> String {
        VolumeName {
            prefix: "backup".to_string(),
            kind,
            timestamp: chrono::DateTime::from_timestamp(epoch_secs, 0).unwrap(),
            random: "aaaaaaaa".to_string(),
            compression: "zstd".to_string(),
            encryption: None,
        }
        .format()
    }

    #[test]
    fn scenario_non_index_extra_is_deleted_not_adopted() {
        let name = volume_name(VolumeKind::Blocks, 1_700_000_000);
        let backend = FakeBackend::new(vec![RemoteListing { name: name.clone(), size: Some(42) }]);
        let db = FakeDb::new(Vec::new());
        let options = RepairOptions::default();
        let report = reconcile(&backend, &db, &options, &NoProgressBars, &NeverCancelled).unwrap();
        assert!(report.adopted.is_empty());
        assert_eq!(report.extras_deleted, vec![name]);
        assert!(report.drained);
        assert!(*backend.waited.lock().unwrap());
    }

    #[test]
    fn scenario_extra_index_volume_is_adopted_after_verification() {
        let data_name = volume_name(VolumeKind::Blocks, 1_700_000_100);
        let index_name = volume_name(VolumeKind::Index, 1_700_000_101);
        let data_row = RemoteVolumeRow {
            name: data_name.clone(),
            kind: VolumeKind::Blocks,
            state: RemoteVolumeState::Verified,
            size: Some(5),
            hash: None,
        };
        let manifest = crate::volume::IndexManifest { data_volume: data_row.name.clone(), ..Default::default() };
        let mut backend = FakeBackend::new(vec![RemoteListing { name: index_name.clone(), size: Some(30) }]);
        backend.objects.insert(index_name.clone(), serde_json::to_vec(&manifest).unwrap());
        let db = FakeDb::new(vec![data_row]);
        let options = RepairOptions::default();
        let report = reconcile(&backend, &db, &options, &NoProgressBars, &NeverCancelled).unwrap();
        assert_eq!(report.adopted, vec![index_name]);
        assert!(report.extras_deleted.is_empty());
    }

    #[test]
    fn scenario_missing_dblock_fails_without_rebuild_option() {
        let name = volume_name(VolumeKind::Blocks, 1_700_000_200);
        let backend = FakeBackend::new(Vec::new());
        let db = FakeDb::new(vec![RemoteVolumeRow {
            name,
            kind: VolumeKind::Blocks,
            state: RemoteVolumeState::Uploaded,
            size: Some(5),
            hash: None,
        }]);
        let options = RepairOptions::default();
        let err = reconcile(&backend, &db, &options, &NoProgressBars, &NeverCancelled).unwrap_err();
        assert_eq!(err.user_information_kind(), Some(UserInformationKind::MissingDblockFiles));
        assert!(!*backend.waited.lock().unwrap());
    }

    #[test]
    fn scenario_dry_run_does_not_mutate_database() {
        let name = volume_name(VolumeKind::Blocks, 1_700_000_300);
        let backend = FakeBackend::new(vec![RemoteListing { name, size: Some(42) }]);
        let db = FakeDb::new(Vec::new());
        let options = RepairOptions::default().dry_run(true);
        let report = reconcile(&backend, &db, &options, &NoProgressBars, &NeverCancelled).unwrap();
        assert_eq!(report.extras_deleted.len(), 1);
        assert!(db.rows.lock().unwrap().is_empty());
    }
}
