//! Top-level repair decision tree (§4.1): the single entrypoint that decides
//! which of the three branches a repair run takes, then always runs the
//! database consistency pass (§4.6) and broken-fileset repair (§4.7) before
//! remote reconciliation (§4.2).
//!
//! Shaped after `rustic_core::commands::repair::repair_index`'s role as the
//! one function a CLI frontend calls, with everything else a private helper.
use log::{info, warn};

use crate::backend::{Backend, VolumeKind};
use crate::cancellation::Cancellation;
use crate::consistency::{self, BlocklistHashParams, ConsistencyReport};
use crate::db::{Database, RemoteVolumeState};
use crate::error::{ErrorKind, RepairError, RepairResult, UserInformationKind};
use crate::fileset::{self, FilesetRepairResult};
use crate::hash::{HashModule, Sha256Module};
use crate::module::{CompressionModule, ZstdModule};
use crate::progress::ProgressBars;
use crate::volume::FilesetManifest;

use super::options::RepairOptions;
use super::reconcile::{self, ReconcileReport};

/// Which of §4.1's three branches a run took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// No local database file exists at all; it was recreated from the remote store.
    RecreatedFromScratch,
    /// The database existed but recorded zero known volumes; it was renamed
    /// aside before being recreated.
    RenamedAsideAndRecreated,
    /// The database existed and had known volumes; it was repaired in place.
    RepairedInPlace,
}

/// The combined outcome of a full repair run.
#[derive(Debug, Clone)]
pub struct RepairReport {
    /// Which branch of the decision tree was taken.
    pub branch: Branch,
    /// The name the previous database was renamed to, if branch 2 ran.
    pub renamed_database_to: Option<String>,
    /// The database consistency pass's tally, if branch 3 ran it.
    pub consistency: Option<ConsistencyReport>,
    /// Per-fileset repair outcomes, if branch 3 ran fileset repair.
    pub filesets_repaired: Vec<FilesetRepairResult>,
    /// The remote reconciliation outcome, if branch 3 ran it.
    pub reconciliation: Option<ReconcileReport>,
}

/// Orchestrates a single repair run end to end.
///
/// Constructed with [`Coordinator::new`], which is the only place
/// [`UserInformationKind::PassphraseChangeUnsupported`] can be raised — it
/// fails before any backend or database call is made.
pub struct Coordinator<'a> {
    backend: &'a dyn Backend,
    db: &'a dyn Database,
    options: RepairOptions,
    progress: &'a dyn ProgressBars,
    cancellation: &'a dyn Cancellation,
    hasher: Box<dyn HashModule>,
    compression: Box<dyn CompressionModule>,
}

impl<'a> Coordinator<'a> {
    /// Build a coordinator for a single repair run.
    ///
    /// # Errors
    /// Returns [`UserInformationKind::PassphraseChangeUnsupported`] if
    /// `options.allow_passphrase_change` is set — repair never changes a
    /// repository's passphrase, and silently ignoring the request would be
    /// worse than refusing outright.
    pub fn new(
        backend: &'a dyn Backend,
        db: &'a dyn Database,
        options: RepairOptions,
        progress: &'a dyn ProgressBars,
        cancellation: &'a dyn Cancellation,
    ) -> RepairResult<Self> {
        if options.allow_passphrase_change {
            return Err(RepairError::user_information(
                UserInformationKind::PassphraseChangeUnsupported,
                "repair cannot also change the repository passphrase",
            ));
        }
        Ok(Self {
            backend,
            db,
            options,
            progress,
            cancellation,
            hasher: Box::new(Sha256Module),
            compression: Box::new(ZstdModule),
        })
    }

    /// Run the repair to completion, taking whichever of §4.1's three
    /// branches applies, then always recording `EndTime`.
    pub fn run(&self) -> RepairResult<RepairReport> {
        let report = if self.db.is_missing() {
            self.recreate_from_scratch()?
        } else if self.db.has_no_known_volumes()? {
            self.rename_aside_and_recreate()?
        } else {
            self.repair_in_place()?
        };

        if !self.options.dry_run {
            self.db.record_end_time()?;
        }
        Ok(report)
    }

    fn recreate_from_scratch(&self) -> RepairResult<RepairReport> {
        info!("no local database found; recreating it from the remote store");
        if !self.options.dry_run {
            self.db.recreate_from_remote()?;
        }
        Ok(RepairReport {
            branch: Branch::RecreatedFromScratch,
            renamed_database_to: None,
            consistency: None,
            filesets_repaired: Vec::new(),
            reconciliation: None,
        })
    }

    fn rename_aside_and_recreate(&self) -> RepairResult<RepairReport> {
        warn!("local database records no known remote volumes; renaming it aside before recreating");
        let renamed_to = if self.options.dry_run {
            None
        } else {
            Some(self.db.rename_aside()?)
        };
        if !self.options.dry_run {
            self.db.recreate_from_remote()?;
        }
        Ok(RepairReport {
            branch: Branch::RenamedAsideAndRecreated,
            renamed_database_to: renamed_to,
            consistency: None,
            filesets_repaired: Vec::new(),
            reconciliation: None,
        })
    }

    fn repair_in_place(&self) -> RepairResult<RepairReport> {
        let flags = self.db.guarded_flags()?;
        if flags.partially_recreated {
            return Err(RepairError::user_information(
                UserInformationKind::DatabaseIsPartiallyRecreated,
                "the local database was only partially recreated by a previous run and requires operator acknowledgement",
            ));
        }
        if flags.repair_in_progress {
            return Err(RepairError::user_information(
                UserInformationKind::DatabaseIsInRepairState,
                "a repair is already recorded as in progress from a previous run and requires operator acknowledgement",
            ));
        }
        if flags.terminated_with_active_uploads {
            warn!("previous run terminated with active uploads still outstanding; proceeding, the drain phase will settle it");
        }
        if !self.db.verify_consistency_for_repair()? {
            return Err(RepairError::user_information(
                UserInformationKind::DatabaseFailedConsistencyCheck,
                "the local database failed its own consistency check and requires operator acknowledgement",
            ));
        }

        let params = BlocklistHashParams {
            blocksize: self.options.blocksize,
            block_hash_size: self.options.block_hash_size,
            algorithm: self.options.hash_algorithm.clone(),
        };
        let consistency_report = consistency::run(self.db, &params)?;

        let filesets_repaired = self.repair_broken_filesets()?;

        let reconciliation = reconcile::reconcile(
            self.backend,
            self.db,
            &self.options,
            self.progress,
            self.cancellation,
        )?;

        Ok(RepairReport {
            branch: Branch::RepairedInPlace,
            renamed_database_to: None,
            consistency: Some(consistency_report),
            filesets_repaired,
            reconciliation: Some(reconciliation),
        })
    }

    /// §4.7: reopen every fileset volume the database currently knows about
    /// and drop references to blocks the backend no longer has.
    fn repair_broken_filesets(&self) -> RepairResult<Vec<FilesetRepairResult>> {
        let rows = self.db.remote_volumes()?;
        let fileset_rows: Vec<_> = rows
            .into_iter()
            .filter(|row| row.kind == VolumeKind::Files && row.state != RemoteVolumeState::Deleted)
            .collect();

        let mut results = Vec::new();
        for row in fileset_rows {
            if self.cancellation.is_cancelled() {
                return Err(RepairError::new(ErrorKind::Cancelled, "repair was cancelled"));
            }
            let downloaded = self.backend.get(&row.name)?;
            let bytes = std::fs::read(&downloaded.path)
                .map_err(|err| RepairError::new(ErrorKind::Io, "failed to read downloaded fileset volume").source(err))?;
            let manifest: FilesetManifest = serde_json::from_slice(&bytes)
                .map_err(|err| RepairError::new(ErrorKind::Codec, "failed to parse fileset manifest").source(err))?;

            let result = fileset::repair(&manifest, &self.options.fileset, &|hash| {
                self.db.has_block(hash).unwrap_or(false)
            });

            if result.changed && !self.options.dry_run {
                fileset::mark_repaired(
                    self.backend,
                    self.db,
                    self.hasher.as_ref(),
                    self.compression.as_ref(),
                    &row.name,
                    &result.manifest,
                    &self.options.fileset,
                )?;
            }
            results.push(result);
        }
        Ok(results)
    }
}
