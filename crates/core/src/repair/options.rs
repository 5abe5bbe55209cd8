//! [`RepairOptions`]: the configuration surface for a repair run, built the
//! way `CheckOptions`/`RepairIndexOptions` are in the teacher — a
//! `derive_setters::Setters` struct, optionally also a `clap::Parser` behind
//! the `cli` feature.
use derive_setters::Setters;

use crate::fileset::FilesetRepairOptions;

/// How aggressively an extra index volume is adopted into the database
/// during §4.2 phase 2, versus simply deleted as garbage.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IndexfilePolicy {
    /// Never adopt an extra index volume; always delete it.
    None,
    /// Adopt an extra index volume after verifying it against the database.
    #[default]
    Lookup,
    /// Like `Lookup`, and additionally self-verify every embedded block-list
    /// when an index volume is rebuilt from the database (§4.2 phase 6).
    Full,
}

/// Options controlling a single repair run (spec.md §6, "Configuration").
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Clone, Debug, Setters)]
#[setters(into, strip_option)]
pub struct RepairOptions {
    /// If set, only plan the repair and report what would be done.
    #[cfg_attr(feature = "clap", clap(long))]
    pub dry_run: bool,

    /// Forbidden: repair never changes the repository's passphrase.
    /// Present so a caller's accidental request surfaces as a clear
    /// [`crate::error::UserInformationKind::PassphraseChangeUnsupported`]
    /// error rather than being silently ignored.
    #[cfg_attr(feature = "clap", clap(skip))]
    pub allow_passphrase_change: bool,

    /// Re-verify every volume's content hash, not only volumes the database
    /// has never marked `Verified`.
    #[cfg_attr(feature = "clap", clap(long))]
    pub verify_and_clean_forced: bool,

    /// Block size blocklist hashes were computed at, for §4.6's fixups.
    #[cfg_attr(feature = "clap", clap(long, default_value_t = 10 << 20))]
    pub blocksize: u64,

    /// Digest size of a single blocklist hash entry.
    #[cfg_attr(feature = "clap", clap(long, default_value_t = 32))]
    pub block_hash_size: u64,

    /// Hash algorithm id used to recompute missing blocklist hashes.
    #[cfg_attr(feature = "clap", clap(long, default_value = "sha256"))]
    pub hash_algorithm: String,

    /// Compression module id new volumes are written with.
    #[cfg_attr(feature = "clap", clap(long, default_value = "zstd"))]
    pub compression: String,

    /// The shared filename prefix for volumes in this backup set.
    #[cfg_attr(feature = "clap", clap(long))]
    pub volume_prefix: String,

    /// How §4.2 phase 2 treats an extra, correctly-formed index volume.
    #[cfg_attr(feature = "clap", clap(long, value_enum, default_value_t = IndexfilePolicy::Lookup))]
    pub indexfile_policy: IndexfilePolicy,

    /// Opt-in to rebuilding missing data (`Blocks`) volumes from local files
    /// and sibling remote volumes (§4.2 phase 3's guard, §4.3). Without this,
    /// any missing `Blocks` volume fails the run with `MissingDblockFiles`
    /// rather than attempting a possibly-incomplete rebuild.
    #[cfg_attr(feature = "clap", clap(long))]
    pub rebuild_missing_dblock_files: bool,

    /// Proceed even when the remote store's newest fileset volume is newer
    /// than the local database's newest known fileset (§4.2 freshness
    /// check), treating the surplus as a `MissingLocalFileset` instead of
    /// aborting with `RemoteFilesNewerThanLocalDatabase`.
    #[cfg_attr(feature = "clap", clap(long))]
    pub repair_ignore_outdated_database: bool,

    /// Path-separator-joined list of extra files folded into any fileset
    /// volume this repair reuploads.
    #[cfg_attr(feature = "clap", clap(long))]
    pub control_files: Vec<String>,

    /// Options forwarded to the fileset repair step (§4.7).
    #[cfg_attr(feature = "clap", clap(skip))]
    pub fileset: FilesetRepairOptions,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            allow_passphrase_change: false,
            verify_and_clean_forced: false,
            blocksize: 10 << 20,
            block_hash_size: 32,
            hash_algorithm: "sha256".to_string(),
            compression: "zstd".to_string(),
            volume_prefix: "backup".to_string(),
            indexfile_policy: IndexfilePolicy::default(),
            rebuild_missing_dblock_files: false,
            repair_ignore_outdated_database: false,
            control_files: Vec::new(),
            fileset: FilesetRepairOptions::default(),
        }
    }
}
