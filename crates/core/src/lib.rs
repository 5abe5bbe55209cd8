/*!
The repair engine for a deduplicated, content-addressed backup repository.

# Overview

A repository stores its data in three kinds of remote [`volume`]s — data volumes (raw
deduplicated block payloads), index volumes (manifests describing which blocks live in which
data volumes), and fileset volumes (snapshot manifests) — plus a local database that mirrors the
repository's logical state. The two can drift apart: the database may be lost or stale; remote
volumes may be missing, extra, corrupted, or empty.

The [`repair`] module's [`repair::coordinator::Coordinator`] is the engine's single entrypoint:
it diagnoses that divergence (via [`analyzer`]) and drives the minimum set of remote uploads,
deletes, and local consistency fixes ([`consistency`]) required to restore a provably-consistent
state, recovering missing block bytes via [`locator`] and rebuilding fileset rows via [`fileset`]
— without ever fabricating data it cannot recover.

This crate depends only on the trait surfaces in [`backend`], [`db`], [`hash`], and [`module`];
it never constructs a concrete transport, schema, or codec itself. `repair_backend` supplies one
production [`backend::Backend`] (a local-filesystem store); `repair_testing` supplies in-memory
implementations of [`backend::Backend`] and [`db::Database`] for tests.

# Crate features

- **cli** - Enables `clap`-derived parsing of [`repair::options::RepairOptions`] from the
  command line, plus `merge` support for combining multiple option sources.
- **clap** - Enables a dependency on the `clap` crate.
- **merge** - Enables a dependency on the `conflate` crate for merging option values.
*/

pub mod analyzer;
pub mod backend;
pub mod cancellation;
pub mod consistency;
pub mod db;
pub mod error;
pub mod fileset;
pub mod hash;
pub mod id;
pub mod locator;
pub mod module;
pub mod progress;
pub mod repair;
pub mod volume;

pub use crate::{
    analyzer::{analyze, Discrepancies, VerifyMode},
    backend::{Backend, BackendErrorKind, VolumeKind},
    cancellation::{Cancellation, CancellationFlag, NeverCancelled},
    db::{Database, GuardedFlags, RemoteVolumeRow, RemoteVolumeState},
    error::{ErrorKind, RepairError, RepairResult, UserInformationKind},
    hash::{HashModule, Sha256Module},
    id::Id,
    module::{CompressionModule, ModuleRegistry, ZstdModule},
    progress::{NoProgress, NoProgressBars, Progress, ProgressBars},
    repair::{coordinator::Coordinator, options::RepairOptions},
    volume::VolumeName,
};
