/*!
A concrete [`repair_core::backend::Backend`] implementation: a local-filesystem
object store, the way `rustic_backend::local` supplies one concrete backend
behind `rustic_core`'s `ReadBackend`/`WriteBackend` traits.

Other transports (object store, SFTP, rclone, REST) are named in the repair
engine's specification as pluggable and are intentionally not implemented
here — a real deployment supplies them out of tree, each as its own
`repair_core::backend::Backend` implementation, the same way `rustic_backend`
supplies several behind feature flags.

# Crate features

This crate has no optional features; it is a single, always-on
implementation, unlike the teacher crate's `opendal`/`rclone`/`rest`/`sftp`/
`s3` feature flags.
*/

pub mod error;
pub mod local;

pub use crate::{error::LocalBackendErrorKind, local::LocalBackend};
