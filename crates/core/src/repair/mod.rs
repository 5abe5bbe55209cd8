//! The repair operation itself: options (§6 configuration surface), the
//! top-level decision tree (§4.1), and remote reconciliation (§4.2).

pub mod coordinator;
pub mod options;
pub mod reconcile;
