//! Checkpoint-and-resume subsystem.
//!
//! Provides:
//! - `identity`: stable subject ids from file name, content or fallback
//! - `label`: human-readable stage labels and their filename slugs
//! - `store`: write-once snapshots with a Markdown mirror
//! - `consistency`: staleness checks for a resume target
//! - `retention`: policy-driven pruning of the store
//! - `lock`: exclusive per-subject lock for the duration of a run

pub mod consistency;
pub mod identity;
pub mod label;
pub mod lock;
pub mod retention;
mod store;

pub use consistency::{ConsistencyReport, verify};
pub use label::stage_label;
pub use lock::SubjectLock;
pub use retention::{CleanupPlan, CleanupReport, cleanup};
pub use store::*;
