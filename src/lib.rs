//! peruse - resumable multi-stage paper analysis over OpenAI-compatible endpoints.
//!
//! ## Architecture
//!
//! A fixed pipeline runs over one document (the subject):
//! - **Structure**: the analyzer model summarises the paper's layout
//! - **Selection**: the reviewer model picks the questions worth asking
//! - **Answer / Verify**: per question, the analyzer answers and the reviewer checks
//! - **Integrate**: the question history becomes a final report
//!
//! ## Checkpointing
//!
//! - Every completed stage is snapshotted under a stable subject id
//! - A failing stage leaves a snapshot of everything before it
//! - Resuming checks the snapshot against the current input and configuration
//! - Retention policies keep the snapshot store bounded

pub mod checkpoint;
pub mod client;
pub mod models;
pub mod pipeline;
pub mod source;

// Re-exports for convenience
pub use checkpoint::{SnapshotStore, SubjectLock};
pub use client::LlmClient;
pub use models::{Config, PeruseError, PipelineState, Result};
pub use pipeline::{LlmExecutor, Planner, ResumeRequest, ResumeSource, StageExecutor};
