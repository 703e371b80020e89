//! Resume planner and stage loop.
//!
//! Pipeline flow:
//! structure → select_questions → (answer i → verify i) for each item → integrate → done
//!
//! Every completed stage is followed by a snapshot, and a failing stage is
//! followed by a best-effort snapshot of what was accumulated before it, so
//! an interrupted run resumes exactly where it stopped.

use super::executor::StageExecutor;
use crate::checkpoint::{ConsistencyReport, SnapshotRef, SnapshotStore, verify};
use crate::models::{Config, Cursor, PeruseError, PipelineState, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Where a run should start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeSource {
    /// Ignore existing snapshots
    Fresh,
    /// Newest snapshot of the subject, if any
    Latest,
    /// One explicit snapshot file
    File(PathBuf),
}

/// Inputs to [`Planner::prepare`].
#[derive(Debug, Clone)]
pub struct ResumeRequest<'a> {
    pub subject_id: &'a str,
    pub subject_path: &'a Path,
    pub source: ResumeSource,
    pub config: &'a Config,
}

/// Starting state chosen by [`Planner::prepare`].
#[derive(Debug, Clone)]
pub struct Prepared {
    pub state: PipelineState,
    /// Snapshot the state was restored from
    pub resumed_from: Option<PathBuf>,
    /// Consistency report of the considered snapshot
    pub report: Option<ConsistencyReport>,
}

/// Outcome of [`Planner::run`].
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stages_run: usize,
    pub last_snapshot: Option<SnapshotRef>,
}

/// Drives a [`StageExecutor`] over a pipeline state, snapshotting as it goes.
pub struct Planner<E> {
    executor: E,
    store: SnapshotStore,
    checkpoints: bool,
    progress: bool,
}

impl<E: StageExecutor> Planner<E> {
    pub fn new(executor: E, store: SnapshotStore) -> Self {
        Self {
            executor,
            store,
            checkpoints: true,
            progress: false,
        }
    }

    /// Enable or disable per-stage snapshots.
    pub fn with_checkpoints(mut self, enabled: bool) -> Self {
        self.checkpoints = enabled;
        self
    }

    /// Show a progress bar while running.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Next stage to run, `None` once the pipeline is done.
    pub fn next_stage(state: &PipelineState) -> Option<Cursor> {
        match state.cursor {
            Cursor::Done => None,
            cursor => Some(cursor),
        }
    }

    /// Choose the starting state for a run.
    ///
    /// An inconsistent snapshot is only resumed when `accept` agrees;
    /// otherwise the run starts fresh.
    pub fn prepare<F>(&self, request: ResumeRequest<'_>, accept: F) -> Result<Prepared>
    where
        F: FnOnce(&ConsistencyReport) -> bool,
    {
        let current = request.config.snapshot();
        let fresh = |report: Option<ConsistencyReport>| Prepared {
            state: PipelineState::new(request.subject_id, request.subject_path, current.clone()),
            resumed_from: None,
            report,
        };

        let (snapshot, path) = match &request.source {
            ResumeSource::Fresh => return Ok(fresh(None)),
            ResumeSource::Latest => {
                let listing = self.store.list(request.subject_id);
                let Some(path) = listing.paths().next().map(Path::to_path_buf) else {
                    info!(subject = %request.subject_id, "No snapshot found, starting fresh");
                    return Ok(fresh(None));
                };
                (self.store.load(&path)?, path)
            }
            ResumeSource::File(path) => (self.store.load(path)?, path.clone()),
        };

        let report = verify(&snapshot, request.subject_path, &current);
        if !report.consistent {
            for difference in &report.differences {
                warn!(snapshot = %path.display(), "{difference}");
            }
            if !accept(&report) {
                info!(subject = %request.subject_id, "Snapshot rejected, starting fresh");
                return Ok(fresh(Some(report)));
            }
        }

        let mut state = snapshot.state;
        if state.subject_id != request.subject_id {
            warn!(
                recorded = %state.subject_id,
                current = %request.subject_id,
                "Snapshot belongs to another subject id; continuing under the current one"
            );
            state.subject_id = request.subject_id.to_string();
        }
        state.subject_path = request.subject_path.to_path_buf();
        state.max_followups = request.config.workflow.max_followups;
        state.config = current;

        info!(
            subject = %state.subject_id,
            cursor = %state.cursor,
            records = state.records.len(),
            snapshot = %path.display(),
            "Resuming from snapshot"
        );
        Ok(Prepared {
            state,
            resumed_from: Some(path),
            report: Some(report),
        })
    }

    /// Run stages until the pipeline is done or a stage fails.
    pub async fn run(&self, state: &mut PipelineState) -> Result<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();
        let pb = self.progress_bar(state);

        info!(
            subject = %state.subject_id,
            cursor = %state.cursor,
            total_items = state.total_items,
            "Starting pipeline"
        );

        // a fresh run is recorded before its first stage
        if self.checkpoints && state.records.is_empty() {
            summary.last_snapshot = Some(self.store.save(state)?);
        }

        while let Some(cursor) = Self::next_stage(state) {
            pb.set_message(cursor.to_string());

            let output = match self.executor.execute(cursor, state).await {
                Ok(output) => output,
                Err(err) => {
                    error!(subject = %state.subject_id, stage = %cursor, error = %err, "Stage failed");
                    if self.checkpoints {
                        match self.store.save(state) {
                            Ok(saved) => info!(path = %saved.path.display(), "Saved progress before failing"),
                            Err(e) => warn!(error = %e, "Could not save progress after stage failure"),
                        }
                    }
                    pb.abandon();
                    return Err(PeruseError::Stage(err));
                }
            };

            state.apply(output)?;
            summary.stages_run += 1;

            if self.checkpoints {
                summary.last_snapshot = Some(self.store.save(state)?);
            }

            pb.set_length(pb.length().unwrap_or(0).max(state.records.len() as u64 + 1));
            pb.set_position(state.records.len() as u64);
        }

        pb.finish_with_message("done");
        info!(
            subject = %state.subject_id,
            stages = summary.stages_run,
            runtime_secs = start.elapsed().as_secs_f64(),
            "Pipeline complete"
        );
        Ok(summary)
    }

    fn progress_bar(&self, state: &PipelineState) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        // structure + selection + answer/verify per item + integration
        let expected = 3 + 2 * state.total_items as u64;
        let pb = ProgressBar::new(expected.max(state.records.len() as u64));
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb.set_position(state.records.len() as u64);
        pb
    }
}
