//! Snapshot retention.
//!
//! Bounds the store by age, per-subject count, global count and global size,
//! applied in that order. Marking is by path; nothing is deleted until the
//! whole plan is computed.
//!
//! - The newest snapshot of every subject is never marked
//! - Completed snapshots are exempt when `protect_completed` is set
//! - A snapshot and its mirror are one unit, sized together
//! - Per-file failures are counted, never fatal

use super::store::{mirror_path, read_snapshot, scan_snapshots};
use crate::models::RetentionPolicy;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const SECS_PER_DAY: f64 = 86_400.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Why a snapshot was marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReason {
    Age,
    PerSubject,
    MaxFiles,
    MaxSize,
}

impl fmt::Display for MarkReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarkReason::Age => "older than max_age_days",
            MarkReason::PerSubject => "over keep_per_subject",
            MarkReason::MaxFiles => "over max_files",
            MarkReason::MaxSize => "over max_size_mb",
        };
        f.write_str(s)
    }
}

/// A snapshot scheduled for deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkedSnapshot {
    pub path: PathBuf,
    pub mirror: PathBuf,
    pub modified: SystemTime,
    /// Snapshot plus mirror bytes
    pub size: u64,
    pub reason: MarkReason,
}

/// Snapshots a policy would delete, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupPlan {
    pub marked: Vec<MarkedSnapshot>,
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    pub failed: usize,
    /// False when the policy was disabled and nothing was considered
    pub applied: bool,
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    mirror: PathBuf,
    modified: SystemTime,
    size: u64,
    /// Newest of its subject or protected-completed
    pinned: bool,
}

/// Apply a policy to the store. No-op unless `auto_cleanup` is set.
pub fn cleanup(store_root: &Path, policy: &RetentionPolicy) -> CleanupReport {
    if !policy.auto_cleanup {
        debug!("Retention disabled, skipping cleanup");
        return CleanupReport::default();
    }
    plan(store_root, policy, SystemTime::now()).execute()
}

/// Compute which snapshots `policy` would delete at time `now`.
///
/// A snapshot and its mirror form one unit: its size, and the bytes the size
/// rule counts towards the overage, include the mirror file.
pub fn plan(store_root: &Path, policy: &RetentionPolicy, now: SystemTime) -> CleanupPlan {
    let subjects = collect(store_root, policy.protect_completed);
    let mut marked: HashSet<PathBuf> = HashSet::new();
    let mut plan = CleanupPlan::default();
    let mut mark = |c: &Candidate, reason: MarkReason, marked: &mut HashSet<PathBuf>| {
        if !c.pinned && marked.insert(c.path.clone()) {
            plan.marked.push(MarkedSnapshot {
                path: c.path.clone(),
                mirror: c.mirror.clone(),
                modified: c.modified,
                size: c.size,
                reason,
            });
        }
    };

    if let Some(days) = policy.max_age_days {
        let max_age = Duration::from_secs_f64((days * SECS_PER_DAY).max(0.0));
        for c in subjects.iter().flatten() {
            let age = now.duration_since(c.modified).unwrap_or_default();
            if age > max_age {
                mark(c, MarkReason::Age, &mut marked);
            }
        }
    }

    if let Some(keep) = policy.keep_per_subject {
        for snapshots in &subjects {
            let unmarked: Vec<&Candidate> = snapshots
                .iter()
                .filter(|c| !marked.contains(&c.path))
                .collect();
            let mut kept = 0;
            for c in unmarked {
                if c.pinned && !is_newest(c, snapshots) {
                    continue;
                }
                if kept < keep || c.pinned {
                    kept += 1;
                } else {
                    mark(c, MarkReason::PerSubject, &mut marked);
                }
            }
        }
    }

    // oldest first across the whole store
    let mut remaining: Vec<&Candidate> = subjects
        .iter()
        .flatten()
        .filter(|c| !marked.contains(&c.path))
        .collect();
    remaining.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    if let Some(max_files) = policy.max_files {
        let mut count = remaining.len();
        for &c in remaining.iter().filter(|c| !c.pinned) {
            if count <= max_files {
                break;
            }
            mark(c, MarkReason::MaxFiles, &mut marked);
            count -= 1;
        }
    }

    if let Some(max_mb) = policy.max_size_mb {
        let limit = (max_mb.max(0.0) * BYTES_PER_MB) as u64;
        let total: u64 = remaining
            .iter()
            .filter(|c| !marked.contains(&c.path))
            .map(|c| c.size)
            .sum();
        if total > limit {
            let overage = total - limit;
            let mut freed = 0;
            for &c in remaining.iter().filter(|c| !c.pinned) {
                if freed >= overage {
                    break;
                }
                if marked.contains(&c.path) {
                    continue;
                }
                mark(c, MarkReason::MaxSize, &mut marked);
                freed += c.size;
            }
        }
    }

    plan.marked
        .sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    plan
}

impl CleanupPlan {
    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    /// Bytes the plan would free if every deletion succeeded.
    pub fn bytes(&self) -> u64 {
        self.marked.iter().map(|m| m.size).sum()
    }

    /// Delete every marked snapshot and its mirror.
    pub fn execute(self) -> CleanupReport {
        let mut report = CleanupReport {
            applied: true,
            ..Default::default()
        };

        for m in &self.marked {
            let snapshot_size = fs::metadata(&m.path).map(|md| md.len()).unwrap_or(0);
            match fs::remove_file(&m.path) {
                Ok(()) => {
                    report.deleted += 1;
                    report.freed_bytes += snapshot_size;
                    debug!(path = %m.path.display(), reason = %m.reason, "Deleted snapshot");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(path = %m.path.display(), error = %e, "Failed to delete snapshot");
                    continue;
                }
            }

            let mirror_size = fs::metadata(&m.mirror).map(|md| md.len()).unwrap_or(0);
            match fs::remove_file(&m.mirror) {
                Ok(()) => report.freed_bytes += mirror_size,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %m.mirror.display(), error = %e, "Failed to delete readable mirror");
                }
            }
        }

        if report.deleted > 0 || report.failed > 0 {
            info!(
                deleted = report.deleted,
                freed_bytes = report.freed_bytes,
                failed = report.failed,
                "Snapshot cleanup finished"
            );
        }
        report
    }
}

fn is_newest(c: &Candidate, snapshots: &[Candidate]) -> bool {
    snapshots.first().is_some_and(|n| n.path == c.path)
}

/// Candidates per subject directory, each list newest first.
fn collect(store_root: &Path, protect_completed: bool) -> Vec<Vec<Candidate>> {
    let Ok(read) = fs::read_dir(store_root) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = read
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    dirs.iter()
        .map(|dir| {
            scan_snapshots(dir)
                .into_iter()
                .enumerate()
                .map(|(i, entry)| {
                    let mirror = mirror_path(&entry.path);
                    let mirror_size = fs::metadata(&mirror).map(|m| m.len()).unwrap_or(0);
                    let completed = protect_completed
                        && read_snapshot(&entry.path).is_ok_and(|s| s.state.is_complete());
                    Candidate {
                        mirror,
                        modified: entry.modified,
                        size: entry.size + mirror_size,
                        pinned: i == 0 || completed,
                        path: entry.path,
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SnapshotStore;
    use crate::models::StageOutput;
    use crate::models::test_support::{advance_items, state_with_items};
    use std::fs::File;
    use std::io::Write as _;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            auto_cleanup: true,
            ..Default::default()
        }
    }

    /// Save a snapshot of `subject` and backdate it by `days_old`.
    fn save_aged(store: &SnapshotStore, subject: &str, days_old: u32, complete: bool) -> PathBuf {
        let mut state = state_with_items(1);
        state.subject_id = subject.to_string();
        if complete {
            advance_items(&mut state, 1);
            state.apply(StageOutput::Report("# Report".into())).unwrap();
        }
        let saved = store.save(&state).unwrap();
        let when = SystemTime::now() - DAY * days_old;
        File::options()
            .write(true)
            .open(&saved.path)
            .unwrap()
            .set_modified(when)
            .unwrap();
        saved.path
    }

    #[test]
    fn disabled_policy_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let old = save_aged(&store, "a", 100, false);
        save_aged(&store, "a", 0, false);

        let report = cleanup(temp.path(), &RetentionPolicy {
            max_age_days: Some(1.0),
            ..Default::default()
        });
        assert!(!report.applied);
        assert!(old.exists());
    }

    #[test]
    fn age_deletes_old_snapshots_and_mirrors() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let oldest = save_aged(&store, "a", 10, false);
        let middle = save_aged(&store, "a", 5, false);
        let newest = save_aged(&store, "a", 0, false);

        let report = cleanup(temp.path(), &RetentionPolicy {
            max_age_days: Some(7.0),
            ..policy()
        });
        assert!(report.applied);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 0);
        assert!(report.freed_bytes > 0);
        assert!(!oldest.exists());
        assert!(!mirror_path(&oldest).exists());
        assert!(middle.exists());
        assert!(newest.exists());
    }

    #[test]
    fn newest_snapshot_survives_every_rule() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let only = save_aged(&store, "a", 30, false);

        let report = cleanup(temp.path(), &RetentionPolicy {
            max_age_days: Some(1.0),
            keep_per_subject: Some(0),
            max_files: Some(0),
            max_size_mb: Some(0.0),
            ..policy()
        });
        assert_eq!(report.deleted, 0);
        assert!(only.exists());
    }

    #[test]
    fn per_subject_budget_skips_completed() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let completed = save_aged(&store, "a", 4, true);
        let old = save_aged(&store, "a", 3, false);
        let mid = save_aged(&store, "a", 2, false);
        let newest = save_aged(&store, "a", 1, false);

        let plan = plan(temp.path(), &RetentionPolicy {
            keep_per_subject: Some(2),
            ..policy()
        }, SystemTime::now());
        let paths: Vec<&Path> = plan.marked.iter().map(|m| m.path.as_path()).collect();
        assert_eq!(paths, vec![old.as_path()]);
        assert_eq!(plan.marked[0].reason, MarkReason::PerSubject);

        plan.execute();
        assert!(completed.exists());
        assert!(mid.exists());
        assert!(newest.exists());
    }

    #[test]
    fn completed_snapshots_deletable_without_protection() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let completed = save_aged(&store, "a", 20, true);
        save_aged(&store, "a", 0, false);

        let report = cleanup(temp.path(), &RetentionPolicy {
            max_age_days: Some(7.0),
            protect_completed: false,
            ..policy()
        });
        assert_eq!(report.deleted, 1);
        assert!(!completed.exists());
    }

    #[test]
    fn global_count_removes_oldest_across_subjects() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let a_old = save_aged(&store, "a", 9, false);
        let b_old = save_aged(&store, "b", 8, false);
        let a_mid = save_aged(&store, "a", 5, false);
        save_aged(&store, "a", 0, false);
        save_aged(&store, "b", 0, false);

        let plan = plan(temp.path(), &RetentionPolicy {
            max_files: Some(3),
            ..policy()
        }, SystemTime::now());
        let paths: Vec<&Path> = plan.marked.iter().map(|m| m.path.as_path()).collect();
        assert_eq!(paths, vec![a_old.as_path(), b_old.as_path()]);
        assert!(plan.marked.iter().all(|m| m.reason == MarkReason::MaxFiles));
        assert!(a_mid.exists());
    }

    #[test]
    fn size_limit_frees_at_least_the_overage() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let oldest = save_aged(&store, "a", 3, false);
        let middle = save_aged(&store, "a", 2, false);
        let newest = save_aged(&store, "a", 1, false);

        let unit = fs::metadata(&oldest).unwrap().len() + fs::metadata(mirror_path(&oldest)).unwrap().len();
        // room for a bit more than two units
        let limit_mb = (unit as f64 * 2.5) / BYTES_PER_MB;

        let plan = plan(temp.path(), &RetentionPolicy {
            max_size_mb: Some(limit_mb),
            ..policy()
        }, SystemTime::now());
        assert_eq!(plan.marked.len(), 1);
        assert_eq!(plan.marked[0].path, oldest);
        assert_eq!(plan.marked[0].reason, MarkReason::MaxSize);
        assert!(middle.exists() && newest.exists());
    }

    /// Save a snapshot without mirror, padded to exactly `size` bytes.
    fn save_padded(store: &SnapshotStore, hours_old: u32, complete: bool, size: u64) -> PathBuf {
        let path = save_aged(store, "a", 0, complete);
        let mut file = File::options().append(true).open(&path).unwrap();
        let current = file.metadata().unwrap().len();
        file.write_all(&vec![b' '; (size - current) as usize]).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600) * hours_old)
            .unwrap();
        path
    }

    fn ten_megabytes(protect_oldest: bool) -> (TempDir, Vec<PathBuf>) {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path()).with_mirror(false);
        let paths = (0..10u32)
            .map(|i| save_padded(&store, 10 - i, protect_oldest && i < 2, MB))
            .collect();
        (temp, paths)
    }

    const MB: u64 = 1024 * 1024;

    #[test]
    fn size_limit_keeps_store_at_cap() {
        let (temp, paths) = ten_megabytes(false);

        let report = cleanup(temp.path(), &RetentionPolicy {
            max_size_mb: Some(5.0),
            protect_completed: false,
            ..policy()
        });
        assert_eq!(report.deleted, 5);
        assert_eq!(report.freed_bytes, 5 * MB);

        let remaining: u64 = paths
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        assert_eq!(remaining, 5 * MB);
        assert!(paths[..5].iter().all(|p| !p.exists()));
        assert!(paths[5..].iter().all(|p| p.exists()));
    }

    #[test]
    fn size_limit_spares_protected_completed() {
        let (temp, paths) = ten_megabytes(true);

        let report = cleanup(temp.path(), &RetentionPolicy {
            max_size_mb: Some(5.0),
            protect_completed: true,
            ..policy()
        });
        assert_eq!(report.deleted, 5);
        assert!(paths[0].exists() && paths[1].exists());
        assert!(paths[2..7].iter().all(|p| !p.exists()));
        assert!(paths[7..].iter().all(|p| p.exists()));
    }

    #[test]
    fn missing_file_is_counted_not_fatal() {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path());
        let first = save_aged(&store, "a", 10, false);
        let second = save_aged(&store, "a", 9, false);
        save_aged(&store, "a", 0, false);

        let plan = plan(temp.path(), &RetentionPolicy {
            max_age_days: Some(7.0),
            ..policy()
        }, SystemTime::now());
        assert_eq!(plan.marked.len(), 2);
        let expected_bytes = plan.bytes();
        fs::remove_file(&first).unwrap();

        let report = plan.execute();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 1);
        assert!(report.freed_bytes < expected_bytes);
        assert!(!second.exists());
    }
}
