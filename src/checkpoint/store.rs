//! Snapshot store: durable, write-once pipeline snapshots.
//!
//! Layout: `<root>/<subject_id>/checkpoint_<slug>_<timestamp>.json` plus a
//! `readable_<slug>_<timestamp>.md` mirror for humans.
//!
//! - Snapshots are written to a temp file and renamed into place
//! - An existing snapshot file is never overwritten
//! - The mirror is best-effort; its failure never fails a save
//! - Newest means greatest modification time, then filename timestamp, then name

use super::label::{slug, stage_label};
use super::lock::LOCK_DIR;
use crate::models::{Config, Cursor, PeruseError, PipelineState, Result, StageKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Snapshot schema version written by this build.
pub const FORMAT_VERSION: &str = "2.0";

pub(crate) const SNAPSHOT_PREFIX: &str = "checkpoint_";
const MIRROR_PREFIX: &str = "readable_";

/// Identity of the input file at save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub size: u64,
    #[serde(default)]
    pub mtime: Option<DateTime<Utc>>,
    /// SHA-256 of the file bytes, lowercase hex
    pub content_hash: String,
}

impl Fingerprint {
    /// Fingerprint a file, `None` if it cannot be read.
    pub fn capture(path: &Path) -> Option<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Input not readable, no fingerprint");
                return None;
            }
        };
        let mtime = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Some(Self {
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            mtime,
            content_hash: format!("{:x}", Sha256::digest(&bytes)),
        })
    }
}

fn default_format_version() -> String {
    FORMAT_VERSION.to_string()
}

/// A persisted pipeline state plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_format_version")]
    pub format_version: String,

    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,

    /// Input identity when the snapshot was taken
    #[serde(default)]
    pub input_fingerprint: Option<Fingerprint>,

    #[serde(default)]
    pub stage_label: String,

    #[serde(flatten)]
    pub state: PipelineState,
}

/// Where a save landed.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRef {
    pub path: PathBuf,
    /// Mirror path, if the mirror was written
    pub mirror: Option<PathBuf>,
    pub label: String,
}

/// Listing metadata for one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSummary {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
    pub saved_at: DateTime<Utc>,
    pub stage_label: String,
    pub items_done: usize,
    pub total_items: usize,
    pub records: usize,
    pub is_completed: bool,
}

/// What `reset` removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub files: usize,
    pub bytes: u64,
}

/// A snapshot file found on disk, not yet parsed.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

impl SnapshotEntry {
    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn sort_key(&self) -> (SystemTime, String, String) {
        let name = self.file_name();
        (self.modified, filename_timestamp(&name).unwrap_or_default(), name)
    }
}

/// Recency-ordered listing of one subject's snapshots.
///
/// Holds only paths and file metadata; [`SnapshotListing::iter`] parses one
/// file at a time and can be called again to restart.
#[derive(Debug, Clone, Default)]
pub struct SnapshotListing {
    entries: Vec<SnapshotEntry>,
}

impl SnapshotListing {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot paths, newest first.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }

    /// Summaries, newest first. Unreadable files are skipped with a warning.
    pub fn iter(&self) -> impl Iterator<Item = SnapshotSummary> + '_ {
        self.entries.iter().filter_map(|entry| match read_snapshot(&entry.path) {
            Ok(snapshot) => Some(summarize(entry, &snapshot)),
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "Skipping unreadable snapshot");
                None
            }
        })
    }
}

fn summarize(entry: &SnapshotEntry, snapshot: &Snapshot) -> SnapshotSummary {
    let state = &snapshot.state;
    SnapshotSummary {
        path: entry.path.clone(),
        file_name: entry.file_name(),
        modified: DateTime::<Utc>::from(entry.modified),
        size: entry.size,
        saved_at: snapshot.saved_at,
        stage_label: if snapshot.stage_label.is_empty() {
            stage_label(state)
        } else {
            snapshot.stage_label.clone()
        },
        items_done: state.items_done(),
        total_items: state.total_items,
        records: state.records.len(),
        is_completed: state.is_complete(),
    }
}

/// Persists and retrieves pipeline snapshots under one root directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    readable_mirror: bool,
    default_total_items: usize,
}

impl SnapshotStore {
    /// Create a store rooted at `root` with the mirror enabled.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            readable_mirror: true,
            default_total_items: 3,
        }
    }

    /// Create a store from the output configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.output.checkpoint_dir)
            .with_mirror(config.output.readable_mirror)
            .with_default_items(config.workflow.num_questions)
    }

    /// Enable or disable the Markdown mirror.
    pub fn with_mirror(mut self, enabled: bool) -> Self {
        self.readable_mirror = enabled;
        self
    }

    /// Item count assumed for snapshots that do not record one.
    pub fn with_default_items(mut self, total: usize) -> Self {
        self.default_total_items = total;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one subject's snapshots.
    pub fn subject_dir(&self, subject_id: &str) -> PathBuf {
        self.root.join(subject_id)
    }

    /// Persist a new snapshot of `state`.
    pub fn save(&self, state: &PipelineState) -> Result<SnapshotRef> {
        let dir = self.subject_dir(&state.subject_id);
        fs::create_dir_all(&dir).map_err(|e| PeruseError::io("creating subject directory", e))?;

        let label = stage_label(state);
        let snapshot = Snapshot {
            format_version: FORMAT_VERSION.to_string(),
            saved_at: Utc::now(),
            input_fingerprint: Fingerprint::capture(&state.subject_path),
            stage_label: label.clone(),
            state: state.clone(),
        };

        let stem = format!(
            "{}_{}",
            slug(&label),
            snapshot.saved_at.format("%Y%m%d_%H%M%S_%6f")
        );
        let path = unused_path(&dir, &stem);

        let temp_path = dir.join(format!(
            ".{}.tmp",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        ));
        if let Err(e) = write_durably(&temp_path, &snapshot) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        // Atomic rename
        fs::rename(&temp_path, &path).map_err(|e| PeruseError::io("renaming snapshot", e))?;

        let mirror = if self.readable_mirror {
            write_mirror(&path, &snapshot)
        } else {
            None
        };

        debug!(subject = %state.subject_id, label = %label, path = %path.display(), "Snapshot saved");
        Ok(SnapshotRef {
            path,
            mirror,
            label,
        })
    }

    /// Newest snapshot of a subject, if any.
    pub fn latest(&self, subject_id: &str) -> Result<Option<Snapshot>> {
        let entries = scan_snapshots(&self.subject_dir(subject_id));
        match entries.first() {
            Some(entry) => self.load(&entry.path).map(Some),
            None => Ok(None),
        }
    }

    /// State of the newest snapshot of a subject, if any.
    pub fn load_latest(&self, subject_id: &str) -> Result<Option<PipelineState>> {
        Ok(self.latest(subject_id)?.map(|s| s.state))
    }

    /// Load one explicit snapshot file.
    ///
    /// Fills in the configured item count when the file lacks one and
    /// rejects a snapshot whose cursor disagrees with its log.
    pub fn load(&self, path: &Path) -> Result<Snapshot> {
        let mut snapshot = read_snapshot(path)?;
        if snapshot.format_version != FORMAT_VERSION {
            warn!(
                path = %path.display(),
                version = %snapshot.format_version,
                expected = FORMAT_VERSION,
                "Snapshot format version differs"
            );
        }

        let state = &mut snapshot.state;
        if state.total_items == 0 {
            state.total_items = if state.questions.is_empty() {
                self.default_total_items
            } else {
                state.questions.len()
            };
        }
        state.check_cursor()?;

        info!(
            path = %path.display(),
            subject = %state.subject_id,
            cursor = %state.cursor,
            records = state.records.len(),
            "Loaded snapshot"
        );
        Ok(snapshot)
    }

    /// Metadata listing of one subject's snapshots, newest first.
    pub fn list(&self, subject_id: &str) -> SnapshotListing {
        SnapshotListing {
            entries: scan_snapshots(&self.subject_dir(subject_id)),
        }
    }

    /// Subject directories present in the store.
    pub fn subjects(&self) -> Vec<String> {
        let Ok(read) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut subjects: Vec<String> = read
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != LOCK_DIR)
            .collect();
        subjects.sort();
        subjects
    }

    /// Remove everything under the root except the lock directory.
    pub fn reset(&self) -> Result<ResetReport> {
        let mut report = ResetReport::default();
        let read = match fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(PeruseError::io("reading snapshot root", e)),
        };

        for entry in read.flatten() {
            if entry.file_name() == LOCK_DIR {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                let (files, bytes) = dir_usage(&path);
                fs::remove_dir_all(&path)
                    .map_err(|e| PeruseError::io(format!("removing {}", path.display()), e))?;
                report.files += files;
                report.bytes += bytes;
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                fs::remove_file(&path)
                    .map_err(|e| PeruseError::io(format!("removing {}", path.display()), e))?;
                report.files += 1;
                report.bytes += size;
            }
        }

        info!(files = report.files, bytes = report.bytes, "Snapshot store reset");
        Ok(report)
    }
}

/// Write `snapshot` to `path` and sync it to disk.
fn write_durably(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let file = File::create(path).map_err(|e| PeruseError::io("creating temp snapshot", e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot).map_err(PeruseError::Serialize)?;
    writer
        .flush()
        .map_err(|e| PeruseError::io("flushing temp snapshot", e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| PeruseError::io("syncing temp snapshot", e))
}

/// Write the readable companion of the snapshot at `snapshot_path`.
///
/// Failures are logged and yield `None`.
fn write_mirror(snapshot_path: &Path, snapshot: &Snapshot) -> Option<PathBuf> {
    let path = mirror_path(snapshot_path);
    match fs::write(&path, render_mirror(snapshot)) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to write readable mirror");
            None
        }
    }
}

/// Parse a snapshot file without post-processing.
pub(crate) fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let content = fs::read_to_string(path)
        .map_err(|e| PeruseError::io(format!("reading snapshot {}", path.display()), e))?;
    serde_json::from_str(&content).map_err(|source| PeruseError::Snapshot {
        path: path.to_path_buf(),
        source,
    })
}

/// Snapshot files in a directory, newest first.
///
/// A missing or unreadable directory yields an empty list.
pub(crate) fn scan_snapshots(dir: &Path) -> Vec<SnapshotEntry> {
    let pattern = format!(
        "{}/{}*.json",
        glob::Pattern::escape(&dir.to_string_lossy()),
        SNAPSHOT_PREFIX
    );
    let Ok(paths) = glob::glob(&pattern) else {
        return Vec::new();
    };

    let mut entries: Vec<SnapshotEntry> = paths
        .flatten()
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            if !meta.is_file() {
                return None;
            }
            Some(SnapshotEntry {
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
                path,
            })
        })
        .collect();

    entries.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
    entries
}

/// Mirror file paired with a snapshot file.
pub fn mirror_path(snapshot: &Path) -> PathBuf {
    let name = snapshot
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name
        .strip_prefix(SNAPSHOT_PREFIX)
        .unwrap_or(&name)
        .trim_end_matches(".json");
    snapshot.with_file_name(format!("{MIRROR_PREFIX}{stem}.md"))
}

/// First free `checkpoint_<stem>[_N].json` in `dir`.
fn unused_path(dir: &Path, stem: &str) -> PathBuf {
    let first = dir.join(format!("{SNAPSHOT_PREFIX}{stem}.json"));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| dir.join(format!("{SNAPSHOT_PREFIX}{stem}_{n}.json")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// The `YYYYmmdd_HHMMSS_ffffff` part of a snapshot file name.
fn filename_timestamp(name: &str) -> Option<String> {
    let stem = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(".json")?;
    let parts: Vec<&str> = stem.split('_').collect();
    parts.windows(3).find_map(|w| {
        let digits = |s: &str, n: usize| s.len() == n && s.bytes().all(|b| b.is_ascii_digit());
        (digits(w[0], 8) && digits(w[1], 6) && digits(w[2], 6))
            .then(|| format!("{}_{}_{}", w[0], w[1], w[2]))
    })
}

fn dir_usage(dir: &Path) -> (usize, u64) {
    let Ok(read) = fs::read_dir(dir) else {
        return (0, 0);
    };
    read.flatten().fold((0, 0), |(files, bytes), entry| {
        let path = entry.path();
        if path.is_dir() {
            let (f, b) = dir_usage(&path);
            (files + f, bytes + b)
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            (files + 1, bytes + size)
        }
    })
}

fn render_mirror(snapshot: &Snapshot) -> String {
    let state = &snapshot.state;
    let mut out = String::new();

    let _ = writeln!(out, "# Analysis checkpoint: {}", state.subject_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- Stage: {}", snapshot.stage_label);
    let _ = writeln!(out, "- Saved: {}", snapshot.saved_at.to_rfc3339());
    let _ = writeln!(out, "- Run: {}", state.run_id);
    let _ = writeln!(out, "- Input: {}", state.subject_path.display());
    let _ = writeln!(out, "- Items: {}/{}", state.items_done(), state.total_items);
    if state.cursor != Cursor::Done {
        let _ = writeln!(out, "- Next: {}", state.cursor);
    }

    if let Some(structure) = state.structure() {
        let _ = writeln!(out, "\n## Structure\n\n{structure}");
    }

    if !state.questions.is_empty() {
        let _ = writeln!(out, "\n## Questions\n");
        for (i, q) in state.questions.iter().enumerate() {
            let _ = writeln!(out, "{}. {q}", i + 1);
        }
    }

    for record in state
        .records
        .iter()
        .filter(|r| matches!(r.kind, StageKind::Answer | StageKind::Verify))
    {
        let item = record.item.unwrap_or_default();
        match record.kind {
            StageKind::Answer => {
                let _ = writeln!(out, "\n## Answer {item}\n\n{}", record.content);
            }
            _ => {
                let verdict = match record.accurate {
                    Some(true) => "accurate",
                    Some(false) => "needs work",
                    None => "unknown",
                };
                let _ = writeln!(out, "\n### Verification {item} ({verdict})\n\n{}", record.content);
            }
        }
    }

    if let Some(report) = &state.final_report {
        let _ = writeln!(out, "\n## Final report\n\n{report}");
    }
    out
}
