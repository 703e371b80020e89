//! Subject identity resolution.
//!
//! A subject keeps one id for its whole life so every snapshot of it lands
//! in the same directory. First match wins:
//! - arXiv-style id in the file name
//! - arXiv marker in the first 3000 characters of the content
//! - an existing `fallback_N` directory whose first snapshot names the same file
//! - a fresh `fallback_N`, one past the highest in use
//!
//! Resolution never fails and never writes.

use super::store::{SNAPSHOT_PREFIX, read_snapshot};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

const FALLBACK_PREFIX: &str = "fallback_";
const CONTENT_SCAN_CHARS: usize = 3000;

static FILENAME_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\b(\d{4}\.\d{4,5})(v\d+)?\b").ok());

static CONTENT_ID: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\barxiv:\s*|arxiv\.org/abs/)(\d{4}\.\d{4,5})(v\d+)?\b").ok()
});

/// Resolve the subject id for an input file.
///
/// `content` may be empty when the document could not be read.
pub fn resolve(subject_path: &Path, content: &str, store_root: &Path) -> String {
    if let Some(id) = id_from_filename(subject_path) {
        debug!(subject = %id, "Subject id from file name");
        return id;
    }

    if let Some(id) = id_from_content(content) {
        debug!(subject = %id, "Subject id from document content");
        return id;
    }

    let dirs = fallback_dirs(store_root);
    let target = normalize(subject_path);
    for (_, dir) in &dirs {
        if first_snapshot_subject(dir).is_some_and(|p| normalize(&p) == target) {
            let id = dir_name(dir);
            debug!(subject = %id, "Reusing fallback subject id");
            return id;
        }
    }

    let id = next_fallback(dirs.iter().map(|(n, _)| *n));
    debug!(subject = %id, "Allocated new fallback subject id");
    id
}

/// Canonical id from a file name, `v1` appended when unversioned.
pub fn id_from_filename(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    canonical(FILENAME_ID.as_ref()?, &name)
}

/// Canonical id from an `arXiv:` or `arxiv.org/abs/` marker near the start.
pub fn id_from_content(content: &str) -> Option<String> {
    if content.is_empty() {
        return None;
    }
    let end = content
        .char_indices()
        .nth(CONTENT_SCAN_CHARS)
        .map_or(content.len(), |(i, _)| i);
    canonical(CONTENT_ID.as_ref()?, &content[..end])
}

fn canonical(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    let base = caps.get(1)?.as_str();
    let version = caps.get(2).map_or("v1", |m| m.as_str());
    Some(format!("{base}{version}"))
}

/// Next free fallback id given the numbers already in use.
pub fn next_fallback(in_use: impl IntoIterator<Item = u64>) -> String {
    let next = in_use.into_iter().max().map_or(1, |n| n + 1);
    format!("{FALLBACK_PREFIX}{next}")
}

/// Number of a `fallback_N` directory name.
pub fn fallback_number(name: &str) -> Option<u64> {
    name.strip_prefix(FALLBACK_PREFIX)?.parse().ok()
}

/// `fallback_N` directories under the root, ascending by N.
fn fallback_dirs(store_root: &Path) -> Vec<(u64, PathBuf)> {
    let Ok(read) = fs::read_dir(store_root) else {
        return Vec::new();
    };
    let mut dirs: Vec<(u64, PathBuf)> = read
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let n = fallback_number(&e.file_name().to_string_lossy())?;
            Some((n, e.path()))
        })
        .collect();
    dirs.sort_by_key(|(n, _)| *n);
    dirs
}

/// Subject path recorded by the lexicographically first snapshot in `dir`.
fn first_snapshot_subject(dir: &Path) -> Option<PathBuf> {
    let mut names: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(".json"))
        })
        .collect();
    names.sort();
    let first = names.first()?;
    match read_snapshot(first) {
        Ok(snapshot) => Some(snapshot.state.subject_path),
        Err(e) => {
            debug!(path = %first.display(), error = %e, "Unreadable fallback snapshot");
            None
        }
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Absolute form of a path: canonical when it exists, lexical otherwise.
pub fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SnapshotStore;
    use crate::models::test_support::state_with_items;
    use tempfile::TempDir;

    #[test]
    fn filename_id_keeps_or_adds_version() {
        assert_eq!(
            id_from_filename(Path::new("/papers/2510.19555v1.pdf")).as_deref(),
            Some("2510.19555v1")
        );
        assert_eq!(
            id_from_filename(Path::new("2401.1234v3.pdf")).as_deref(),
            Some("2401.1234v3")
        );
        assert_eq!(
            id_from_filename(Path::new("paper-2401.12345.pdf")).as_deref(),
            Some("2401.12345v1")
        );
        assert_eq!(id_from_filename(Path::new("notes.pdf")), None);
    }

    #[test]
    fn content_marker_is_case_insensitive_and_bounded() {
        assert_eq!(
            id_from_content("Preprint. ARXIV:2312.00752v2 [cs.LG]").as_deref(),
            Some("2312.00752v2")
        );
        assert_eq!(
            id_from_content("see https://arxiv.org/abs/2312.00752").as_deref(),
            Some("2312.00752v1")
        );

        let late = format!("{}arXiv:2312.00752", "x".repeat(3000));
        assert_eq!(id_from_content(&late), None);
        assert_eq!(id_from_content(""), None);
    }

    #[test]
    fn next_fallback_is_pure() {
        assert_eq!(next_fallback([]), "fallback_1");
        assert_eq!(next_fallback([1, 4, 2]), "fallback_5");
        assert_eq!(fallback_number("fallback_12"), Some(12));
        assert_eq!(fallback_number("fallback_x"), None);
        assert_eq!(fallback_number("2510.19555v1"), None);
    }

    #[test]
    fn fallback_identity_is_reused_for_same_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cp");
        let input = temp.path().join("untitled.pdf");
        fs::write(&input, "plain text").unwrap();

        let id = resolve(&input, "", &root);
        assert_eq!(id, "fallback_1");

        let mut state = state_with_items(3);
        state.subject_id = id.clone();
        state.subject_path = input.clone();
        SnapshotStore::new(&root).save(&state).unwrap();

        assert_eq!(resolve(&input, "", &root), "fallback_1");

        let other = temp.path().join("other.pdf");
        assert_eq!(resolve(&other, "", &root), "fallback_2");
    }

    #[test]
    fn unreadable_fallback_snapshot_is_skipped() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("fallback_3");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("checkpoint_a.json"), "garbage").unwrap();

        assert_eq!(resolve(Path::new("doc.txt"), "", temp.path()), "fallback_4");
    }

    #[test]
    fn filename_beats_content() {
        let temp = TempDir::new().unwrap();
        let id = resolve(
            Path::new("2510.19555v1.pdf"),
            "arXiv:1111.22222v9",
            temp.path(),
        );
        assert_eq!(id, "2510.19555v1");
    }
}
