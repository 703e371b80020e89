//! Resume-target staleness checks.
//!
//! Compares a snapshot's provenance with the current input and
//! configuration. Every check runs; the caller decides what to do with the
//! differences.

use super::identity::normalize;
use super::store::{Fingerprint, Snapshot};
use crate::models::{ConfigSnapshot, ModelSpec, ModelsConfig};
use std::path::Path;

/// Outcome of comparing a snapshot with the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub consistent: bool,
    /// Human-readable differences, in check order
    pub differences: Vec<String>,
}

impl ConsistencyReport {
    fn from_differences(differences: Vec<String>) -> Self {
        Self {
            consistent: differences.is_empty(),
            differences,
        }
    }
}

/// Compare a snapshot against the current subject path and configuration.
pub fn verify(snapshot: &Snapshot, subject_path: &Path, current: &ConfigSnapshot) -> ConsistencyReport {
    let mut differences = Vec::new();
    let recorded = &snapshot.state;

    let recorded_path = normalize(&recorded.subject_path);
    let current_path = normalize(subject_path);
    if recorded_path != current_path {
        differences.push(format!(
            "subject path changed: {} -> {}",
            recorded_path.display(),
            current_path.display()
        ));
    }

    if let (Some(then), Some(now)) = (&snapshot.input_fingerprint, Fingerprint::capture(subject_path)) {
        if then.size != now.size {
            differences.push(format!("input size changed: {} -> {} bytes", then.size, now.size));
        }
        if then.content_hash != now.content_hash {
            differences.push(format!(
                "input content changed: sha256 {} -> {}",
                short_hash(&then.content_hash),
                short_hash(&now.content_hash)
            ));
        }
    }

    let config = &recorded.config;
    if let (Some(then), Some(now)) = (&config.models, &current.models) {
        if then != now {
            differences.push(format!(
                "models changed: {} -> {}",
                describe_models(then),
                describe_models(now)
            ));
        }
    }

    if let (Some(then), Some(now)) = (&config.workflow, &current.workflow) {
        if then.num_questions != now.num_questions {
            differences.push(format!(
                "workflow.num_questions changed: {} -> {}",
                then.num_questions, now.num_questions
            ));
        }
        if then.max_followups != now.max_followups {
            differences.push(format!(
                "workflow.max_followups changed: {} -> {}",
                then.max_followups, now.max_followups
            ));
        }
        if then.integration_model != now.integration_model {
            differences.push(format!(
                "workflow.integration_model changed: {:?} -> {:?}",
                then.integration_model, now.integration_model
            ));
        }
    }

    if !config.api.base_url.is_empty() && config.api.base_url != current.api.base_url {
        differences.push(format!(
            "api.base_url changed: {} -> {}",
            config.api.base_url, current.api.base_url
        ));
    }

    ConsistencyReport::from_differences(differences)
}

fn describe_models(models: &ModelsConfig) -> String {
    let spec = |m: &ModelSpec| format!("{} (t={}, max={})", m.id, m.temperature, m.max_tokens);
    format!("analyzer {}, reviewer {}", spec(&models.analyzer), spec(&models.reviewer))
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SnapshotStore;
    use crate::models::test_support::{minimal, state_with_items};
    use std::fs;
    use tempfile::TempDir;

    fn saved_snapshot(temp: &TempDir) -> (Snapshot, std::path::PathBuf) {
        let input = temp.path().join("2510.19555v1.pdf");
        fs::write(&input, "original body").unwrap();

        let mut state = state_with_items(3);
        state.subject_path = input.clone();
        state.config = minimal().snapshot();

        let store = SnapshotStore::new(temp.path().join("cp"));
        let saved = store.save(&state).unwrap();
        (store.load(&saved.path).unwrap(), input)
    }

    #[test]
    fn unchanged_input_and_config_is_consistent() {
        let temp = TempDir::new().unwrap();
        let (snapshot, input) = saved_snapshot(&temp);
        let report = verify(&snapshot, &input, &minimal().snapshot());
        assert!(report.consistent, "{:?}", report.differences);
        assert!(report.differences.is_empty());
    }

    #[test]
    fn size_and_content_change_are_separate_entries() {
        let temp = TempDir::new().unwrap();
        let (snapshot, input) = saved_snapshot(&temp);
        fs::write(&input, "a rather longer modified body").unwrap();

        let report = verify(&snapshot, &input, &minimal().snapshot());
        assert!(!report.consistent);
        assert_eq!(report.differences.len(), 2);
        assert!(report.differences[0].starts_with("input size changed"));
        assert!(report.differences[1].starts_with("input content changed"));
    }

    #[test]
    fn same_size_edit_reports_content_only() {
        let temp = TempDir::new().unwrap();
        let (snapshot, input) = saved_snapshot(&temp);
        fs::write(&input, "ORIGINAL BODY").unwrap();

        let report = verify(&snapshot, &input, &minimal().snapshot());
        assert_eq!(report.differences.len(), 1);
        assert!(report.differences[0].starts_with("input content changed"));
    }

    #[test]
    fn workflow_change_names_the_field() {
        let temp = TempDir::new().unwrap();
        let (snapshot, input) = saved_snapshot(&temp);
        let mut config = minimal();
        config.workflow.num_questions = 4;

        let report = verify(&snapshot, &input, &config.snapshot());
        assert_eq!(report.differences, vec!["workflow.num_questions changed: 3 -> 4".to_string()]);
    }

    #[test]
    fn every_check_runs() {
        let temp = TempDir::new().unwrap();
        let (snapshot, _) = saved_snapshot(&temp);
        let moved = temp.path().join("elsewhere.pdf");
        fs::write(&moved, "other").unwrap();

        let mut config = minimal();
        config.models.analyzer.id = "gpt-4.1".to_string();
        config.api.base_url = "http://localhost:8000/v1".to_string();

        let report = verify(&snapshot, &moved, &config.snapshot());
        let kinds: Vec<&str> = report
            .differences
            .iter()
            .map(|d| d.split(':').next().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "subject path changed",
                "input size changed",
                "input content changed",
                "models changed",
                "api.base_url changed",
            ]
        );
    }

    #[test]
    fn missing_fingerprint_skips_content_checks() {
        let temp = TempDir::new().unwrap();
        let (mut snapshot, input) = saved_snapshot(&temp);
        snapshot.input_fingerprint = None;
        fs::write(&input, "changed entirely").unwrap();

        let report = verify(&snapshot, &input, &minimal().snapshot());
        assert!(report.consistent);
    }
}
