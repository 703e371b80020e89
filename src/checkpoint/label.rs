//! Stage labels: a human-readable name for where a pipeline stands.
//!
//! Labels are pure functions of the state and feed both the snapshot
//! filename (as a slug) and listings.

use crate::models::{Cursor, PipelineState};

/// Describe the progress of a state.
pub fn stage_label(state: &PipelineState) -> String {
    if state.is_complete() {
        return "terminal".to_string();
    }
    if state.structure().is_none() {
        return "stage-0 incomplete".to_string();
    }
    if state.questions.is_empty() {
        return "stage-0 done, selection pending".to_string();
    }
    match state.cursor {
        Cursor::Answer { item } | Cursor::Verify { item } => {
            format!("item {item} attempt {}", state.attempts(item))
        }
        _ => "all items done, awaiting integration".to_string(),
    }
}

/// Filename-safe form of a label: alphanumerics only, lowercased.
pub fn slug(label: &str) -> String {
    label
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageOutput;
    use crate::models::test_support::{advance_items, state_with_items};

    #[test]
    fn labels_follow_progress() {
        let mut state = state_with_items(3);
        assert_eq!(stage_label(&state), "stage-0 incomplete");

        state.apply(StageOutput::Structure("s".into())).unwrap();
        assert_eq!(stage_label(&state), "stage-0 done, selection pending");

        state
            .apply(StageOutput::Questions {
                raw: String::new(),
                questions: vec!["a long question?".to_string(); 3],
            })
            .unwrap();
        assert_eq!(stage_label(&state), "item 1 attempt 0");

        state.apply(StageOutput::Answer("a".into())).unwrap();
        assert_eq!(stage_label(&state), "item 1 attempt 1");
    }

    #[test]
    fn completed_state_is_terminal() {
        let mut state = state_with_items(2);
        advance_items(&mut state, 2);
        assert_eq!(stage_label(&state), "all items done, awaiting integration");

        state.apply(StageOutput::Report("# done".into())).unwrap();
        assert_eq!(stage_label(&state), "terminal");
    }

    #[test]
    fn slug_strips_punctuation() {
        assert_eq!(slug("stage-0 incomplete"), "stage0incomplete");
        assert_eq!(slug("stage-0 done, selection pending"), "stage0doneselectionpending");
        assert_eq!(slug("item 2 attempt 1"), "item2attempt1");
    }
}
