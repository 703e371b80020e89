//! Prompt templates for the analysis stages.

use crate::models::{PipelineState, StageKind};
use std::fmt::Write as _;

pub const ANALYZER_SYSTEM: &str = "You are a careful research assistant. \
You read scientific papers closely and answer only from their content. \
Cite the page of every claim you take from the paper as [P3].";

pub const REVIEWER_SYSTEM: &str = "You are a strict peer reviewer. \
You check claims against the paper and ask only questions the paper can answer.";

/// Stage 0: structure of the paper.
pub fn structure(document: &str) -> String {
    format!(
        "Read this paper and summarise how it is organised.\n\n\
         Paper:\n{document}\n\n\
         Briefly give:\n\
         1. The section structure\n\
         2. The core content of each section (1-2 sentences)\n\n\
         Keep it concise."
    )
}

/// Question selection from the structure summary.
pub fn select_questions(structure: &str, count: usize) -> String {
    let mut prompt = format!(
        "You are reviewing a paper. Based on its structure, choose the {count} questions \
         that matter most to a researcher and deserve a detailed answer.\n\n\
         You only get {count} questions, so ask the most central ones.\n\n\
         Paper structure:\n{structure}\n\n\
         Requirements:\n\
         1. Start from concrete content of the paper; do not ask about things it does not cover\n\
         2. Avoid questions without value (\"where is the code\", \"what is future work\")\n\
         3. Prefer the core contribution and method, key experimental design and results, \
         strengths and limitations, and how it differs from prior work\n\n\
         Output exactly {count} questions, one per line, formatted as:\n"
    );
    for i in 1..=count {
        let _ = writeln!(prompt, "Question {i}: ...");
    }
    prompt
}

/// Answer one question, optionally revising a previous answer.
pub fn answer(document: &str, question: &str, revision: Option<(&str, &str)>) -> String {
    let mut prompt = format!(
        "Answer the following question from the paper. Cite pages as [P3] when you use the paper.\n\n\
         Paper:\n{document}\n\n\
         Question: {question}\n"
    );
    if let Some((previous, followup)) = revision {
        let _ = write!(
            prompt,
            "\nYour previous answer was reviewed and needs more work.\n\n\
             Previous answer:\n{previous}\n\n\
             Reviewer follow-up: {followup}\n"
        );
    }
    prompt.push_str("\nGive an accurate, detailed answer. Write formulas as LaTeX.");
    prompt
}

/// Verification of one answer against the paper.
pub fn verify(document: &str, question: &str, answer: &str) -> String {
    format!(
        "Check whether the following answer is accurate.\n\n\
         Question: {question}\n\n\
         Answer: {answer}\n\n\
         Paper:\n{document}\n\n\
         Check:\n\
         1. Cited pages exist and are correct\n\
         2. The answer agrees with the paper\n\
         3. There are no obvious logical errors or speculation\n\n\
         Output format:\n\
         Result: accurate / inaccurate / partially accurate\n\
         Issues: (brief, if any)\n\
         Follow-up needed: yes / no\n\
         Follow-up question: (brief, if needed)"
    )
}

/// Final report from the question and answer history.
pub fn integrate(history: &str) -> String {
    format!(
        "Combine the following conversation into a report on the paper.\n\n\
         {history}\n\
         Report structure:\n\
         1. **Background and contributions**: the setting and the core contributions\n\
         2. **Main content**: methods, technical details and results, ordered by importance; \
         use subsections where useful\n\
         3. **Summary**: the value of the paper and where it applies\n\n\
         Keep only verified, accurate information."
    )
}

/// Question and answer history of a state, latest answer per item.
pub fn qa_history(state: &PipelineState) -> String {
    let mut out = String::from("# Conversation\n\n");
    for (i, question) in state.questions.iter().enumerate() {
        let item = i + 1;
        let Some(answer) = state.latest_answer(item) else {
            continue;
        };
        let _ = write!(
            out,
            "## Question {item}\n\n**Question**: {question}\n\n**Answer**: {answer}\n\n"
        );
        if let Some(verdict) = state
            .item_records(StageKind::Verify, item)
            .last()
            .and_then(|r| r.accurate)
        {
            let note = if verdict { "verified" } else { "reviewer flagged issues" };
            let _ = write!(out, "**Review**: {note}\n\n");
        }
        out.push_str("---\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::{advance_items, state_with_items};

    #[test]
    fn selection_prompt_lists_every_slot() {
        let prompt = select_questions("1. Intro", 4);
        assert!(prompt.contains("choose the 4 questions"));
        assert!(prompt.contains("Question 4: ..."));
        assert!(!prompt.contains("Question 5"));
    }

    #[test]
    fn revision_includes_previous_answer() {
        let fresh = answer("doc", "Why?", None);
        assert!(!fresh.contains("Previous answer"));

        let revised = answer("doc", "Why?", Some(("Because.", "Which section?")));
        assert!(revised.contains("Previous answer:\nBecause."));
        assert!(revised.contains("Reviewer follow-up: Which section?"));
    }

    #[test]
    fn history_has_one_block_per_answered_item() {
        let mut state = state_with_items(3);
        advance_items(&mut state, 2);
        let history = qa_history(&state);
        assert!(history.contains("## Question 1"));
        assert!(history.contains("**Answer**: answer 2"));
        assert!(!history.contains("## Question 3"));
        assert_eq!(history.matches("**Review**: verified").count(), 2);
    }
}
