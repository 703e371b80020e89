//! Parsing of free-form model output.
//!
//! Question lists are read with the `Question N:` pattern first; when the
//! model ignores the format, every non-trivial line is taken as a question
//! instead. Verification verdicts are keyword-based.

use regex::Regex;
use std::sync::LazyLock;

/// Lines this short are never taken as questions by the fallback.
const MIN_FALLBACK_LINE_CHARS: usize = 10;

static QUESTION_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?im)^[\s*#>-]*(?:question|问题)\s*\d+\s*[:：.)]\s*\**\s*").ok());

static LIST_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]+|\d+[.)]|\(\d+\))\s*").ok());

static FOLLOWUP_NEEDED: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:follow-?up needed|needs? follow-?up|需要追问)\s*[:：]\s*\**\s*(?:yes|是)").ok()
});

static FOLLOWUP_QUESTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:follow-?up question|追问内容)\s*[:：]\s*(.+)").ok()
});

/// Parsed verification verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub accurate: bool,
    /// Follow-up question, when one was requested and stated
    pub followup: Option<String>,
}

/// Extract at most `limit` questions from a selection response.
pub fn parse_questions(text: &str, limit: usize) -> Vec<String> {
    let mut questions = marked_questions(text);
    if questions.is_empty() {
        questions = text
            .lines()
            .map(|line| strip_list_marker(line.trim()))
            .filter(|line| line.chars().count() > MIN_FALLBACK_LINE_CHARS)
            .map(str::to_string)
            .collect();
    }
    questions.truncate(limit);
    questions
}

/// Blocks introduced by `Question N:` markers; empty when there are none.
fn marked_questions(text: &str) -> Vec<String> {
    let Some(re) = QUESTION_MARKER.as_ref() else {
        return Vec::new();
    };
    let markers: Vec<(usize, usize)> = re.find_iter(text).map(|m| (m.start(), m.end())).collect();

    markers
        .iter()
        .enumerate()
        .map(|(i, &(_, body_start))| {
            let body_end = markers.get(i + 1).map_or(text.len(), |&(next, _)| next);
            text[body_start..body_end].trim().to_string()
        })
        .filter(|q| !q.is_empty())
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    match LIST_MARKER.as_ref().and_then(|re| re.find(line)) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// Read a reviewer's verification response.
///
/// Accurate unless the text says "inaccurate" or "partially accurate".
/// A follow-up is only returned when one is requested and its text is present.
pub fn parse_verification(text: &str) -> Verdict {
    let lower = text.to_lowercase();
    let accurate = !["inaccurate", "partially accurate", "not accurate", "不准确", "部分准确"]
        .iter()
        .any(|marker| lower.contains(marker));

    let requested = FOLLOWUP_NEEDED
        .as_ref()
        .is_some_and(|re| re.is_match(text));

    let followup = requested
        .then(|| {
            FOLLOWUP_QUESTION
                .as_ref()?
                .captures(text)?
                .get(1)
                .map(|m| m.as_str().trim().trim_matches('*').trim().to_string())
        })
        .flatten()
        .filter(|q| !q.is_empty() && !is_placeholder(q));

    Verdict { accurate, followup }
}

fn is_placeholder(q: &str) -> bool {
    matches!(q.to_lowercase().as_str(), "none" | "n/a" | "-" | "无")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_pattern_reads_multiline_questions() {
        let text = "Here are my picks.\n\
                    Question 1: What is the core contribution\nof the attention variant?\n\
                    Question 2: How is the ablation designed?\n\
                    Question 3: Where does the method fail?\n";
        let questions = parse_questions(text, 3);
        assert_eq!(
            questions,
            vec![
                "What is the core contribution\nof the attention variant?",
                "How is the ablation designed?",
                "Where does the method fail?",
            ]
        );
    }

    #[test]
    fn primary_pattern_is_truncated() {
        let text = "Question 1: first real question?\nQuestion 2: second real question?";
        assert_eq!(parse_questions(text, 1), vec!["first real question?"]);
    }

    #[test]
    fn markdown_decorated_markers_are_recognised() {
        let text = "**Question 1:** Why does the loss converge?\n- question 2) What data is used?";
        let questions = parse_questions(text, 3);
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0], "Why does the loss converge?");
        assert_eq!(questions[1], "What data is used?");
    }

    #[test]
    fn fallback_takes_long_lines_without_list_markers() {
        let text = "Sure!\n\n1. How does the encoder handle long inputs?\n- short\n* What baseline is strongest and why?\n";
        let questions = parse_questions(text, 3);
        assert_eq!(
            questions,
            vec![
                "How does the encoder handle long inputs?",
                "What baseline is strongest and why?",
            ]
        );
    }

    #[test]
    fn fallback_on_empty_text_is_empty() {
        assert!(parse_questions("", 3).is_empty());
        assert!(parse_questions("ok\nfine", 3).is_empty());
    }

    #[test]
    fn verification_defaults_to_accurate() {
        let verdict = parse_verification("Result: accurate\nIssues: none\nFollow-up needed: no");
        assert_eq!(
            verdict,
            Verdict {
                accurate: true,
                followup: None
            }
        );
    }

    #[test]
    fn partially_accurate_with_followup() {
        let text = "Result: Partially accurate\n\
                    Issues: page reference [P7] does not exist\n\
                    Follow-up needed: Yes\n\
                    Follow-up question: Which table reports the ablation numbers?\n";
        let verdict = parse_verification(text);
        assert!(!verdict.accurate);
        assert_eq!(
            verdict.followup.as_deref(),
            Some("Which table reports the ablation numbers?")
        );
    }

    #[test]
    fn followup_text_without_request_is_ignored() {
        let text = "Result: inaccurate\nFollow-up needed: no\nFollow-up question: anything?";
        let verdict = parse_verification(text);
        assert!(!verdict.accurate);
        assert_eq!(verdict.followup, None);
    }

    #[test]
    fn requested_followup_without_text_is_none() {
        let verdict = parse_verification("Result: inaccurate\nFollow-up needed: yes\nFollow-up question: none");
        assert_eq!(verdict.followup, None);
    }
}
