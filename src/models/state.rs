//! Pipeline progress model.
//!
//! A [`PipelineState`] is the whole progress record of one run: an append-only
//! log of completed stages plus a cursor naming the next stage. The only way to
//! advance it is [`PipelineState::apply`], which checks the output against the
//! cursor before recording it.

use crate::models::{ConfigSnapshot, PeruseError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Kind of a completed stage in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Structure analysis of the document (stage 0)
    Structure,
    /// Reviewer picks the questions
    SelectQuestions,
    /// Analyzer answers one question
    Answer,
    /// Reviewer verifies one answer
    Verify,
    /// Final report integration
    Integrate,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Structure => "structure",
            StageKind::SelectQuestions => "select_questions",
            StageKind::Answer => "answer",
            StageKind::Verify => "verify",
            StageKind::Integrate => "integrate",
        };
        f.write_str(name)
    }
}

/// The next stage to run.
///
/// Items are 1-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Cursor {
    #[default]
    Structure,
    SelectQuestions,
    Answer { item: usize },
    Verify { item: usize },
    Integrate,
    Done,
}

impl Cursor {
    /// Stage kind this cursor will execute, `None` once done.
    pub fn kind(&self) -> Option<StageKind> {
        match self {
            Cursor::Structure => Some(StageKind::Structure),
            Cursor::SelectQuestions => Some(StageKind::SelectQuestions),
            Cursor::Answer { .. } => Some(StageKind::Answer),
            Cursor::Verify { .. } => Some(StageKind::Verify),
            Cursor::Integrate => Some(StageKind::Integrate),
            Cursor::Done => None,
        }
    }

    /// Repeated-item index, if this is an item stage.
    pub fn item(&self) -> Option<usize> {
        match self {
            Cursor::Answer { item } | Cursor::Verify { item } => Some(*item),
            _ => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Answer { item } => write!(f, "answer {item}"),
            Cursor::Verify { item } => write!(f, "verify {item}"),
            Cursor::Done => f.write_str("done"),
            other => match other.kind() {
                Some(kind) => write!(f, "{kind}"),
                None => f.write_str("done"),
            },
        }
    }
}

/// One entry of the append-only stage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Logical sequence number, 1-based and strictly increasing
    pub seq: u64,
    /// Stage that produced this record
    pub kind: StageKind,
    /// Item index for answer/verify records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<usize>,
    /// Raw stage output
    pub content: String,
    /// Verification verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accurate: Option<bool>,
    /// Follow-up question requested by a verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followup: Option<String>,
    /// When the stage completed
    pub recorded_at: DateTime<Utc>,
}

/// Output of one stage execution, merged into the state by [`PipelineState::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Structure(String),
    Questions {
        raw: String,
        questions: Vec<String>,
    },
    Answer(String),
    Verification {
        raw: String,
        accurate: bool,
        followup: Option<String>,
    },
    Report(String),
}

impl StageOutput {
    pub fn kind(&self) -> StageKind {
        match self {
            StageOutput::Structure(_) => StageKind::Structure,
            StageOutput::Questions { .. } => StageKind::SelectQuestions,
            StageOutput::Answer(_) => StageKind::Answer,
            StageOutput::Verification { .. } => StageKind::Verify,
            StageOutput::Report(_) => StageKind::Integrate,
        }
    }
}

/// Full progress record of one subject's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Identifier of the run that produced this state
    #[serde(default = "Uuid::new_v4")]
    pub run_id: Uuid,
    /// Resolved subject identity
    pub subject_id: String,
    /// Input document
    #[serde(default)]
    pub subject_path: PathBuf,
    /// Append-only log of completed stages
    #[serde(default)]
    pub records: Vec<StageRecord>,
    /// Questions chosen by the selection stage
    #[serde(default)]
    pub questions: Vec<String>,
    /// Next stage to run
    #[serde(default)]
    pub cursor: Cursor,
    /// Number of questions; 0 in an old snapshot means "use the configured value"
    #[serde(default, alias = "total_questions")]
    pub total_items: usize,
    /// Follow-up answers a verification may request per item
    #[serde(default)]
    pub max_followups: usize,
    /// Terminal output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    /// When the run started
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    /// Configuration the run was started with
    #[serde(default, rename = "config_snapshot")]
    pub config: ConfigSnapshot,
}

impl PipelineState {
    /// Create a fresh state positioned at the first stage.
    pub fn new(subject_id: impl Into<String>, subject_path: impl Into<PathBuf>, config: ConfigSnapshot) -> Self {
        let workflow = config.workflow.clone().unwrap_or_default();
        Self {
            run_id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            subject_path: subject_path.into(),
            records: Vec::new(),
            questions: Vec::new(),
            cursor: Cursor::Structure,
            total_items: workflow.num_questions,
            max_followups: workflow.max_followups,
            final_report: None,
            started_at: Utc::now(),
            config,
        }
    }

    /// Whether the terminal output exists.
    pub fn is_complete(&self) -> bool {
        self.final_report
            .as_deref()
            .is_some_and(|r| !r.trim().is_empty())
    }

    /// Structure analysis text, once stage 0 has run.
    pub fn structure(&self) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.kind == StageKind::Structure)
            .map(|r| r.content.as_str())
    }

    /// Records for one item and kind, in log order.
    pub fn item_records(&self, kind: StageKind, item: usize) -> impl Iterator<Item = &StageRecord> {
        self.records
            .iter()
            .filter(move |r| r.kind == kind && r.item == Some(item))
    }

    /// Number of answer attempts recorded for an item.
    pub fn attempts(&self, item: usize) -> usize {
        self.item_records(StageKind::Answer, item).count()
    }

    /// Number of items whose last verification let the pipeline move on.
    pub fn items_done(&self) -> usize {
        match self.cursor {
            Cursor::Structure | Cursor::SelectQuestions => 0,
            Cursor::Answer { item } | Cursor::Verify { item } => item.saturating_sub(1),
            Cursor::Integrate | Cursor::Done => self.total_items,
        }
    }

    /// Latest answer text for an item.
    pub fn latest_answer(&self, item: usize) -> Option<&str> {
        self.item_records(StageKind::Answer, item)
            .last()
            .map(|r| r.content.as_str())
    }

    /// Follow-up requested by the latest verification of an item, if any.
    pub fn pending_followup(&self, item: usize) -> Option<&str> {
        self.item_records(StageKind::Verify, item)
            .last()
            .and_then(|r| r.followup.as_deref())
    }

    /// Question text for a 1-based item.
    pub fn question(&self, item: usize) -> Option<&str> {
        item.checked_sub(1)
            .and_then(|i| self.questions.get(i))
            .map(String::as_str)
    }

    /// Merge a stage output into the state and advance the cursor.
    ///
    /// The output must be the one the cursor asks for; prior records are never
    /// touched.
    pub fn apply(&mut self, output: StageOutput) -> Result<()> {
        let expected = self.cursor;
        if expected.kind() != Some(output.kind()) {
            return Err(PeruseError::InvalidTransition {
                expected: expected.to_string(),
                got: output.kind().to_string(),
            });
        }

        let item = expected.item();
        let (content, accurate, followup) = match output {
            StageOutput::Structure(text) => {
                self.cursor = Cursor::SelectQuestions;
                (text, None, None)
            }
            StageOutput::Questions { raw, questions } => {
                let questions: Vec<String> = questions
                    .into_iter()
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .take(self.total_items)
                    .collect();
                if questions.is_empty() {
                    return Err(PeruseError::InvalidInput(
                        "question selection produced no questions".to_string(),
                    ));
                }
                if questions.len() < self.total_items {
                    tracing::warn!(
                        selected = questions.len(),
                        requested = self.total_items,
                        "Fewer questions selected than requested"
                    );
                    self.total_items = questions.len();
                }
                self.questions = questions;
                self.cursor = Cursor::Answer { item: 1 };
                (raw, None, None)
            }
            StageOutput::Answer(text) => {
                let item = item.unwrap_or(1);
                self.cursor = Cursor::Verify { item };
                (text, None, None)
            }
            StageOutput::Verification {
                raw,
                accurate,
                followup,
            } => {
                let item = item.unwrap_or(1);
                // attempts so far include the answer being verified
                let followups_used = self.attempts(item).saturating_sub(1);
                let retry = followup.is_some() && followups_used < self.max_followups;
                self.cursor = if retry {
                    Cursor::Answer { item }
                } else if item < self.total_items {
                    Cursor::Answer { item: item + 1 }
                } else {
                    Cursor::Integrate
                };
                (raw, Some(accurate), followup.filter(|_| retry))
            }
            StageOutput::Report(text) => {
                self.final_report = Some(text.clone());
                self.cursor = Cursor::Done;
                (text, None, None)
            }
        };

        let seq = self.records.last().map_or(1, |r| r.seq + 1);
        self.records.push(StageRecord {
            seq,
            kind: expected.kind().unwrap_or(StageKind::Integrate),
            item,
            content,
            accurate,
            followup,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    /// Check that the cursor agrees with the log.
    ///
    /// Rejects a cursor that points behind recorded work or skips a stage.
    pub fn check_cursor(&self) -> Result<()> {
        let fail = |msg: String| Err(PeruseError::InvalidState(msg));

        if self
            .records
            .windows(2)
            .any(|w| w[1].seq <= w[0].seq)
        {
            return fail("record sequence numbers are not increasing".to_string());
        }

        let has_structure = self.structure().is_some();
        let has_questions = !self.questions.is_empty();
        let verified = |item: usize| self.item_records(StageKind::Verify, item).count();
        let all_before_verified = |limit: usize| (1..limit).all(|i| verified(i) > 0);

        match self.cursor {
            Cursor::Structure if has_structure => fail("cursor at structure but structure recorded".into()),
            Cursor::Structure => Ok(()),
            Cursor::SelectQuestions if !has_structure => fail("questions pending without structure".into()),
            Cursor::SelectQuestions if has_questions => fail("cursor at selection but questions recorded".into()),
            Cursor::SelectQuestions => Ok(()),
            Cursor::Answer { item } | Cursor::Verify { item }
                if !has_questions || item == 0 || item > self.total_items =>
            {
                fail(format!("item {item} outside 1..={}", self.total_items))
            }
            Cursor::Answer { item } | Cursor::Verify { item }
                if !all_before_verified(item) || self.records.iter().any(|r| r.item.is_some_and(|i| i > item)) =>
            {
                fail(format!("item {item} does not follow the recorded items"))
            }
            Cursor::Answer { item } if self.attempts(item) != verified(item) => {
                fail(format!("item {item} has an unverified answer"))
            }
            // a re-answer needs a granted follow-up within the budget
            Cursor::Answer { item }
                if self.attempts(item) > 0
                    && (self.pending_followup(item).is_none() || self.attempts(item) > self.max_followups) =>
            {
                fail(format!("item {item} is already verified"))
            }
            Cursor::Verify { item } if self.attempts(item) != verified(item) + 1 => {
                fail(format!("item {item} has no answer awaiting verification"))
            }
            Cursor::Answer { .. } | Cursor::Verify { .. } => Ok(()),
            Cursor::Integrate if !has_questions || !all_before_verified(self.total_items + 1) => {
                fail("integration pending before all items verified".into())
            }
            Cursor::Integrate if self.final_report.is_some() => fail("integration pending but report present".into()),
            Cursor::Integrate => Ok(()),
            Cursor::Done if self.final_report.is_none() => fail("done without a final report".into()),
            Cursor::Done => Ok(()),
        }
    }
}
