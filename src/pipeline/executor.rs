//! Stage execution.
//!
//! The planner only sees [`StageExecutor`]; [`LlmExecutor`] is the
//! production implementation backed by two chat models:
//! - analyzer: structure analysis and answers
//! - reviewer: question selection, verification, and by default the report

use super::{parser, prompts};
use crate::client::LlmClient;
use crate::models::{
    Config, Cursor, IntegrationModel, ModelSpec, ModelsConfig, PipelineState, StageError,
    StageOutput,
};
use std::future::Future;
use tracing::{debug, info};

/// Runs one pipeline stage.
///
/// Failures are opaque to the caller and never retried by it.
pub trait StageExecutor {
    fn execute(
        &self,
        cursor: Cursor,
        state: &PipelineState,
    ) -> impl Future<Output = Result<StageOutput, StageError>> + Send;
}

/// Executor calling the configured analyzer and reviewer models.
pub struct LlmExecutor {
    client: LlmClient,
    models: ModelsConfig,
    integration: IntegrationModel,
    document: String,
}

impl LlmExecutor {
    /// Create an executor over the loaded document text.
    pub fn new(client: LlmClient, config: &Config, document: String) -> Self {
        Self {
            client,
            models: config.models.clone(),
            integration: config.workflow.integration_model,
            document,
        }
    }

    pub fn client(&self) -> &LlmClient {
        &self.client
    }

    async fn call(
        &self,
        stage: &str,
        model: &ModelSpec,
        system: &str,
        prompt: &str,
    ) -> Result<String, StageError> {
        debug!(stage = stage, model = %model.id, prompt_chars = prompt.len(), "Calling model");
        let response = self
            .client
            .complete_with_system(model, system, prompt)
            .await
            .map_err(|e| StageError::wrap(stage, e))?;

        info!(
            stage = stage,
            model = %response.model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            duration_ms = response.duration.as_millis() as u64,
            "Stage completed"
        );
        Ok(response.content)
    }

    fn integration_model(&self) -> (&ModelSpec, &'static str) {
        match self.integration {
            IntegrationModel::Analyzer => (&self.models.analyzer, prompts::ANALYZER_SYSTEM),
            IntegrationModel::Reviewer => (&self.models.reviewer, prompts::REVIEWER_SYSTEM),
        }
    }
}

fn missing(stage: &str, what: &str) -> StageError {
    StageError::new(stage, format!("{what} is not recorded"))
}

impl StageExecutor for LlmExecutor {
    async fn execute(&self, cursor: Cursor, state: &PipelineState) -> Result<StageOutput, StageError> {
        let stage = cursor.to_string();
        let analyzer = &self.models.analyzer;
        let reviewer = &self.models.reviewer;

        match cursor {
            Cursor::Structure => {
                let prompt = prompts::structure(&self.document);
                let text = self.call(&stage, analyzer, prompts::ANALYZER_SYSTEM, &prompt).await?;
                Ok(StageOutput::Structure(text))
            }
            Cursor::SelectQuestions => {
                let structure = state.structure().ok_or_else(|| missing(&stage, "structure analysis"))?;
                let prompt = prompts::select_questions(structure, state.total_items);
                let raw = self.call(&stage, reviewer, prompts::REVIEWER_SYSTEM, &prompt).await?;
                let questions = parser::parse_questions(&raw, state.total_items);
                if questions.is_empty() {
                    return Err(StageError::new(stage, "no questions could be parsed from the response"));
                }
                Ok(StageOutput::Questions { raw, questions })
            }
            Cursor::Answer { item } => {
                let question = state.question(item).ok_or_else(|| missing(&stage, "question"))?;
                let revision = state
                    .pending_followup(item)
                    .zip(state.latest_answer(item))
                    .map(|(followup, previous)| (previous, followup));
                let prompt = prompts::answer(&self.document, question, revision);
                let text = self.call(&stage, analyzer, prompts::ANALYZER_SYSTEM, &prompt).await?;
                Ok(StageOutput::Answer(text))
            }
            Cursor::Verify { item } => {
                let question = state.question(item).ok_or_else(|| missing(&stage, "question"))?;
                let answer = state.latest_answer(item).ok_or_else(|| missing(&stage, "answer"))?;
                let prompt = prompts::verify(&self.document, question, answer);
                let raw = self.call(&stage, reviewer, prompts::REVIEWER_SYSTEM, &prompt).await?;
                let verdict = parser::parse_verification(&raw);
                Ok(StageOutput::Verification {
                    raw,
                    accurate: verdict.accurate,
                    followup: verdict.followup,
                })
            }
            Cursor::Integrate => {
                let (model, system) = self.integration_model();
                let prompt = prompts::integrate(&prompts::qa_history(state));
                let text = self.call(&stage, model, system, &prompt).await?;
                Ok(StageOutput::Report(text))
            }
            Cursor::Done => Err(StageError::new(stage, "pipeline is already complete")),
        }
    }
}
