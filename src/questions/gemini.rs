//! Gemini-powered follow-up questions
//!
//! The model is asked for a JSON array of `{question, options}` objects.
//! Anything malformed is an error; the orchestrator falls back to templates.

use crate::error::InvestigationError;
use crate::gemini::{GeminiClient, AML_SYSTEM_PROMPT};
use crate::models::Question;
use crate::questions::QuestionGenerator;
use crate::Result;
use async_trait::async_trait;
use tracing::debug;

const MAX_QUESTIONS: usize = 5;
const OPTIONS_PER_QUESTION: usize = 4;

pub struct GeminiQuestionGenerator {
    client: GeminiClient,
}

impl GeminiQuestionGenerator {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            client: GeminiClient::new(api_key)?,
        })
    }

    pub fn with_client(client: GeminiClient) -> Self {
        Self { client }
    }

    fn build_prompt(query: &str) -> String {
        format!(
            r#"An analyst opened an investigation with this query:

{}

Ask between 3 and {} multiple-choice follow-up questions that would help decide
which analyses to run (entity research, geographic routing, transaction patterns,
on-chain tracing).

Rules:
- Exactly {} options per question
- Return ONLY valid JSON
- No explanation text
- JSON format:

[
  {{ "question": "...", "options": ["...", "...", "...", "..."] }}
]
"#,
            query, MAX_QUESTIONS, OPTIONS_PER_QUESTION
        )
    }
}

#[async_trait]
impl QuestionGenerator for GeminiQuestionGenerator {
    async fn generate_questions(&self, query: &str) -> Result<Vec<Question>> {
        let prompt = Self::build_prompt(query);
        let response = self.client.generate(&prompt, AML_SYSTEM_PROMPT).await?;
        let questions = parse_questions(&response)?;

        debug!(count = questions.len(), "Gemini questions parsed");
        Ok(questions)
    }
}

/// Parse the model's JSON array, tolerating a ```json fence
pub(crate) fn parse_questions(response: &str) -> Result<Vec<Question>> {
    let cleaned = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let questions: Vec<Question> = serde_json::from_str(cleaned).map_err(|e| {
        InvestigationError::CollaboratorError(format!(
            "Failed to parse Gemini questions: {} | raw={}",
            e, response
        ))
    })?;

    if questions.is_empty() {
        return Err(InvestigationError::CollaboratorError(
            "Gemini returned no questions".to_string(),
        ));
    }

    if let Some(bad) = questions
        .iter()
        .find(|q| q.question.trim().is_empty() || q.options.len() != OPTIONS_PER_QUESTION)
    {
        return Err(InvestigationError::CollaboratorError(format!(
            "Malformed question from Gemini: {:?}",
            bad
        )));
    }

    Ok(questions.into_iter().take(MAX_QUESTIONS).collect())
}
