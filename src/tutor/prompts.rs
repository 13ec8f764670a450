//! Instruction texts, the inputs built for each generation, and the fixed
//! messages the tutor posts around them.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Header placed above the generated quiz.
pub const QUIZ_HEADER: &str =
    "**Reading Quiz** — answer with your choices, e.g. `1A 2C 3B 4D 5A`\n\n";

/// Separator and header placed above the generated challenge.
pub const FEYNMAN_HEADER: &str =
    "\n\n---\n\n**Feynman Challenge** — explain it in your own words:\n\n";

/// Posted when an explanation is too short to grade.
pub const EXPLANATION_TOO_SHORT: &str =
    "Give it a real shot — try to explain the concept in a few sentences at least.";

/// File names of the four instructions inside the prompt directory.
pub const QUIZ_PROMPT_FILE: &str = "prompt.md";
pub const GRADE_PROMPT_FILE: &str = "grade_prompt.md";
pub const FEYNMAN_PROMPT_FILE: &str = "feynman_prompt.md";
pub const FEYNMAN_GRADE_PROMPT_FILE: &str = "feynman_grade_prompt.md";

/// The four system instructions, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    /// Transcript → multiple-choice quiz.
    pub quiz: String,
    /// Transcript + quiz + answers → grading.
    pub grade: String,
    /// Transcript → explain-it-back challenge.
    pub feynman: String,
    /// Transcript + challenge + explanation → feedback.
    pub feynman_grade: String,
}

impl PromptSet {
    /// Read all four prompt files from `dir`. Contents are trimmed; a missing
    /// or blank file is an error.
    pub async fn load(dir: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            quiz: read_prompt(dir.join(QUIZ_PROMPT_FILE)).await?,
            grade: read_prompt(dir.join(GRADE_PROMPT_FILE)).await?,
            feynman: read_prompt(dir.join(FEYNMAN_PROMPT_FILE)).await?,
            feynman_grade: read_prompt(dir.join(FEYNMAN_GRADE_PROMPT_FILE)).await?,
        })
    }
}

async fn read_prompt(path: PathBuf) -> Result<String, ConfigError> {
    let display = path.display().to_string();
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
    let text = text.trim();
    if text.is_empty() {
        return Err(ConfigError::EmptyPrompt { path: display });
    }
    Ok(text.to_string())
}

/// Input for grading the multiple-choice answers.
pub fn grading_input(transcript: &str, questions: &str, answers: &str) -> String {
    format!(
        "## Original Transcript\n{transcript}\n\n\
         ## Quiz Questions\n{questions}\n\n\
         ## User's Answers\n{answers}"
    )
}

/// Input for grading the explain-it-back answer.
pub fn explanation_input(transcript: &str, challenge: &str, explanation: &str) -> String {
    format!(
        "## Original Transcript\n{transcript}\n\n\
         ## Concept & Challenge\n{challenge}\n\n\
         ## Student's Explanation\n{explanation}"
    )
}

pub fn quiz_message(questions: &str) -> String {
    format!("{QUIZ_HEADER}{questions}")
}

pub fn challenge_message(challenge: &str) -> String {
    format!("{FEYNMAN_HEADER}{challenge}")
}
