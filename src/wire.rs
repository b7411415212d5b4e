//! `generateContent` request/response bodies.
//!
//! only the fields this crate reads or writes are modeled; unknown response
//! fields are ignored by serde.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TEMPERATURE: f64 = 1.0;
pub const TOP_P: f64 = 0.95;
pub const TOP_K: u32 = 40;
pub const MAX_OUTPUT_TOKENS: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

impl GenerateContentRequest {
    /// a single user turn; prior history is never sent.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part { text: Some(text.into()) }],
            }],
            generation_config: GenerationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: TEMPERATURE,
            top_p: TOP_P,
            top_k: TOP_K,
            max_output_tokens: MAX_OUTPUT_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

/// a 200 response whose body is not the shape we expect.
#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("no candidates in response{}", reason_suffix(.block_reason))]
    NoCandidates { block_reason: Option<String> },
    #[error("candidate has no content{}", reason_suffix(.finish_reason))]
    NoContent { finish_reason: Option<String> },
    #[error("first content part has no text")]
    NoText,
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
}

/// `candidates[0].content.parts[0].text`, checked at every step.
pub fn extract_reply(body: &str) -> Result<String, ShapeError> {
    let resp: GenerateContentResponse = serde_json::from_str(body)?;
    let Some(candidate) = resp.candidates.into_iter().next() else {
        return Err(ShapeError::NoCandidates {
            block_reason: resp.prompt_feedback.and_then(|f| f.block_reason),
        });
    };
    let part = candidate
        .content
        .and_then(|c| c.parts.into_iter().next())
        .ok_or(ShapeError::NoContent { finish_reason: candidate.finish_reason })?;
    part.text.ok_or(ShapeError::NoText)
}
