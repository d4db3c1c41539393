use serde::{Deserialize, Serialize};

use crate::artifact::{ChatMessage, GenerationError};

// -- Feed record types ------------------------------------------------------

/// One record as pushed by the feed endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound = "P: serde::de::DeserializeOwned")]
pub struct FeedRecord<P> {
    pub parameters: P,
    #[serde(default, alias = "imageURL", alias = "response")]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default, alias = "concurrentRequests")]
    pub concurrency_hint: Option<u32>,
}

/// Error payload, either `{ errorCode, message }` or a bare string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireError {
    Detailed {
        #[serde(default, rename = "errorCode", alias = "code")]
        error_code: Option<String>,
        #[serde(default, alias = "error")]
        message: String,
    },
    Plain(String),
}

impl WireError {
    pub fn into_generation_error(self, status: Option<u16>) -> GenerationError {
        match self {
            WireError::Detailed {
                error_code,
                message,
            } => GenerationError::from_payload(status, error_code, message),
            WireError::Plain(message) => GenerationError::from_payload(status, None, message),
        }
    }
}

// -- Text completion types --------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    pub message: CompletionMessage,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionResponse {
    pub choices: Vec<CompletionChoice>,
}

impl CompletionResponse {
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }
}

// -- Model catalog types ----------------------------------------------------

/// Catalog entries come either as bare ids or as objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ModelEntry {
    Id(String),
    Object {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
}
