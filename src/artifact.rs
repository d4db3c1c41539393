//! Artifacts and their typed parameter sets.
//!
//! An [`Artifact`] is one generated image or text completion together with the
//! parameters that produced it. Artifacts are never mutated after
//! construction; they are shared as `Arc<Artifact<P>>` and superseded by new
//! ones.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Content type
// ---------------------------------------------------------------------------

/// Which panel an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Image,
    Text,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Image => write!(f, "image"),
            ContentType::Text => write!(f, "text"),
        }
    }
}

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Parameter sets
// ---------------------------------------------------------------------------

/// A typed bag of generation inputs for one content type.
pub trait Parameters:
    Clone + fmt::Debug + PartialEq + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// A single-field edit, the typed form of `setParam(key, value)`.
    type Edit: Clone + fmt::Debug + Send + 'static;

    const CONTENT_TYPE: ContentType;

    fn model(&self) -> &str;

    fn set_model(&mut self, model: String);

    /// The user-facing prompt text.
    fn prompt(&self) -> &str;

    fn apply_edit(&mut self, edit: Self::Edit);

    /// Adjust the parameters so an unedited re-submission still yields a new
    /// result.
    fn prepare_resubmission(&mut self);
}

fn default_image_model() -> String {
    "flux".to_string()
}

fn default_dimension() -> u32 {
    1024
}

fn default_seed() -> u64 {
    42
}

/// Accepts either a JSON list of strings or a single comma-separated string.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(list)) => list,
        Some(OneOrMany::One(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageParameters {
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub enhance: bool,
    /// Suppress the provider logo overlay.
    #[serde(default)]
    pub nologo: bool,
    #[serde(default, alias = "image", deserialize_with = "string_or_list")]
    pub reference_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

impl Default for ImageParameters {
    fn default() -> Self {
        Self {
            model: default_image_model(),
            prompt: String::new(),
            width: default_dimension(),
            height: default_dimension(),
            seed: default_seed(),
            enhance: false,
            nologo: false,
            reference_images: Vec::new(),
            negative_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageEdit {
    Model(String),
    Prompt(String),
    Width(u32),
    Height(u32),
    Seed(u64),
    Enhance(bool),
    Nologo(bool),
    ReferenceImages(Vec<String>),
    NegativePrompt(Option<String>),
}

impl Parameters for ImageParameters {
    type Edit = ImageEdit;

    const CONTENT_TYPE: ContentType = ContentType::Image;

    fn model(&self) -> &str {
        &self.model
    }

    fn set_model(&mut self, model: String) {
        self.model = model;
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn apply_edit(&mut self, edit: ImageEdit) {
        match edit {
            ImageEdit::Model(m) => self.model = m,
            ImageEdit::Prompt(p) => self.prompt = p,
            ImageEdit::Width(w) => self.width = w,
            ImageEdit::Height(h) => self.height = h,
            ImageEdit::Seed(s) => self.seed = s,
            ImageEdit::Enhance(e) => self.enhance = e,
            ImageEdit::Nologo(n) => self.nologo = n,
            ImageEdit::ReferenceImages(urls) => self.reference_images = urls,
            ImageEdit::NegativePrompt(n) => self.negative_prompt = n,
        }
    }

    fn prepare_resubmission(&mut self) {
        self.seed = self.seed.wrapping_add(1);
    }
}

fn default_text_model() -> String {
    "openai".to_string()
}

/// One chat turn in a text generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextParameters {
    #[serde(default = "default_text_model")]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, alias = "max_tokens", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for TextParameters {
    fn default() -> Self {
        Self {
            model: default_text_model(),
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextEdit {
    Model(String),
    /// Rewrites the last user message, appending one if there is none.
    Prompt(String),
    Messages(Vec<ChatMessage>),
    Temperature(Option<f32>),
    MaxTokens(Option<u32>),
    Seed(Option<u64>),
}

impl Parameters for TextParameters {
    type Edit = TextEdit;

    const CONTENT_TYPE: ContentType = ContentType::Text;

    fn model(&self) -> &str {
        &self.model
    }

    fn set_model(&mut self, model: String) {
        self.model = model;
    }

    fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    fn apply_edit(&mut self, edit: TextEdit) {
        match edit {
            TextEdit::Model(m) => self.model = m,
            TextEdit::Prompt(p) => {
                match self.messages.iter_mut().rev().find(|m| m.role == "user") {
                    Some(last) => last.content = p,
                    None => self.messages.push(ChatMessage::user(p)),
                }
            }
            TextEdit::Messages(messages) => self.messages = messages,
            TextEdit::Temperature(t) => self.temperature = t,
            TextEdit::MaxTokens(n) => self.max_tokens = n,
            TextEdit::Seed(s) => self.seed = s,
        }
    }

    // The same message set is simply issued again.
    fn prepare_resubmission(&mut self) {}
}

// ---------------------------------------------------------------------------
// Generation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    /// The requested model is not available to this caller.
    Forbidden,
    /// The backend is throttling this caller.
    RateLimited,
    Failed,
}

/// Why a generation produced no result. Carried inside an error artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl GenerationError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Forbidden, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::RateLimited, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::Failed, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::failed(format!(
            "generation did not finish within {}s",
            after.as_secs_f32()
        ))
    }

    fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            default_message(kind).to_string()
        } else {
            message
        };
        Self {
            kind,
            message,
            error_code: None,
        }
    }

    /// Classify a server error payload.
    ///
    /// `401`/`403` or an error code mentioning "forbidden" map to
    /// [`GenerationErrorKind::Forbidden`]; `429` or a code mentioning "rate"
    /// maps to [`GenerationErrorKind::RateLimited`]; anything else is a
    /// generic failure.
    pub fn from_payload(status: Option<u16>, error_code: Option<String>, message: String) -> Self {
        let code = error_code.as_deref().unwrap_or("").to_ascii_lowercase();
        let kind = if matches!(status, Some(401) | Some(403)) || code.contains("forbidden") {
            GenerationErrorKind::Forbidden
        } else if status == Some(429) || code.contains("rate") {
            GenerationErrorKind::RateLimited
        } else {
            GenerationErrorKind::Failed
        };
        let mut error = Self::new(kind, message);
        error.error_code = error_code;
        error
    }
}

fn default_message(kind: GenerationErrorKind) -> &'static str {
    match kind {
        GenerationErrorKind::Forbidden => "This model is not available for your account.",
        GenerationErrorKind::RateLimited => {
            "Too many requests. Sign in or add a referrer to raise your limit."
        }
        GenerationErrorKind::Failed => "Generation failed.",
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Where an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Decoded from the live feed.
    Stream,
    /// Produced by an on-demand submission.
    Override,
    /// Stand-in used when editing starts before anything has arrived.
    Placeholder,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// Backend load hint: concurrent requests at generation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_hint: Option<u32>,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact<P> {
    pub id: Uuid,
    pub params: P,
    /// Image URL or completion text.
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GenerationError>,
    pub provenance: Provenance,
    pub origin: Origin,
}

impl<P: Parameters> Artifact<P> {
    pub fn from_stream(
        params: P,
        result: Option<String>,
        error: Option<GenerationError>,
        provenance: Provenance,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            params,
            result,
            error,
            provenance,
            origin: Origin::Stream,
        }
    }

    pub fn generated(params: P, result: String) -> Self {
        Self::local(params, Some(result), None, Origin::Override)
    }

    pub fn failed(params: P, error: GenerationError) -> Self {
        Self::local(params, None, Some(error), Origin::Override)
    }

    pub fn placeholder(params: P) -> Self {
        Self::local(params, None, None, Origin::Placeholder)
    }

    fn local(params: P, result: Option<String>, error: Option<GenerationError>, origin: Origin) -> Self {
        Self {
            id: Uuid::new_v4(),
            params,
            result,
            error,
            provenance: Provenance {
                received_at_ms: now_ms(),
                ..Provenance::default()
            },
            origin,
        }
    }

    /// A new artifact identical to this one except for its parameters.
    pub fn with_params(&self, params: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            params,
            result: self.result.clone(),
            error: self.error.clone(),
            provenance: self.provenance.clone(),
            origin: self.origin,
        }
    }

    pub fn content_type(&self) -> ContentType {
        P::CONTENT_TYPE
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        const MAX_PROMPT: usize = 60;
        let prompt = self.params.prompt();
        let prompt = if prompt.chars().count() > MAX_PROMPT {
            let cut: String = prompt.chars().take(MAX_PROMPT).collect();
            format!("{cut}…")
        } else {
            prompt.to_string()
        };
        match (&self.result, &self.error) {
            (_, Some(e)) => format!("[{}] {:?}: {}", self.params.model(), e.kind, e.message),
            (Some(r), None) => format!("[{}] {prompt} -> {r}", self.params.model()),
            (None, None) => format!("[{}] {prompt}", self.params.model()),
        }
    }
}
