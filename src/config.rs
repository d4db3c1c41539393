//! Runtime configuration: endpoints, timeouts and reconnect policy.
//!
//! Values come from [`FeedConfig::default`], optionally overlaid by a TOML
//! file, then by `FEED_SYNC_*` environment variables.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::artifact::ContentType;
use crate::error::{FeedError, Result};

pub const ENV_PREFIX: &str = "FEED_SYNC_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub image_feed_url: String,
    pub text_feed_url: String,
    /// Base URL of the image generation endpoint (`{base}/prompt/...`).
    pub image_base_url: String,
    /// Base URL of the text generation endpoint (`{base}/openai`).
    pub text_base_url: String,
    pub referrer: Option<String>,
    pub connect_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            image_feed_url: "https://image.pollinations.ai/feed".to_string(),
            text_feed_url: "https://text.pollinations.ai/feed".to_string(),
            image_base_url: "https://image.pollinations.ai".to_string(),
            text_base_url: "https://text.pollinations.ai".to_string(),
            referrer: None,
            connect_timeout_ms: 5_000,
            generation_timeout_ms: 60_000,
            reconnect_min_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl FeedConfig {
    /// Defaults, then `path` (if given), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FeedError::Config(e.to_string()))
    }

    /// Overlay `FEED_SYNC_*` variables using `lookup` to read them.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let millis = |name: &str| -> Result<Option<u64>> {
            match var(name) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| FeedError::Config(format!("{ENV_PREFIX}{name}={raw}: {e}"))),
            }
        };

        if let Some(v) = var("IMAGE_FEED_URL") {
            self.image_feed_url = v;
        }
        if let Some(v) = var("TEXT_FEED_URL") {
            self.text_feed_url = v;
        }
        if let Some(v) = var("IMAGE_BASE_URL") {
            self.image_base_url = v;
        }
        if let Some(v) = var("TEXT_BASE_URL") {
            self.text_base_url = v;
        }
        if let Some(v) = var("REFERRER") {
            self.referrer = Some(v).filter(|r| !r.is_empty());
        }
        if let Some(v) = millis("CONNECT_TIMEOUT_MS")? {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = millis("GENERATION_TIMEOUT_MS")? {
            self.generation_timeout_ms = v;
        }
        if let Some(v) = millis("RECONNECT_MIN_MS")? {
            self.reconnect_min_ms = v;
        }
        if let Some(v) = millis("RECONNECT_MAX_MS")? {
            self.reconnect_max_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("image_feed_url", &self.image_feed_url),
            ("text_feed_url", &self.text_feed_url),
            ("image_base_url", &self.image_base_url),
            ("text_base_url", &self.text_base_url),
        ] {
            reqwest::Url::parse(url).map_err(|e| FeedError::Config(format!("{name}: {e}")))?;
        }
        if self.connect_timeout_ms == 0 {
            return Err(FeedError::Config("connect_timeout_ms must be > 0".into()));
        }
        if self.generation_timeout_ms == 0 {
            return Err(FeedError::Config("generation_timeout_ms must be > 0".into()));
        }
        if self.reconnect_min_ms == 0 || self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(FeedError::Config(format!(
                "reconnect window {}..{} ms is invalid",
                self.reconnect_min_ms, self.reconnect_max_ms
            )));
        }
        Ok(())
    }

    // --- builder-style overrides ---

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min_ms = min.as_millis() as u64;
        self.reconnect_max_ms = max.as_millis() as u64;
        self
    }

    // --- accessors ---

    pub fn feed_url(&self, content_type: ContentType) -> &str {
        match content_type {
            ContentType::Image => &self.image_feed_url,
            ContentType::Text => &self.text_feed_url,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_min_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

/// Exponential backoff between feed reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Delay before attempt number `attempt` (1-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.min.saturating_mul(1u32 << exp).min(self.max)
    }

    /// [`delay`](Self::delay) plus up to 20% random jitter, still capped at `max`.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        let spread = (base.as_millis() as u64 / 5).max(1);
        let extra = rand::thread_rng().gen_range(0..spread);
        (base + Duration::from_millis(extra)).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        FeedConfig::default().reconnect_policy()
    }
}
