//! On-demand generation calls.
//!
//! A [`Generator`] turns one parameter set into one result. Failures come back
//! as [`GenerationError`] values so the caller can wrap them in an error
//! artifact instead of propagating them.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::artifact::{GenerationError, ImageParameters, Parameters, TextParameters};
use crate::config::FeedConfig;
use crate::wire::{CompletionRequest, CompletionResponse, WireError};

pub type GenerationResult = std::result::Result<String, GenerationError>;

/// Longest server error body quoted back to the user.
const MAX_ERROR_BODY: usize = 300;

pub trait Generator<P>: Send + Sync + 'static {
    fn generate<'a>(&'a self, params: &'a P) -> BoxFuture<'a, GenerationResult>;
}

/// Generator backed by the public image and text HTTP endpoints.
pub struct HttpGenerator {
    client: reqwest::Client,
    image_base_url: String,
    text_base_url: String,
    referrer: Option<String>,
}

impl HttpGenerator {
    pub fn new(config: &FeedConfig) -> Self {
        // The caller bounds the whole call with its own timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .unwrap_or_default();
        Self {
            client,
            image_base_url: config.image_base_url.trim_end_matches('/').to_string(),
            text_base_url: config.text_base_url.trim_end_matches('/').to_string(),
            referrer: config.referrer.clone(),
        }
    }

    pub fn image_url(&self, params: &ImageParameters) -> GenerationResult {
        image_request_url(&self.image_base_url, params, self.referrer.as_deref())
    }

    pub fn completion_url(&self) -> String {
        format!("{}/openai", self.text_base_url)
    }
}

/// `{base}/prompt/{prompt}?model=..&width=..` for one image request.
pub fn image_request_url(
    base: &str,
    params: &ImageParameters,
    referrer: Option<&str>,
) -> GenerationResult {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| GenerationError::failed(format!("invalid image endpoint {base}: {e}")))?;

    url.path_segments_mut()
        .map_err(|_| GenerationError::failed(format!("image endpoint {base} cannot take a path")))?
        .pop_if_empty()
        .push("prompt")
        .push(&params.prompt);

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("model", &params.model)
            .append_pair("width", &params.width.to_string())
            .append_pair("height", &params.height.to_string())
            .append_pair("seed", &params.seed.to_string());
        if params.enhance {
            query.append_pair("enhance", "true");
        }
        if params.nologo {
            query.append_pair("nologo", "true");
        }
        if !params.reference_images.is_empty() {
            query.append_pair("image", &params.reference_images.join(","));
        }
        if let Some(negative) = params.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
            query.append_pair("negative_prompt", negative);
        }
        if let Some(referrer) = referrer {
            query.append_pair("referrer", referrer);
        }
    }

    Ok(url.to_string())
}

/// Build a [`GenerationError`] from a non-2xx reply body.
pub fn classify_failure(status: u16, body: &str) -> GenerationError {
    match serde_json::from_str::<WireError>(body) {
        Ok(payload) => payload.into_generation_error(Some(status)),
        Err(_) => {
            let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
            GenerationError::from_payload(Some(status), None, message)
        }
    }
}

impl Generator<ImageParameters> for HttpGenerator {
    fn generate<'a>(&'a self, params: &'a ImageParameters) -> BoxFuture<'a, GenerationResult> {
        Box::pin(async move {
            let url = self.image_url(params)?;
            debug!(model = %params.model, seed = params.seed, "requesting image");

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| GenerationError::failed(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_failure(status.as_u16(), &body));
            }
            // The image itself is fetched again by whoever renders the URL.
            Ok(url)
        })
    }
}

impl Generator<TextParameters> for HttpGenerator {
    fn generate<'a>(&'a self, params: &'a TextParameters) -> BoxFuture<'a, GenerationResult> {
        Box::pin(async move {
            let request = CompletionRequest {
                model: &params.model,
                messages: &params.messages,
                temperature: params.temperature,
                max_tokens: params.max_tokens,
                seed: params.seed,
                referrer: self.referrer.as_deref(),
            };
            debug!(model = %params.model, messages = params.messages.len(), "requesting completion");

            let response = self
                .client
                .post(self.completion_url())
                .json(&request)
                .send()
                .await
                .map_err(|e| GenerationError::failed(e.to_string()))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| GenerationError::failed(e.to_string()))?;
            if !status.is_success() {
                return Err(classify_failure(status.as_u16(), &body));
            }

            match serde_json::from_str::<CompletionResponse>(&body) {
                Ok(parsed) => Ok(parsed.first_content().unwrap_or_default().to_string()),
                Err(_) => Ok(body),
            }
        })
    }
}

/// A generator that always answers with the same outcome after `delay`.
///
/// Handy for demos and for driving the controller without a network.
#[derive(Debug, Clone)]
pub struct FixedGenerator {
    outcome: GenerationResult,
    delay: Duration,
}

impl FixedGenerator {
    pub fn succeeding(result: impl Into<String>) -> Self {
        Self {
            outcome: Ok(result.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(error: GenerationError) -> Self {
        Self {
            outcome: Err(error),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl<P: Parameters> Generator<P> for FixedGenerator {
    fn generate<'a>(&'a self, _params: &'a P) -> BoxFuture<'a, GenerationResult> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::GenerationErrorKind;
    use rstest::rstest;

    fn params() -> ImageParameters {
        ImageParameters {
            prompt: "a red fox, snow".into(),
            seed: 43,
            width: 512,
            height: 768,
            ..ImageParameters::default()
        }
    }

    #[test]
    fn test_image_url_encodes_prompt_and_params() {
        let url = image_request_url("https://image.example", &params(), None).unwrap();
        assert!(url.starts_with("https://image.example/prompt/a%20red%20fox,%20snow?"));
        assert!(url.contains("model=flux"));
        assert!(url.contains("width=512"));
        assert!(url.contains("height=768"));
        assert!(url.contains("seed=43"));
        assert!(!url.contains("enhance"));
        assert!(!url.contains("referrer"));
    }

    #[test]
    fn test_image_url_optional_flags() {
        let p = ImageParameters {
            enhance: true,
            nologo: true,
            reference_images: vec!["https://a/1.png".into(), "https://a/2.png".into()],
            ..params()
        };
        let url = image_request_url("https://image.example/", &p, Some("demo")).unwrap();
        assert!(url.contains("enhance=true"));
        assert!(url.contains("nologo=true"));
        assert!(url.contains("image=https%3A%2F%2Fa%2F1.png%2Chttps%3A%2F%2Fa%2F2.png"));
        assert!(url.contains("referrer=demo"));
        assert!(!url.contains("example//prompt"));
    }

    #[test]
    fn test_image_url_bad_base_is_failure() {
        let err = image_request_url("not a url", &params(), None).unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::Failed);
    }

    #[rstest]
    #[case(401, "", GenerationErrorKind::Forbidden)]
    #[case(403, r#"{"errorCode":"FORBIDDEN","message":"tier required"}"#, GenerationErrorKind::Forbidden)]
    #[case(429, r#"{"error":"queue full"}"#, GenerationErrorKind::RateLimited)]
    #[case(500, "<html>oops</html>", GenerationErrorKind::Failed)]
    #[case(400, r#"{"code":"rate_limit","message":"later"}"#, GenerationErrorKind::RateLimited)]
    fn test_classify_failure(#[case] status: u16, #[case] body: &str, #[case] kind: GenerationErrorKind) {
        assert_eq!(classify_failure(status, body).kind, kind);
    }

    #[test]
    fn test_classify_failure_uses_payload_message() {
        let e = classify_failure(403, r#"{"errorCode":"FORBIDDEN","message":"tier required"}"#);
        assert_eq!(e.message, "tier required");
    }

    #[test]
    fn test_classify_failure_truncates_long_body() {
        let body = "x".repeat(5000);
        assert_eq!(classify_failure(502, &body).message.len(), MAX_ERROR_BODY);
    }

    #[test]
    fn test_completion_url() {
        let cfg = FeedConfig {
            text_base_url: "https://text.example/".into(),
            ..FeedConfig::default()
        };
        assert_eq!(HttpGenerator::new(&cfg).completion_url(), "https://text.example/openai");
    }

    #[tokio::test]
    async fn test_fixed_generator_outcomes() {
        let ok = FixedGenerator::succeeding("done");
        assert_eq!(
            Generator::<TextParameters>::generate(&ok, &TextParameters::default()).await,
            Ok("done".to_string())
        );
        let bad = FixedGenerator::failing(GenerationError::rate_limited(""));
        let err = Generator::<ImageParameters>::generate(&bad, &ImageParameters::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::RateLimited);
    }
}
