//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use feed_sync::artifact::{Artifact, ChatMessage, ImageParameters, Provenance, TextParameters};
use feed_sync::generate::{GenerationResult, Generator};
use feed_sync::Parameters;
use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;

/// A generator that records every request and holds each one until the test
/// calls [`GatedGenerator::release`].
pub struct GatedGenerator<P> {
    requests: Mutex<Vec<P>>,
    gate: Semaphore,
    outcome: Mutex<GenerationResult>,
}

impl<P: Parameters> GatedGenerator<P> {
    pub fn new(outcome: GenerationResult) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            outcome: Mutex::new(outcome),
        })
    }

    /// Let one waiting (or future) request finish.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    pub fn set_outcome(&self, outcome: GenerationResult) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn requests(&self) -> Vec<P> {
        self.requests.lock().unwrap().clone()
    }
}

impl<P: Parameters> Generator<P> for GatedGenerator<P> {
    fn generate<'a>(&'a self, params: &'a P) -> BoxFuture<'a, GenerationResult> {
        self.requests.lock().unwrap().push(params.clone());
        Box::pin(async move {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.outcome.lock().unwrap().clone()
        })
    }
}

pub fn image(prompt: &str, seed: u64) -> Artifact<ImageParameters> {
    Artifact::from_stream(
        ImageParameters {
            prompt: prompt.to_string(),
            seed,
            ..ImageParameters::default()
        },
        Some(format!("https://img.example/{prompt}.png")),
        None,
        Provenance::default(),
    )
}

pub fn text(prompt: &str) -> Artifact<TextParameters> {
    Artifact::from_stream(
        TextParameters {
            messages: vec![ChatMessage::user(prompt)],
            ..TextParameters::default()
        },
        Some(format!("reply to {prompt}")),
        None,
        Provenance::default(),
    )
}

/// Let spawned tasks on the current-thread runtime make progress.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
