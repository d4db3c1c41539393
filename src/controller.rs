//! # Stage: OverrideController
//!
//! ## Responsibility
//! Hold the edit-mode working copy of the displayed artifact's parameters,
//! run at most one cancellable generation request at a time, and decide what
//! is displayed.
//!
//! ## Guarantees
//! - Display resolution: live stream while unpaused; otherwise the resolved
//!   submission if any; otherwise the snapshot taken at `enter_edit` with the
//!   working parameters merged on top
//! - A cancelled or superseded submission never reaches the display
//! - Stream events never touch the working parameters
//! - `is_generating` flips to false synchronously on cancel
//!
//! ## NOT Responsible For
//! - Pausing the stream (that is the mode switch)
//! - Building request URLs (that is the generator)

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::artifact::{now_ms, Artifact, GenerationError, Parameters};
use crate::catalog::ModelCatalog;
use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::generate::Generator;
use crate::stream::{StreamHandle, Subscription};

/// Upper bound on one generation request unless configured otherwise.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ControllerOptions {
    pub timeout: Duration,
    /// When set, model ids are resolved against the catalog before submitting.
    pub catalog: Option<Arc<dyn ModelCatalog>>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_GENERATION_TIMEOUT,
            catalog: None,
        }
    }
}

impl ControllerOptions {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            timeout: config.generation_timeout(),
            catalog: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }
}

impl std::fmt::Debug for ControllerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("timeout", &self.timeout)
            .field("catalog", &self.catalog.is_some())
            .finish()
    }
}

struct EditSession<P> {
    /// What was displayed when editing started.
    snapshot: Arc<Artifact<P>>,
    working: P,
    input_changed: bool,
    /// Bumped on every edit; a resolving submission only commits its request
    /// back into `working` if no edit happened since it started.
    revision: u64,
    pending: Option<Arc<Artifact<P>>>,
    /// `snapshot` with `working` merged on top.
    preview: Arc<Artifact<P>>,
}

impl<P: Parameters> EditSession<P> {
    fn new(snapshot: Arc<Artifact<P>>) -> Self {
        Self {
            working: snapshot.params.clone(),
            preview: Arc::clone(&snapshot),
            snapshot,
            input_changed: false,
            revision: 0,
            pending: None,
        }
    }

    fn refresh_preview(&mut self) {
        self.preview = if self.working == self.snapshot.params {
            Arc::clone(&self.snapshot)
        } else {
            Arc::new(self.snapshot.with_params(self.working.clone()))
        };
    }

    fn displayed(&self) -> Arc<Artifact<P>> {
        self.pending
            .as_ref()
            .map_or_else(|| Arc::clone(&self.preview), Arc::clone)
    }
}

struct InFlight {
    token: u64,
    revision: u64,
    task: JoinHandle<()>,
}

struct OverrideState<P> {
    session: Option<EditSession<P>>,
    in_flight: Option<InFlight>,
    next_token: u64,
    last_submitted_at: Option<u64>,
}

struct Inner<P> {
    stream: StreamHandle<P>,
    generator: Arc<dyn Generator<P>>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    timeout: Duration,
    state: Mutex<OverrideState<P>>,
    display: watch::Sender<Option<Arc<Artifact<P>>>>,
    generating: watch::Sender<bool>,
    _subscription: Subscription,
}

/// Cheap to clone; all clones drive the same controller.
pub struct OverrideController<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for OverrideController<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Parameters> OverrideController<P> {
    pub fn new(
        stream: StreamHandle<P>,
        generator: Arc<dyn Generator<P>>,
        options: ControllerOptions,
    ) -> Self {
        let initial = if stream.is_paused() {
            None
        } else {
            stream.latest()
        };

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<P>>| {
            let weak = weak.clone();
            let subscription = stream.on_artifact(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.sync_display();
                }
            });
            Inner {
                stream,
                generator,
                catalog: options.catalog,
                timeout: options.timeout,
                state: Mutex::new(OverrideState {
                    session: None,
                    in_flight: None,
                    next_token: 0,
                    last_submitted_at: None,
                }),
                display: watch::Sender::new(initial),
                generating: watch::Sender::new(false),
                _subscription: subscription,
            }
        });

        Self { inner }
    }

    /// Start (or restart) editing from `current`, normally the artifact on
    /// display. Any in-flight submission is cancelled.
    pub fn enter_edit(&self, current: Option<Arc<Artifact<P>>>) {
        let snapshot =
            current.unwrap_or_else(|| Arc::new(Artifact::placeholder(P::default())));
        let mut state = self.inner.lock_state();
        self.inner.cancel_locked(&mut state);
        debug!(content_type = %P::CONTENT_TYPE, prompt = snapshot.params.prompt(), "entering edit");
        state.session = Some(EditSession::new(snapshot));
        self.inner.publish_locked(&state);
    }

    /// Apply one field edit to the working parameters.
    pub fn set_param(&self, edit: P::Edit) -> Result<()> {
        let mut state = self.inner.lock_state();
        let session = state
            .session
            .as_mut()
            .ok_or(FeedError::NotEditing { operation: "set_param" })?;
        session.working.apply_edit(edit);
        session.input_changed = true;
        session.revision += 1;
        session.refresh_preview();
        self.inner.publish_locked(&state);
        Ok(())
    }

    /// Issue one generation request from the working parameters, cancelling
    /// any request already outstanding. Must be called within a tokio runtime.
    ///
    /// With no edits since the last submission the parameters are first
    /// adjusted by [`Parameters::prepare_resubmission`].
    pub fn submit(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        inner.cancel_locked(&mut state);

        let session = state
            .session
            .as_ref()
            .ok_or(FeedError::NotEditing { operation: "submit" })?;
        let mut request = session.working.clone();
        if !session.input_changed {
            request.prepare_resubmission();
        }
        let revision = session.revision;

        let token = state.next_token;
        state.next_token += 1;
        state.last_submitted_at = Some(now_ms());

        info!(
            content_type = %P::CONTENT_TYPE,
            token,
            model = request.model(),
            prompt = request.prompt(),
            "submitting generation"
        );

        let task = tokio::spawn(run_submission(
            Arc::downgrade(inner),
            Arc::clone(&inner.generator),
            inner.catalog.clone(),
            inner.timeout,
            token,
            request,
        ));
        state.in_flight = Some(InFlight {
            token,
            revision,
            task,
        });
        inner.generating.send_replace(true);
        Ok(())
    }

    /// Abort the outstanding request, if any. Returns whether one was running.
    /// The displayed artifact is left as it was.
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.lock_state();
        self.inner.cancel_locked(&mut state)
    }

    /// The generate button: cancel while generating, otherwise submit.
    /// Returns `true` when a submission was started.
    pub fn toggle_generate(&self) -> Result<bool> {
        if self.cancel() {
            return Ok(false);
        }
        self.submit()?;
        Ok(true)
    }

    /// Discard the working parameters and any resolved submission.
    pub fn exit_edit(&self) {
        let mut state = self.inner.lock_state();
        self.inner.cancel_locked(&mut state);
        if state.session.take().is_some() {
            debug!(content_type = %P::CONTENT_TYPE, "leaving edit");
        }
        self.inner.publish_locked(&state);
    }

    /// Recompute the displayed artifact; call after changing the stream's
    /// pause state.
    pub fn sync_display(&self) {
        self.inner.sync_display();
    }

    pub fn displayed(&self) -> Option<Arc<Artifact<P>>> {
        self.inner.display.borrow().clone()
    }

    pub fn subscribe_display(&self) -> watch::Receiver<Option<Arc<Artifact<P>>>> {
        self.inner.display.subscribe()
    }

    pub fn is_generating(&self) -> bool {
        *self.inner.generating.borrow()
    }

    pub fn subscribe_generating(&self) -> watch::Receiver<bool> {
        self.inner.generating.subscribe()
    }

    /// Resolves once no submission is outstanding.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.generating.subscribe();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|generating| !*generating).await;
    }

    pub fn is_editing(&self) -> bool {
        self.inner.lock_state().session.is_some()
    }

    pub fn input_changed(&self) -> bool {
        self.inner
            .lock_state()
            .session
            .as_ref()
            .is_some_and(|s| s.input_changed)
    }

    pub fn working_params(&self) -> Option<P> {
        self.inner
            .lock_state()
            .session
            .as_ref()
            .map(|s| s.working.clone())
    }

    pub fn pending(&self) -> Option<Arc<Artifact<P>>> {
        self.inner
            .lock_state()
            .session
            .as_ref()
            .and_then(|s| s.pending.clone())
    }

    /// Epoch milliseconds of the most recent `submit`.
    pub fn last_submitted_at(&self) -> Option<u64> {
        self.inner.lock_state().last_submitted_at
    }

    pub fn stream(&self) -> &StreamHandle<P> {
        &self.inner.stream
    }
}

impl<P: Parameters> Inner<P> {
    fn lock_state(&self) -> MutexGuard<'_, OverrideState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_locked(&self, state: &mut OverrideState<P>) -> bool {
        match state.in_flight.take() {
            Some(flight) => {
                flight.task.abort();
                self.generating.send_replace(false);
                info!(content_type = %P::CONTENT_TYPE, token = flight.token, "generation cancelled");
                true
            }
            None => false,
        }
    }

    fn effective_display(&self, state: &OverrideState<P>) -> Option<Arc<Artifact<P>>> {
        if !self.stream.is_paused() {
            return self.stream.latest();
        }
        match &state.session {
            Some(session) => Some(session.displayed()),
            // Paused outside an edit session: stay frozen.
            None => self.display.borrow().clone(),
        }
    }

    fn publish_locked(&self, state: &OverrideState<P>) {
        let next = self.effective_display(state);
        self.display.send_if_modified(|current| {
            let same = match (current.as_ref(), next.as_ref()) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            };
            if !same {
                *current = next;
            }
            !same
        });
    }

    fn sync_display(&self) {
        let state = self.lock_state();
        self.publish_locked(&state);
    }

    fn resolve(&self, token: u64, request: P, artifact: Artifact<P>) {
        let mut state = self.lock_state();
        let flight = match state.in_flight.take() {
            Some(flight) if flight.token == token => flight,
            other => {
                state.in_flight = other;
                debug!(content_type = %P::CONTENT_TYPE, token, "discarding stale generation result");
                return;
            }
        };

        match &artifact.error {
            Some(e) => warn!(
                content_type = %P::CONTENT_TYPE,
                token,
                kind = ?e.kind,
                error = %e,
                "generation failed"
            ),
            None => info!(content_type = %P::CONTENT_TYPE, token, "generation finished"),
        }

        if let Some(session) = state.session.as_mut() {
            if session.revision == flight.revision {
                session.working = request;
                session.input_changed = false;
                session.refresh_preview();
            }
            session.pending = Some(Arc::new(artifact));
        }
        self.generating.send_replace(false);
        self.publish_locked(&state);
    }
}

impl<P> Drop for Inner<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = state.in_flight.take() {
            flight.task.abort();
        }
    }
}

async fn run_submission<P: Parameters>(
    inner: Weak<Inner<P>>,
    generator: Arc<dyn Generator<P>>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    timeout: Duration,
    token: u64,
    mut request: P,
) {
    let outcome = tokio::time::timeout(timeout, async {
        if let Some(catalog) = catalog.as_deref() {
            resolve_model_id(catalog, &mut request).await;
        }
        generator.generate(&request).await
    })
    .await;

    let artifact = match outcome {
        Ok(Ok(result)) => Artifact::generated(request.clone(), result),
        Ok(Err(error)) => Artifact::failed(request.clone(), error),
        Err(_) => Artifact::failed(request.clone(), GenerationError::timeout(timeout)),
    };

    if let Some(inner) = inner.upgrade() {
        inner.resolve(token, request, artifact);
    }
}

async fn resolve_model_id<P: Parameters>(catalog: &dyn ModelCatalog, request: &mut P) {
    match catalog.resolve(P::CONTENT_TYPE, request.model()).await {
        Ok(Some(model)) => {
            if model.id != request.model() {
                debug!(from = request.model(), to = %model.id, "resolved model by name");
                request.set_model(model.id);
            }
        }
        Ok(None) => debug!(model = request.model(), "model not in catalog, keeping as-is"),
        Err(e) => debug!(error = %e, "model catalog unavailable, keeping model as-is"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{
        ContentType, GenerationErrorKind, ImageEdit, ImageParameters, Origin, Provenance,
    };
    use crate::catalog::{ModelInfo, StaticCatalog};
    use crate::generate::FixedGenerator;
    use crate::stream::StreamSource;

    fn streamed(prompt: &str, seed: u64) -> Artifact<ImageParameters> {
        Artifact::from_stream(
            ImageParameters {
                prompt: prompt.into(),
                seed,
                ..ImageParameters::default()
            },
            Some(format!("https://img/{prompt}")),
            None,
            Provenance::default(),
        )
    }

    fn controller(
        generator: FixedGenerator,
    ) -> (StreamHandle<ImageParameters>, OverrideController<ImageParameters>) {
        let stream = StreamSource::detached();
        let controller = OverrideController::new(
            Arc::clone(&stream),
            Arc::new(generator),
            ControllerOptions::default(),
        );
        (stream, controller)
    }

    fn edit(stream: &StreamHandle<ImageParameters>, c: &OverrideController<ImageParameters>) {
        stream.pause(true);
        c.enter_edit(c.displayed());
    }

    #[test]
    fn test_display_follows_stream_when_live() {
        let (stream, c) = controller(FixedGenerator::succeeding("x"));
        stream.ingest(streamed("a", 1));
        assert_eq!(c.displayed().unwrap().params.prompt, "a");
    }

    #[test]
    fn test_initial_display_is_latest() {
        let stream = StreamSource::<ImageParameters>::detached();
        stream.ingest(streamed("early", 1));
        let c = OverrideController::new(
            Arc::clone(&stream),
            Arc::new(FixedGenerator::succeeding("x")),
            ControllerOptions::default(),
        );
        assert_eq!(c.displayed().unwrap().params.prompt, "early");
    }

    #[test]
    fn test_paused_display_ignores_stream() {
        let (stream, c) = controller(FixedGenerator::succeeding("x"));
        stream.ingest(streamed("a", 1));
        edit(&stream, &c);
        stream.ingest(streamed("b", 2));
        assert_eq!(c.displayed().unwrap().params.prompt, "a");
    }

    #[test]
    fn test_enter_edit_seeds_working_params() {
        let (stream, c) = controller(FixedGenerator::succeeding("x"));
        stream.ingest(streamed("a", 9));
        edit(&stream, &c);
        assert_eq!(c.working_params().unwrap().seed, 9);
        assert!(!c.input_changed());
    }

    #[test]
    fn test_enter_edit_without_artifact_uses_placeholder() {
        let (stream, c) = controller(FixedGenerator::succeeding("x"));
        edit(&stream, &c);
        let shown = c.displayed().unwrap();
        assert_eq!(shown.origin, Origin::Placeholder);
        assert_eq!(shown.params, ImageParameters::default());
    }

    #[test]
    fn test_set_param_outside_edit_is_error() {
        let (_stream, c) = controller(FixedGenerator::succeeding("x"));
        let err = c.set_param(ImageEdit::Seed(1)).unwrap_err();
        assert!(matches!(err, FeedError::NotEditing { operation: "set_param" }));
    }

    #[test]
    fn test_submit_outside_edit_is_error() {
        let (_stream, c) = controller(FixedGenerator::succeeding("x"));
        assert!(matches!(c.submit(), Err(FeedError::NotEditing { .. })));
        assert!(!c.is_generating());
    }

    #[test]
    fn test_edits_preview_on_snapshot() {
        let (stream, c) = controller(FixedGenerator::succeeding("x"));
        stream.ingest(streamed("a", 1));
        edit(&stream, &c);
        c.set_param(ImageEdit::Prompt("typed".into())).unwrap();
        let shown = c.displayed().unwrap();
        assert_eq!(shown.params.prompt, "typed");
        assert_eq!(shown.result.as_deref(), Some("https://img/a"));
        assert!(c.input_changed());
    }

    #[test]
    fn test_reverting_edit_restores_snapshot_identity() {
        let (stream, c) = controller(FixedGenerator::succeeding("x"));
        stream.ingest(streamed("a", 1));
        let before = c.displayed().unwrap();
        edit(&stream, &c);
        c.set_param(ImageEdit::Prompt("typed".into())).unwrap();
        c.set_param(ImageEdit::Prompt("a".into())).unwrap();
        assert!(Arc::ptr_eq(&c.displayed().unwrap(), &before));
    }

    #[tokio::test]
    async fn test_submit_resolves_to_pending() {
        let (stream, c) = controller(FixedGenerator::succeeding("https://img/new"));
        stream.ingest(streamed("a", 1));
        edit(&stream, &c);
        c.set_param(ImageEdit::Prompt("b".into())).unwrap();
        c.submit().unwrap();
        assert!(c.is_generating());
        assert!(c.last_submitted_at().is_some());
        c.wait_idle().await;
        let shown = c.displayed().unwrap();
        assert_eq!(shown.origin, Origin::Override);
        assert_eq!(shown.result.as_deref(), Some("https://img/new"));
        assert_eq!(shown.params.prompt, "b");
        assert!(!c.input_changed());
    }

    #[tokio::test]
    async fn test_unedited_submits_step_seed_each_time() {
        let (stream, c) = controller(FixedGenerator::succeeding("r"));
        stream.ingest(streamed("a", 10));
        edit(&stream, &c);
        c.submit().unwrap();
        c.wait_idle().await;
        assert_eq!(c.pending().unwrap().params.seed, 11);
        c.submit().unwrap();
        c.wait_idle().await;
        assert_eq!(c.pending().unwrap().params.seed, 12);
    }

    #[tokio::test]
    async fn test_failed_submission_surfaces_error_artifact() {
        let (stream, c) = controller(FixedGenerator::failing(GenerationError::forbidden("tier")));
        stream.ingest(streamed("a", 1));
        edit(&stream, &c);
        c.submit().unwrap();
        c.wait_idle().await;
        let shown = c.displayed().unwrap();
        assert_eq!(shown.error.as_ref().unwrap().kind, GenerationErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed_artifact() {
        let stream = StreamSource::<ImageParameters>::detached();
        let c = OverrideController::new(
            Arc::clone(&stream),
            Arc::new(FixedGenerator::succeeding("late").with_delay(Duration::from_secs(3600))),
            ControllerOptions::default().with_timeout(Duration::from_millis(20)),
        );
        edit(&stream, &c);
        c.submit().unwrap();
        c.wait_idle().await;
        let err = c.displayed().unwrap().error.clone().unwrap();
        assert_eq!(err.kind, GenerationErrorKind::Failed);
        assert!(err.message.contains("did not finish"));
    }

    #[tokio::test]
    async fn test_cancel_is_synchronous_and_keeps_display() {
        let (stream, c) = controller(
            FixedGenerator::succeeding("never").with_delay(Duration::from_secs(3600)),
        );
        stream.ingest(streamed("a", 1));
        edit(&stream, &c);
        let before = c.displayed().unwrap();
        c.submit().unwrap();
        assert!(c.cancel());
        assert!(!c.is_generating());
        assert!(Arc::ptr_eq(&c.displayed().unwrap(), &before));
        assert!(!c.cancel());
    }

    #[tokio::test]
    async fn test_toggle_generate_cancels_when_running() {
        let (stream, c) = controller(
            FixedGenerator::succeeding("never").with_delay(Duration::from_secs(3600)),
        );
        edit(&stream, &c);
        assert!(c.toggle_generate().unwrap());
        assert!(c.is_generating());
        assert!(!c.toggle_generate().unwrap());
        assert!(!c.is_generating());
    }

    #[tokio::test]
    async fn test_edit_during_flight_is_not_overwritten() {
        let (stream, c) = controller(FixedGenerator::succeeding("r"));
        stream.ingest(streamed("a", 1));
        edit(&stream, &c);
        c.submit().unwrap();
        c.set_param(ImageEdit::Prompt("newer".into())).unwrap();
        c.wait_idle().await;
        let working = c.working_params().unwrap();
        assert_eq!(working.prompt, "newer");
        assert_eq!(working.seed, 1);
        assert!(c.input_changed());
    }

    #[tokio::test]
    async fn test_exit_edit_discards_pending() {
        let (stream, c) = controller(FixedGenerator::succeeding("r"));
        stream.ingest(streamed("a", 1));
        edit(&stream, &c);
        c.submit().unwrap();
        c.wait_idle().await;
        c.exit_edit();
        assert!(c.pending().is_none());
        assert!(c.working_params().is_none());
        stream.pause(false);
        c.sync_display();
        assert_eq!(c.displayed().unwrap().params.prompt, "a");
    }

    #[tokio::test]
    async fn test_catalog_resolves_model_name() {
        let stream = StreamSource::<ImageParameters>::detached();
        let catalog = StaticCatalog::new()
            .with_models(ContentType::Image, vec![ModelInfo::new("flux", "Flux Schnell")]);
        let c = OverrideController::new(
            Arc::clone(&stream),
            Arc::new(FixedGenerator::succeeding("r")),
            ControllerOptions::default().with_catalog(Arc::new(catalog)),
        );
        edit(&stream, &c);
        c.set_param(ImageEdit::Model("FLUX SCHNELL".into())).unwrap();
        c.submit().unwrap();
        c.wait_idle().await;
        assert_eq!(c.pending().unwrap().params.model, "flux");
    }
}
