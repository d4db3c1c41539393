//! # Stage: StreamSource
//!
//! ## Responsibility
//! Maintains the long-lived push connection for one content type, decodes
//! inbound events into artifacts and publishes the latest one.
//!
//! ## Guarantees
//! - Every decoded artifact reaches every `on_artifact` subscriber, in
//!   arrival order, whether or not the source is paused
//! - `paused` belongs to one handle and only gates that handle's live channel;
//!   `latest` always moves
//! - Reconnects never reset `latest`, `paused` or the subscriber list
//! - Malformed records are dropped with a `warn` diagnostic
//!
//! ## NOT Responsible For
//! - Deciding what is displayed while editing (that is the override controller)
//! - Counting arrivals (that is the arrival counter)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::StreamExt;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, ContentType, ImageParameters, Parameters, TextParameters};
use crate::config::{FeedConfig, ReconnectPolicy};
use crate::decode::{decode_record, SseDecoder, SseFrame};
use crate::error::{FeedError, Result};
use crate::transport::{Connector, HttpConnector};

/// Failures in a row before reconnect diagnostics escalate to `error`.
const ESCALATE_AFTER: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Error,
}

type Callback<P> = Arc<dyn Fn(&Arc<Artifact<P>>) + Send + Sync>;

/// Keeps a subscription alive; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Shared connection state
// ---------------------------------------------------------------------------

struct Shared<P> {
    latest: watch::Sender<Option<Arc<Artifact<P>>>>,
    status: watch::Sender<ConnectionStatus>,
    subscribers: Mutex<Vec<(u64, Callback<P>)>>,
    next_subscriber: AtomicU64,
    views: Mutex<Vec<Weak<View<P>>>>,
    dropped: AtomicU64,
}

impl<P: Parameters> Shared<P> {
    fn new() -> Self {
        Self {
            latest: watch::Sender::new(None),
            status: watch::Sender::new(ConnectionStatus::Connecting),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            views: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    fn ingest(&self, artifact: Artifact<P>) -> Arc<Artifact<P>> {
        let artifact = Arc::new(artifact);
        self.latest.send_replace(Some(Arc::clone(&artifact)));

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback<P>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&artifact);
        }

        let views: Vec<Arc<View<P>>> = {
            let mut views = self.views.lock().unwrap_or_else(PoisonError::into_inner);
            views.retain(|v| v.strong_count() > 0);
            views.iter().filter_map(Weak::upgrade).collect()
        };
        for view in views {
            if !*view.paused.borrow() {
                view.live.send_replace(Some(Arc::clone(&artifact)));
            }
        }
        artifact
    }

    /// Returns `true` when the frame produced an artifact.
    fn dispatch_frame(&self, frame: &SseFrame) -> bool {
        match decode_record::<P>(&frame.data) {
            Ok(Some(artifact)) => {
                self.ingest(artifact);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    content_type = %P::CONTENT_TYPE,
                    error = %e,
                    "dropping malformed feed record"
                );
                false
            }
        }
    }
}

/// One decoder and connection task; aborted when the last handle goes.
struct Connection<P> {
    shared: Arc<Shared<P>>,
    task: Option<JoinHandle<()>>,
}

impl<P: Parameters> Connection<P> {
    fn detached() -> Arc<Self> {
        let shared = Arc::new(Shared::new());
        shared.status.send_replace(ConnectionStatus::Open);
        Arc::new(Self { shared, task: None })
    }

    fn spawn(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Arc<Self> {
        let shared = Arc::new(Shared::new());
        let task = tokio::spawn(run_connection(Arc::clone(&shared), connector, policy));
        Arc::new(Self {
            shared,
            task: Some(task),
        })
    }
}

impl<P> Drop for Connection<P> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Pause state owned by a single handle.
struct View<P> {
    paused: watch::Sender<bool>,
    live: watch::Sender<Option<Arc<Artifact<P>>>>,
}

// ---------------------------------------------------------------------------
// StreamSource
// ---------------------------------------------------------------------------

/// One consumer's view of the live feed for a content type.
///
/// Handles made with [`subscribe`](Self::subscribe) or handed out by a
/// [`FeedHub`] share the connection, `latest` and the arrival subscribers,
/// but each has its own pause flag and live channel. The connection task
/// stops when the last handle is dropped.
pub struct StreamSource<P> {
    connection: Arc<Connection<P>>,
    view: Arc<View<P>>,
}

pub type StreamHandle<P> = Arc<StreamSource<P>>;

impl<P: Parameters> StreamSource<P> {
    /// A source with no connection; artifacts arrive only through
    /// [`ingest`](Self::ingest).
    pub fn detached() -> StreamHandle<P> {
        Self::attach(Connection::detached())
    }

    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn connect(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> StreamHandle<P> {
        Self::attach(Connection::spawn(connector, policy))
    }

    /// Another unpaused handle on the same connection.
    pub fn subscribe(&self) -> StreamHandle<P> {
        Self::attach(Arc::clone(&self.connection))
    }

    fn attach(connection: Arc<Connection<P>>) -> StreamHandle<P> {
        let view = Arc::new(View {
            paused: watch::Sender::new(false),
            live: watch::Sender::new(connection.shared.latest.borrow().clone()),
        });
        connection
            .shared
            .views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&view));
        Arc::new(Self { connection, view })
    }

    fn shared(&self) -> &Shared<P> {
        &self.connection.shared
    }

    /// Whether `other` reads from the same connection.
    pub fn shares_connection(&self, other: &StreamSource<P>) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }

    pub fn content_type(&self) -> ContentType {
        P::CONTENT_TYPE
    }

    /// Feed one artifact through the connection as if it had been decoded.
    /// Every handle on the connection sees it.
    pub fn ingest(&self, artifact: Artifact<P>) -> Arc<Artifact<P>> {
        self.shared().ingest(artifact)
    }

    pub fn latest(&self) -> Option<Arc<Artifact<P>>> {
        self.shared().latest.borrow().clone()
    }

    pub fn is_paused(&self) -> bool {
        *self.view.paused.borrow()
    }

    /// Stop or resume propagating arrivals to this handle's live channel.
    /// Decoding, `latest` and `on_artifact` delivery continue either way, and
    /// other handles are unaffected.
    pub fn pause(&self, paused: bool) {
        let was = self.view.paused.send_replace(paused);
        if was && !paused {
            self.view.live.send_replace(self.latest());
        }
        if was != paused {
            debug!(content_type = %P::CONTENT_TYPE, paused, "feed pause changed");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared().status.borrow()
    }

    /// Records dropped as malformed since the connection was created.
    pub fn dropped_records(&self) -> u64 {
        self.shared().dropped.load(Ordering::Relaxed)
    }

    /// Call `callback` for every decoded artifact, paused or not.
    pub fn on_artifact<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<Artifact<P>>) + Send + Sync + 'static,
    {
        let shared = &self.connection.shared;
        let id = shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));

        let weak: Weak<Shared<P>> = Arc::downgrade(shared);
        Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared
                    .subscribers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(sid, _)| *sid != id);
            }
        })
    }

    /// Arrival subscribers across every handle on the connection.
    pub fn subscriber_count(&self) -> usize {
        self.shared()
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscribe_latest(&self) -> watch::Receiver<Option<Arc<Artifact<P>>>> {
        self.shared().latest.subscribe()
    }

    /// Updates only while this handle is not paused; refreshed with `latest`
    /// on resume.
    pub fn subscribe_live(&self) -> watch::Receiver<Option<Arc<Artifact<P>>>> {
        self.view.live.subscribe()
    }

    pub fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.view.paused.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared().status.subscribe()
    }
}

/// Connect, read until the session ends, back off, repeat.
async fn run_connection<P: Parameters>(
    shared: Arc<Shared<P>>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
) {
    let content_type = P::CONTENT_TYPE;
    let mut consecutive_failures: u32 = 0;

    loop {
        shared.status.send_replace(ConnectionStatus::Connecting);

        let outcome = match connector.connect().await {
            Ok(mut bytes) => {
                shared.status.send_replace(ConnectionStatus::Open);
                consecutive_failures = 0;
                info!(%content_type, source = %connector.describe(), "feed connected");

                let mut decoder = SseDecoder::new();
                let ended = loop {
                    match bytes.next().await {
                        Some(Ok(chunk)) => match decoder.push(&chunk) {
                            Ok(frames) => {
                                for frame in frames {
                                    shared.dispatch_frame(&frame);
                                }
                            }
                            Err(e) => {
                                shared.dropped.fetch_add(1, Ordering::Relaxed);
                                break Err(FeedError::decode(content_type, e));
                            }
                        },
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    }
                };
                if let Some(frame) = decoder.finish() {
                    shared.dispatch_frame(&frame);
                }
                ended
            }
            Err(e) => Err(e),
        };

        shared.status.send_replace(ConnectionStatus::Error);
        consecutive_failures = consecutive_failures.saturating_add(1);
        report_disconnect(content_type, &connector.describe(), outcome, consecutive_failures);

        tokio::time::sleep(policy.jittered(consecutive_failures)).await;
    }
}

fn report_disconnect(
    content_type: ContentType,
    source: &str,
    outcome: Result<()>,
    consecutive_failures: u32,
) {
    match outcome {
        Ok(()) => info!(%content_type, %source, "feed closed by server, reconnecting"),
        Err(e) if consecutive_failures >= ESCALATE_AFTER => error!(
            %content_type,
            %source,
            error = %e,
            consecutive_failures,
            "feed connection failed repeatedly, will keep retrying"
        ),
        Err(e) => warn!(
            %content_type,
            %source,
            error = %e,
            "feed connection lost, reconnecting"
        ),
    }
}

// ---------------------------------------------------------------------------
// FeedHub: one connection per content type, shared by every consumer
// ---------------------------------------------------------------------------

type ConnectorFactory = Arc<dyn Fn(ContentType) -> Arc<dyn Connector> + Send + Sync>;

static GLOBAL_HUB: OnceCell<FeedHub> = OnceCell::new();

/// Process-wide registry of feed connections.
///
/// The first `open` for a content type connects and later ones share that
/// connection. Every `open` returns a fresh handle with its own pause flag.
/// The connection closes when the last handle is dropped.
pub struct FeedHub {
    config: FeedConfig,
    factory: ConnectorFactory,
    image: Mutex<Weak<Connection<ImageParameters>>>,
    text: Mutex<Weak<Connection<TextParameters>>>,
}

impl FeedHub {
    pub fn new(config: FeedConfig) -> Self {
        let http_config = config.clone();
        Self::with_connector_factory(config, move |content_type| {
            Arc::new(HttpConnector::new(
                content_type,
                http_config.feed_url(content_type),
                http_config.connect_timeout(),
            )) as Arc<dyn Connector>
        })
    }

    pub fn with_connector_factory<F>(config: FeedConfig, factory: F) -> Self
    where
        F: Fn(ContentType) -> Arc<dyn Connector> + Send + Sync + 'static,
    {
        Self {
            config,
            factory: Arc::new(factory),
            image: Mutex::new(Weak::new()),
            text: Mutex::new(Weak::new()),
        }
    }

    /// Install the process-wide hub. Fails if one is already installed.
    pub fn install(config: FeedConfig) -> Result<&'static FeedHub> {
        let mut installed = false;
        let hub = GLOBAL_HUB.get_or_init(|| {
            installed = true;
            FeedHub::new(config)
        });
        if installed {
            Ok(hub)
        } else {
            Err(FeedError::Config("feed hub already installed".into()))
        }
    }

    /// The process-wide hub, created from the environment on first use.
    pub fn global() -> &'static FeedHub {
        GLOBAL_HUB.get_or_init(|| {
            let config = FeedConfig::load(None).unwrap_or_else(|e| {
                warn!(error = %e, "invalid feed configuration in environment, using defaults");
                FeedConfig::default()
            });
            FeedHub::new(config)
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn image(&self) -> StreamHandle<ImageParameters> {
        self.acquire(&self.image)
    }

    pub fn text(&self) -> StreamHandle<TextParameters> {
        self.acquire(&self.text)
    }

    pub fn open<P: HubStream>(&self) -> StreamHandle<P> {
        P::from_hub(self)
    }

    /// Whether a connection for `content_type` is currently held open.
    pub fn is_open(&self, content_type: ContentType) -> bool {
        match content_type {
            ContentType::Image => lock_slot(&self.image).strong_count() > 0,
            ContentType::Text => lock_slot(&self.text).strong_count() > 0,
        }
    }

    fn acquire<P: Parameters>(&self, slot: &Mutex<Weak<Connection<P>>>) -> StreamHandle<P> {
        let mut slot = lock_slot(slot);
        let connection = match slot.upgrade() {
            Some(existing) => existing,
            None => {
                info!(content_type = %P::CONTENT_TYPE, "opening shared feed connection");
                let connection = Connection::spawn(
                    (self.factory)(P::CONTENT_TYPE),
                    self.config.reconnect_policy(),
                );
                *slot = Arc::downgrade(&connection);
                connection
            }
        };
        StreamSource::attach(connection)
    }
}

fn lock_slot<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parameter sets that have a slot in the [`FeedHub`].
pub trait HubStream: Parameters {
    fn from_hub(hub: &FeedHub) -> StreamHandle<Self>;
}

impl HubStream for ImageParameters {
    fn from_hub(hub: &FeedHub) -> StreamHandle<Self> {
        hub.image()
    }
}

impl HubStream for TextParameters {
    fn from_hub(hub: &FeedHub) -> StreamHandle<Self> {
        hub.text()
    }
}
