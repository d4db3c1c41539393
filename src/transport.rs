//! Push-channel connectors.
//!
//! A [`Connector`] opens one session of the feed and hands back its raw byte
//! stream. Reconnection is the caller's business; a connector only knows how
//! to open a fresh session.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::artifact::ContentType;
use crate::error::{FeedError, Result};

/// Raw body chunks of one feed session.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

pub trait Connector: Send + Sync + 'static {
    fn content_type(&self) -> ContentType;

    /// Open a new session.
    fn connect(&self) -> BoxFuture<'_, Result<ByteStream>>;

    /// Short description for log lines.
    fn describe(&self) -> String {
        format!("{} feed", self.content_type())
    }
}

// ---------------------------------------------------------------------------
// HTTP / SSE
// ---------------------------------------------------------------------------

pub struct HttpConnector {
    client: reqwest::Client,
    url: String,
    content_type: ContentType,
}

impl HttpConnector {
    pub fn new(content_type: ContentType, url: impl Into<String>, connect_timeout: Duration) -> Self {
        // No overall timeout: the body of a feed session never ends on its own.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            content_type,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for HttpConnector {
    fn content_type(&self) -> ContentType {
        self.content_type
    }

    fn connect(&self) -> BoxFuture<'_, Result<ByteStream>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .header("Accept", "text/event-stream")
                .header("Cache-Control", "no-cache")
                .send()
                .await
                .map_err(|e| FeedError::transport(self.content_type, e))?;

            if !response.status().is_success() {
                return Err(FeedError::Http {
                    status: response.status().as_u16(),
                    url: self.url.clone(),
                });
            }

            let content_type = self.content_type;
            let stream = response.bytes_stream().map(move |chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| FeedError::transport(content_type, e))
            });
            Ok(stream.boxed())
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

enum Session {
    Open(mpsc::UnboundedReceiver<Result<Vec<u8>>>),
    Refuse(String),
}

/// A connector fed from inside the process, for replaying captured feeds.
///
/// Each `connect()` takes the next session queued through the paired
/// [`MemoryFeed`], waiting until one is available.
pub struct MemoryConnector {
    content_type: ContentType,
    sessions: Mutex<mpsc::UnboundedReceiver<Session>>,
}

#[derive(Clone)]
pub struct MemoryFeed {
    content_type: ContentType,
    tx: mpsc::UnboundedSender<Session>,
}

/// Sending half of one queued session. Dropping it ends the session.
pub struct MemorySession {
    content_type: ContentType,
    tx: mpsc::UnboundedSender<Result<Vec<u8>>>,
}

impl MemoryConnector {
    pub fn new(content_type: ContentType) -> (Self, MemoryFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                content_type,
                sessions: Mutex::new(rx),
            },
            MemoryFeed { content_type, tx },
        )
    }
}

impl Connector for MemoryConnector {
    fn content_type(&self) -> ContentType {
        self.content_type
    }

    fn connect(&self) -> BoxFuture<'_, Result<ByteStream>> {
        Box::pin(async move {
            let next = self.sessions.lock().await.recv().await;
            match next {
                Some(Session::Open(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
                Some(Session::Refuse(detail)) => Err(FeedError::transport(self.content_type, detail)),
                None => Err(FeedError::transport(self.content_type, "memory feed closed")),
            }
        })
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.content_type)
    }
}

impl MemoryFeed {
    /// Queue a session for the next `connect()`.
    pub fn open_session(&self) -> MemorySession {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(Session::Open(rx));
        MemorySession {
            content_type: self.content_type,
            tx,
        }
    }

    /// Make the next `connect()` fail.
    pub fn refuse_next(&self, detail: impl Into<String>) {
        let _ = self.tx.send(Session::Refuse(detail.into()));
    }
}

impl MemorySession {
    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.tx.send(Ok(bytes.into())).is_ok()
    }

    /// Send one SSE event whose data line is `record` serialized as JSON.
    pub fn send_record(&self, record: &serde_json::Value) -> bool {
        self.send_raw(format!("data: {record}\n\n"))
    }

    /// End the session with a transport error.
    pub fn fail(self, detail: impl std::fmt::Display) {
        let _ = self
            .tx
            .send(Err(FeedError::transport(self.content_type, detail)));
    }
}
