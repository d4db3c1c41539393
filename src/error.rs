//! Crate-level error type.
//!
//! Generation failures are deliberately absent here: they are turned into
//! error artifacts (see [`crate::artifact::GenerationError`]) so the display
//! can render them like any other result.

use thiserror::Error;

use crate::artifact::ContentType;

pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, Error)]
pub enum FeedError {
    /// The push channel could not be opened or dropped mid-stream.
    #[error("transport error on {content_type} feed: {detail}")]
    Transport {
        content_type: ContentType,
        detail: String,
    },

    /// An inbound record could not be turned into an artifact.
    #[error("malformed {content_type} record: {detail}")]
    Decode {
        content_type: ContentType,
        detail: String,
    },

    /// A non-2xx reply from a request/response endpoint.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// An edit-mode operation was called while the panel is following the feed.
    #[error("{operation} requires edit mode")]
    NotEditing { operation: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FeedError {
    pub fn transport(content_type: ContentType, detail: impl std::fmt::Display) -> Self {
        FeedError::Transport {
            content_type,
            detail: detail.to_string(),
        }
    }

    pub fn decode(content_type: ContentType, detail: impl std::fmt::Display) -> Self {
        FeedError::Decode {
            content_type,
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display_names_feed() {
        let e = FeedError::transport(ContentType::Image, "connection reset");
        assert_eq!(e.to_string(), "transport error on image feed: connection reset");
    }

    #[test]
    fn test_decode_error_display() {
        let e = FeedError::decode(ContentType::Text, "missing field `parameters`");
        assert!(e.to_string().starts_with("malformed text record"));
    }

    #[test]
    fn test_not_editing_display() {
        let e = FeedError::NotEditing { operation: "submit" };
        assert_eq!(e.to_string(), "submit requires edit mode");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let e: FeedError = io.into();
        assert!(matches!(e, FeedError::Io(_)));
    }
}
