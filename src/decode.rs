//! Server-Sent-Events framing and feed record decoding.
//!
//! The decoder is incremental: chunks may split lines (or UTF-8 sequences)
//! anywhere, and complete events are handed back as soon as their
//! terminating blank line arrives.

use thiserror::Error;

use crate::artifact::{now_ms, Artifact, Parameters, Provenance};
use crate::error::{FeedError, Result};
use crate::wire::FeedRecord;

/// End-of-stream marker some endpoints send as a data payload.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Longest unterminated line buffered before the decoder gives up.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A peer sent more than the line limit without a newline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line exceeds {limit} bytes without a terminator ({pending} buffered)")]
pub struct LineTooLong {
    pub limit: usize,
    pub pending: usize,
}

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes at the front of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    data: Vec<String>,
    event: Option<String>,
    id: Option<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_line_limit(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_line_limit(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line,
            data: Vec::new(),
            event: None,
            id: None,
        }
    }

    /// Feed a chunk, returning every event it completes.
    ///
    /// When the unterminated tail grows past the line limit the decoder is
    /// reset and the error is returned; events completed by the same chunk
    /// are discarded with it.
    pub fn push(&mut self, chunk: &[u8]) -> std::result::Result<Vec<SseFrame>, LineTooLong> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.buffer[cursor..].iter().position(|&b| b == b'\n') {
            let line_end = cursor + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..line_end])
                .trim_end_matches('\r')
                .to_string();
            if let Some(frame) = self.feed_line(&line) {
                frames.push(frame);
            }
            start = line_end + 1;
            cursor = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            let pending = self.buffer.len();
            self.reset();
            return Err(LineTooLong {
                limit: self.max_line,
                pending,
            });
        }
        Ok(frames)
    }

    /// Bytes held for an incomplete line.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn reset(&mut self) {
        self.buffer = Vec::new();
        self.scanned = 0;
        self.data.clear();
        self.event = None;
        self.id = None;
    }

    /// Flush a final event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(frame) = self.feed_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // "retry" and unknown fields are ignored
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event,
            id: self.id.clone(),
            data,
        })
    }
}

/// Decode one event payload into an artifact.
///
/// Returns `Ok(None)` for payloads that carry no record (the `[DONE]`
/// sentinel, blank keep-alives).
pub fn decode_record<P: Parameters>(data: &str) -> Result<Option<Artifact<P>>> {
    let data = data.trim();
    if data.is_empty() || data == DONE_SENTINEL {
        return Ok(None);
    }

    let record: FeedRecord<P> =
        serde_json::from_str(data).map_err(|e| FeedError::decode(P::CONTENT_TYPE, e))?;

    let provenance = Provenance {
        referrer: record.referrer,
        concurrency_hint: record.concurrency_hint,
        received_at_ms: now_ms(),
    };
    let error = record.error.map(|e| e.into_generation_error(None));

    Ok(Some(Artifact::from_stream(
        record.parameters,
        record.result,
        error,
        provenance,
    )))
}
