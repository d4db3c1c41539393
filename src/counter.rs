//! # Stage: ArrivalCounter
//!
//! ## Responsibility
//! Count every artifact a stream decodes and remember the last one.
//!
//! ## Guarantees
//! - `total` increases by exactly one per decoded artifact, in arrival order
//! - Pausing the stream has no effect on the count
//!
//! ## NOT Responsible For
//! - What is displayed

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::artifact::{Artifact, Parameters};
use crate::stream::{StreamSource, Subscription};

/// Pure accumulator over an artifact sequence.
#[derive(Debug)]
pub struct ArrivalTally<P> {
    total: u64,
    last: Option<Arc<Artifact<P>>>,
}

impl<P> Default for ArrivalTally<P> {
    fn default() -> Self {
        Self {
            total: 0,
            last: None,
        }
    }
}

impl<P> ArrivalTally<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one arrival; returns the new total.
    pub fn record(&mut self, artifact: &Arc<Artifact<P>>) -> u64 {
        self.total += 1;
        self.last = Some(Arc::clone(artifact));
        self.total
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn last(&self) -> Option<&Arc<Artifact<P>>> {
        self.last.as_ref()
    }
}

/// An [`ArrivalTally`] fed from a live [`StreamSource`].
///
/// Counting stops when the counter is dropped.
pub struct ArrivalCounter<P> {
    tally: Arc<Mutex<ArrivalTally<P>>>,
    total_tx: Arc<watch::Sender<u64>>,
    _subscription: Subscription,
}

impl<P: Parameters> ArrivalCounter<P> {
    /// Start counting arrivals on `stream`, calling `on_last_artifact_changed`
    /// after each one.
    pub fn attach<F>(stream: &StreamSource<P>, on_last_artifact_changed: F) -> Self
    where
        F: Fn(&Arc<Artifact<P>>) + Send + Sync + 'static,
    {
        let tally = Arc::new(Mutex::new(ArrivalTally::new()));
        let total_tx = Arc::new(watch::Sender::new(0u64));

        let sub_tally = Arc::clone(&tally);
        let sub_total = Arc::clone(&total_tx);
        let subscription = stream.on_artifact(move |artifact| {
            let total = sub_tally
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(artifact);
            sub_total.send_replace(total);
            on_last_artifact_changed(artifact);
        });

        Self {
            tally,
            total_tx,
            _subscription: subscription,
        }
    }

    /// Attach without a change callback.
    pub fn count(stream: &StreamSource<P>) -> Self {
        Self::attach(stream, |_| {})
    }

    pub fn total(&self) -> u64 {
        self.tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total()
    }

    pub fn last(&self) -> Option<Arc<Artifact<P>>> {
        self.tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn subscribe_total(&self) -> watch::Receiver<u64> {
        self.total_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ImageParameters, TextParameters};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn text(prompt: &str) -> Artifact<TextParameters> {
        let mut params = TextParameters::default();
        params.apply_edit(crate::artifact::TextEdit::Prompt(prompt.into()));
        Artifact::generated(params, format!("re: {prompt}"))
    }

    #[test]
    fn test_tally_starts_empty() {
        let tally = ArrivalTally::<ImageParameters>::new();
        assert_eq!(tally.total(), 0);
        assert!(tally.last().is_none());
    }

    #[test]
    fn test_tally_records_in_order() {
        let mut tally = ArrivalTally::new();
        let a = Arc::new(text("a"));
        let b = Arc::new(text("b"));
        assert_eq!(tally.record(&a), 1);
        assert_eq!(tally.record(&b), 2);
        assert!(Arc::ptr_eq(tally.last().unwrap(), &b));
    }

    #[test]
    fn test_counter_counts_while_paused() {
        let stream = StreamSource::<TextParameters>::detached();
        let counter = ArrivalCounter::count(&stream);
        stream.ingest(text("1"));
        stream.pause(true);
        stream.ingest(text("2"));
        stream.ingest(text("3"));
        stream.pause(false);
        assert_eq!(counter.total(), 3);
        assert_eq!(counter.last().unwrap().params.prompt(), "3");
    }

    #[test]
    fn test_counter_ignores_events_before_attach() {
        let stream = StreamSource::<TextParameters>::detached();
        stream.ingest(text("early"));
        let counter = ArrivalCounter::count(&stream);
        assert_eq!(counter.total(), 0);
        stream.ingest(text("late"));
        assert_eq!(counter.total(), 1);
    }

    #[test]
    fn test_callback_sees_each_artifact() {
        let stream = StreamSource::<TextParameters>::detached();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        let _counter = ArrivalCounter::attach(&stream, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        for i in 0..4 {
            stream.ingest(text(&i.to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_subscribe_total_tracks_count() {
        let stream = StreamSource::<TextParameters>::detached();
        let counter = ArrivalCounter::count(&stream);
        let rx = counter.subscribe_total();
        stream.ingest(text("x"));
        stream.ingest(text("y"));
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn test_dropping_counter_detaches() {
        let stream = StreamSource::<TextParameters>::detached();
        let counter = ArrivalCounter::count(&stream);
        assert_eq!(stream.subscriber_count(), 1);
        drop(counter);
        assert_eq!(stream.subscriber_count(), 0);
    }
}
