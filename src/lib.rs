//! Live feed vs. manual edit synchronization for streamed image and text
//! generations.
//!
//! Each content type gets a [`StreamSource`] that follows a server push feed,
//! an [`ArrivalCounter`] that tallies every arrival, an
//! [`OverrideController`] that owns the edit-mode working copy and the one
//! outstanding generation request, and a [`ModeSwitch`] that flips between
//! following the feed and editing. [`Panel`] wires the four together.

pub mod artifact;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod controller;
pub mod counter;
pub mod decode;
pub mod error;
pub mod generate;
pub mod mode;
pub mod panel;
pub mod stream;
pub mod transport;
pub mod wire;

pub use artifact::{
    Artifact, ChatMessage, ContentType, GenerationError, GenerationErrorKind, ImageEdit,
    ImageParameters, Origin, Parameters, Provenance, TextEdit, TextParameters,
};
pub use config::{FeedConfig, ReconnectPolicy};
pub use controller::{ControllerOptions, OverrideController};
pub use counter::{ArrivalCounter, ArrivalTally};
pub use error::{FeedError, Result};
pub use generate::{Generator, HttpGenerator};
pub use mode::{Mode, ModeSwitch};
pub use panel::{ImagePanel, Panel, TextPanel};
pub use stream::{ConnectionStatus, FeedHub, StreamHandle, StreamSource, Subscription};
