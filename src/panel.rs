//! One content type's complete feed/edit stack.

use std::sync::Arc;

use tokio::sync::watch;

use crate::artifact::{Artifact, ImageParameters, Parameters, TextParameters};
use crate::catalog::{CachedCatalog, HttpCatalog};
use crate::controller::{ControllerOptions, OverrideController};
use crate::counter::ArrivalCounter;
use crate::error::Result;
use crate::generate::{Generator, HttpGenerator};
use crate::mode::{Mode, ModeSwitch};
use crate::stream::{FeedHub, HubStream, StreamHandle};

/// Stream, counter, controller and mode switch wired together.
pub struct Panel<P: Parameters> {
    stream: StreamHandle<P>,
    counter: ArrivalCounter<P>,
    controller: OverrideController<P>,
    mode: ModeSwitch<P>,
}

pub type ImagePanel = Panel<ImageParameters>;
pub type TextPanel = Panel<TextParameters>;

impl<P: Parameters> Panel<P> {
    pub fn new(
        stream: StreamHandle<P>,
        generator: Arc<dyn Generator<P>>,
        options: ControllerOptions,
    ) -> Self {
        let counter = ArrivalCounter::count(&stream);
        let controller = OverrideController::new(Arc::clone(&stream), generator, options);
        let mode = ModeSwitch::new(Arc::clone(&stream), controller.clone());
        Self {
            stream,
            counter,
            controller,
            mode,
        }
    }

    /// Share `hub`'s connection and generate over HTTP with its config.
    pub fn open(hub: &FeedHub) -> Self
    where
        P: HubStream,
        HttpGenerator: Generator<P>,
    {
        let config = hub.config();
        let catalog = Arc::new(CachedCatalog::new(HttpCatalog::new(config)));
        let options = ControllerOptions::from_config(config).with_catalog(catalog);
        Self::new(hub.open::<P>(), Arc::new(HttpGenerator::new(config)), options)
    }

    pub fn stream(&self) -> &StreamHandle<P> {
        &self.stream
    }

    pub fn counter(&self) -> &ArrivalCounter<P> {
        &self.counter
    }

    pub fn controller(&self) -> &OverrideController<P> {
        &self.controller
    }

    pub fn mode_switch(&self) -> &ModeSwitch<P> {
        &self.mode
    }

    pub fn displayed(&self) -> Option<Arc<Artifact<P>>> {
        self.controller.displayed()
    }

    pub fn subscribe_display(&self) -> watch::Receiver<Option<Arc<Artifact<P>>>> {
        self.controller.subscribe_display()
    }

    pub fn total(&self) -> u64 {
        self.counter.total()
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn set_mode(&self, mode: Mode) {
        self.mode.set_mode(mode);
    }

    pub fn toggle_mode(&self) -> Mode {
        self.mode.toggle()
    }

    pub fn set_param(&self, edit: P::Edit) -> Result<()> {
        self.controller.set_param(edit)
    }

    pub fn submit(&self) -> Result<()> {
        self.controller.submit()
    }

    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }

    pub fn is_generating(&self) -> bool {
        self.controller.is_generating()
    }
}
