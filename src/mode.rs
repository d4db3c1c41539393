//! Feed / edit mode switching.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::artifact::Parameters;
use crate::controller::OverrideController;
use crate::stream::StreamHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Following the live stream.
    #[default]
    Feed,
    /// Display frozen; the user edits parameters and submits.
    Edit,
}

impl Mode {
    pub fn other(self) -> Mode {
        match self {
            Mode::Feed => Mode::Edit,
            Mode::Edit => Mode::Feed,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Feed => write!(f, "feed"),
            Mode::Edit => write!(f, "edit"),
        }
    }
}

/// Drives one stream handle's pause flag and the controller's edit session
/// from a single mode value.
pub struct ModeSwitch<P> {
    stream: StreamHandle<P>,
    controller: OverrideController<P>,
    mode: watch::Sender<Mode>,
    transition: Mutex<()>,
}

impl<P: Parameters> ModeSwitch<P> {
    pub fn new(stream: StreamHandle<P>, controller: OverrideController<P>) -> Self {
        Self {
            stream,
            controller,
            mode: watch::Sender::new(Mode::Feed),
            transition: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.mode.subscribe()
    }

    /// Entering `Edit` while already editing re-snapshots from whatever is
    /// displayed and drops any in-flight submission.
    pub fn set_mode(&self, target: Mode) {
        let _guard = self
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.mode();

        match (current, target) {
            (_, Mode::Edit) => {
                self.stream.pause(true);
                self.controller.enter_edit(self.controller.displayed());
            }
            (Mode::Edit, Mode::Feed) => {
                self.controller.exit_edit();
                self.stream.pause(false);
                self.controller.sync_display();
            }
            (Mode::Feed, Mode::Feed) => return,
        }

        self.mode.send_replace(target);
        if current != target {
            info!(content_type = %P::CONTENT_TYPE, from = %current, to = %target, "mode changed");
        }
    }

    /// Flip between feed and edit; returns the new mode.
    pub fn toggle(&self) -> Mode {
        let target = self.mode().other();
        self.set_mode(target);
        target
    }
}
