//! Stop notice shared by every task of a Frontend.
//!
//! The Frontend loop triggers it once, with the reason, when a signal or a
//! `SHUTDOWN` control command arrives. Client connections and event
//! listeners hold a `StopNotice` and wind down when it fires; a notice taken
//! after the trigger fires immediately.

use std::sync::Arc;

use tokio::sync::watch;

use super::signals::Termination;

/// Why the Frontend is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Signal(Termination),
    /// `SHUTDOWN` control command with its reason text.
    Control(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Signal(t) => write!(f, "signal {:?}", t),
            StopReason::Control(reason) => write!(f, "control command ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    state: Arc<watch::Sender<Option<StopReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> StopNotice {
        StopNotice {
            rx: self.state.subscribe(),
        }
    }

    /// Fire the notice. Only the first reason is kept; returns whether this
    /// call was the one that fired it.
    pub fn trigger(&self, reason: StopReason) -> bool {
        self.state.send_if_modified(|current| match current {
            Some(_) => false,
            None => {
                *current = Some(reason);
                true
            }
        })
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.state.borrow().clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// One task's view of the stop notice.
#[derive(Debug)]
pub struct StopNotice {
    rx: watch::Receiver<Option<StopReason>>,
}

impl StopNotice {
    /// Resolve once the Frontend is stopping.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(Option::is_some).await;
    }
}
