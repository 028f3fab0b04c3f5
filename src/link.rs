//! Uplink connectivity state machine.
//!
//! ```text
//! Disconnected --start--> Connecting --up--> Connected
//! Connecting   --down (attempts < MAX)--> Connecting   (retry)
//! Connecting   --down (attempts = MAX)--> Failed
//! Connected    --down--> Connecting                    (retries reset to 0)
//! any          --reset--> Disconnected
//! ```
//!
//! The machine is driven only by discrete [`LinkSignal`]s, so the retry policy
//! runs without any network timing. Each transition is published on a watch
//! channel for [`LinkHandle`] readers and, if a notifier is attached, posted
//! to the event bus as [`Event::LinkStateChanged`].

use crate::bus::{Event, EventSender};
use crate::error::LinkError;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub retries: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSignal {
    Start,
    LinkUp,
    LinkDown,
    /// External supervisor clears a `Failed` (or any) state.
    Reset,
    /// Orderly shutdown.
    Stop,
}

/// What the caller must ask the connectivity driver to do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    None,
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LinkState,
    pub to: LinkState,
    pub retries: u8,
    pub action: LinkAction,
}

/// Outcome of [`LinkHandle::wait_until_connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Connected,
    Failed,
    TimedOut,
}

/// Connectivity driver the state machine's actions are applied to. Drivers
/// report link changes back by posting `LinkUp` / `LinkDown` on the bus.
pub trait Connectivity: Send {
    fn connect(&mut self) -> Result<(), LinkError>;
    fn disconnect(&mut self);
}

#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    retries: u8,
    max_retries: u8,
    status_tx: watch::Sender<LinkStatus>,
    notifier: Option<EventSender>,
}

impl LinkStateMachine {
    pub fn new(max_retries: u8) -> Self {
        let initial = LinkStatus {
            state: LinkState::Disconnected,
            retries: 0,
        };
        let (status_tx, _) = watch::channel(initial);

        Self {
            state: LinkState::Disconnected,
            retries: 0,
            max_retries: max_retries.max(1),
            status_tx,
            notifier: None,
        }
    }

    /// Post every transition to the event bus as well.
    #[must_use]
    pub fn with_notifier(mut self, notifier: EventSender) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn current_state(&self) -> LinkState {
        self.state
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus {
            state: self.state,
            retries: self.retries,
        }
    }

    pub fn handle(&self) -> LinkHandle {
        LinkHandle {
            status_rx: self.status_tx.subscribe(),
        }
    }

    pub fn start(&mut self) -> Option<Transition> {
        self.apply(LinkSignal::Start)
    }

    pub fn link_up(&mut self) -> Option<Transition> {
        self.apply(LinkSignal::LinkUp)
    }

    pub fn link_down(&mut self) -> Option<Transition> {
        self.apply(LinkSignal::LinkDown)
    }

    pub fn reset(&mut self) -> Option<Transition> {
        self.apply(LinkSignal::Reset)
    }

    /// Feed one signal. Returns `None` when the signal has no effect in the
    /// current state.
    pub fn apply(&mut self, signal: LinkSignal) -> Option<Transition> {
        let from = self.state;

        let (to, retries, action) = match (from, signal) {
            (LinkState::Disconnected, LinkSignal::Start) => {
                (LinkState::Connecting, 0, LinkAction::Connect)
            }
            // Driver came up on its own before anyone asked.
            (LinkState::Disconnected | LinkState::Connecting, LinkSignal::LinkUp) => {
                (LinkState::Connected, 0, LinkAction::None)
            }
            (LinkState::Connecting, LinkSignal::LinkDown) => {
                let attempts = self.retries.saturating_add(1);
                if attempts >= self.max_retries {
                    (LinkState::Failed, attempts, LinkAction::None)
                } else {
                    (LinkState::Connecting, attempts, LinkAction::Connect)
                }
            }
            // A drop after a good connection starts a fresh retry budget.
            (LinkState::Connected, LinkSignal::LinkDown) => {
                (LinkState::Connecting, 0, LinkAction::Connect)
            }
            (LinkState::Connecting | LinkState::Connected, LinkSignal::Reset) => {
                (LinkState::Disconnected, 0, LinkAction::Disconnect)
            }
            (LinkState::Failed, LinkSignal::Reset) => (LinkState::Disconnected, 0, LinkAction::None),
            (LinkState::Connecting | LinkState::Connected, LinkSignal::Stop) => {
                (LinkState::Disconnected, 0, LinkAction::Disconnect)
            }
            _ => {
                debug!("Link signal {:?} ignored in state {:?}", signal, from);
                return None;
            }
        };

        self.state = to;
        self.retries = retries;

        let transition = Transition {
            from,
            to,
            retries,
            action,
        };
        self.publish(transition);
        Some(transition)
    }

    fn publish(&self, transition: Transition) {
        match transition.to {
            LinkState::Failed => warn!(
                "Link failed after {} attempts, waiting for external reset",
                transition.retries
            ),
            LinkState::Connecting if transition.from == LinkState::Connecting => info!(
                "Link attempt failed, retrying ({}/{})",
                transition.retries, self.max_retries
            ),
            to => info!("Link {:?} -> {:?}", transition.from, to),
        }

        self.status_tx.send_replace(self.status());

        if let Some(notifier) = &self.notifier {
            // Drop-on-full is already logged by the bus.
            let _ = notifier.try_post(Event::LinkStateChanged {
                from: transition.from,
                to: transition.to,
                retries: transition.retries,
            });
        }
    }
}

/// Read-only view of the link state for other tasks.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    status_rx: watch::Receiver<LinkStatus>,
}

impl LinkHandle {
    pub fn current_state(&self) -> LinkState {
        self.status_rx.borrow().state
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == LinkState::Connected
    }

    /// Suspend until the link is `Connected` or `Failed`, or `timeout` elapses.
    pub async fn wait_until_connected(&self, timeout: Duration) -> WaitOutcome {
        let mut status_rx = self.status_rx.clone();
        let settled = tokio::time::timeout(
            timeout,
            status_rx.wait_for(|s| matches!(s.state, LinkState::Connected | LinkState::Failed)),
        )
        .await;

        match settled {
            Ok(Ok(status)) if status.state == LinkState::Connected => WaitOutcome::Connected,
            Ok(Ok(_)) => WaitOutcome::Failed,
            Ok(Err(_)) => {
                warn!("Link state machine dropped while waiting for connection");
                WaitOutcome::Failed
            }
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    /// Suspend until the link is in `state`. `false` if the state machine is
    /// gone.
    pub async fn wait_for_state(&mut self, state: LinkState) -> bool {
        self.status_rx.wait_for(|s| s.state == state).await.is_ok()
    }

    /// Suspend until the next transition after the last one this handle saw.
    pub async fn changed(&mut self) -> bool {
        self.status_rx.changed().await.is_ok()
    }
}

/// Ask the consumer loop to reset the link each time it lands in `Failed`,
/// `backoff` after the failure. Returns once the state machine or the bus is
/// gone.
pub async fn reset_after_failure(mut link: LinkHandle, backoff: Duration, bus: EventSender) {
    loop {
        if !link.wait_for_state(LinkState::Failed).await {
            return;
        }
        warn!("Link failed, resetting in {:?}", backoff);
        tokio::time::sleep(backoff).await;

        if bus.deliver(Event::ResetLink).await.is_err() {
            return;
        }
        // Failed only leaves on a reset, so the next change is ours.
        if !link.changed().await {
            return;
        }
    }
}

/// Connectivity double that records the calls made on it.
#[derive(Debug, Default, Clone)]
pub struct RecordingConnectivity {
    pub connect_calls: u32,
    pub disconnect_calls: u32,
    pub fail_connect: bool,
}

impl Connectivity for RecordingConnectivity {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.connect_calls += 1;
        if self.fail_connect {
            return Err(LinkError::DriverUnavailable("connect refused".into()));
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.disconnect_calls += 1;
    }
}
