//! Bounded event bus between producers (link driver, radio receive path,
//! timers) and the single consumer loop.
//!
//! Producers never wait longer than the configured enqueue timeout. When the
//! queue is still full after that, the new event is dropped and a warning is
//! logged: a late sensor update is worth less than a fresh one.
//!
//! Link reports are the exception. The state machine only advances on them,
//! so drivers and the link supervisor use [`EventSender::deliver`], which
//! waits for a slot instead of dropping.

use crate::config::BusConfig;
use crate::error::BusError;
use crate::link::LinkState;
use crate::radio::{MacAddress, SensorReading};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Uplink driver reports the connection is usable.
    LinkUp,
    /// Uplink driver reports the connection dropped or an attempt failed.
    LinkDown,
    /// Emitted by the link state machine on every transition.
    LinkStateChanged {
        from: LinkState,
        to: LinkState,
        retries: u8,
    },
    /// Supervisor clears a `Failed` link and starts over.
    ResetLink,
    ButtonPressed,
    SensorDataReady {
        source: MacAddress,
        reading: SensorReading,
    },
    CommandReceived(Vec<u8>),
    TimeSynced {
        epoch_ms: u64,
    },
    PublishTick,
    Shutdown,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::LinkUp => "link_up",
            Event::LinkDown => "link_down",
            Event::LinkStateChanged { .. } => "link_state_changed",
            Event::ResetLink => "reset_link",
            Event::ButtonPressed => "button_pressed",
            Event::SensorDataReady { .. } => "sensor_data_ready",
            Event::CommandReceived(_) => "command_received",
            Event::TimeSynced { .. } => "time_synced",
            Event::PublishTick => "publish_tick",
            Event::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    posted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub posted: u64,
    pub dropped: u64,
    pub delivered: u64,
}

/// Create a bus with the configured capacity and producer timeout.
pub fn channel(config: &BusConfig) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let counters = Arc::new(Counters::default());

    let sender = EventSender {
        tx,
        enqueue_timeout: config.enqueue_timeout(),
        counters: Arc::clone(&counters),
    };
    let receiver = EventReceiver { rx, counters };

    (sender, receiver)
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Event>,
    enqueue_timeout: Duration,
    counters: Arc<Counters>,
}

impl EventSender {
    /// Enqueue, waiting at most the configured timeout for a free slot.
    pub async fn post(&self, event: Event) -> Result<(), BusError> {
        let name = event.name();
        match tokio::time::timeout(self.enqueue_timeout, self.tx.send(event)).await {
            Ok(Ok(())) => {
                self.counters.posted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => {
                self.record_drop(name);
                Err(BusError::Full)
            }
        }
    }

    /// Enqueue, waiting as long as it takes for a free slot. Fails only once
    /// the consumer has closed the bus.
    pub async fn deliver(&self, event: Event) -> Result<(), BusError> {
        self.tx.send(event).await.map_err(|_| BusError::Closed)?;
        self.counters.posted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue without waiting at all. For callers that must not suspend.
    pub fn try_post(&self, event: Event) -> Result<(), BusError> {
        let name = event.name();
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.posted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.record_drop(name);
                Err(BusError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Closed),
        }
    }

    pub fn stats(&self) -> BusStats {
        snapshot(&self.counters)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn record_drop(&self, name: &str) {
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Event bus full, dropping {} event ({} dropped so far)", name, dropped);
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<Event>,
    counters: Arc<Counters>,
}

impl EventReceiver {
    /// Next event in arrival order; `None` once every sender is gone and the
    /// queue is drained.
    pub async fn next(&mut self) -> Option<Event> {
        let event = self.rx.recv().await?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    pub fn try_next(&mut self) -> Option<Event> {
        let event = self.rx.try_recv().ok()?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Stop accepting new events; already queued events can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn stats(&self) -> BusStats {
        snapshot(&self.counters)
    }
}

fn snapshot(counters: &Counters) -> BusStats {
    BusStats {
        posted: counters.posted.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
        delivered: counters.delivered.load(Ordering::Relaxed),
    }
}
