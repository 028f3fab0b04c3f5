//! The consumer loop.
//!
//! [`Gateway`] owns the link state machine, the aggregate store, the clock and
//! the publisher, and is the only place any of them are mutated. Producers
//! talk to it exclusively through the event bus; events are handled strictly
//! in arrival order.

use crate::aggregate::{AggregateStore, AggregateView};
use crate::bus::{BusStats, Event, EventReceiver};
use crate::clock::Clock;
use crate::command::{parse_command, GatewayCommand};
use crate::config::{FanIn, GatewayConfig};
use crate::link::{
    Connectivity, LinkAction, LinkHandle, LinkSignal, LinkState, LinkStateMachine, LinkStatus,
    Transition,
};
use crate::publisher::{Priority, PublishOutcome, PublishStats, Publisher, Transport};
use crate::radio::{MacAddress, SensorReading};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const BUTTON_EVENT: &str = "button_pressed";
pub const LINK_FAILED_EVENT: &str = "link_failed";

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub device_id: String,
    pub running: bool,
    pub link: LinkStatus,
    pub time_synchronized: bool,
    pub devices: usize,
    pub devices_rejected: u64,
    pub events_processed: u64,
    pub bus: BusStats,
    pub publish: PublishStats,
}

/// Cloneable read access to the latest [`GatewayStatus`].
#[derive(Debug, Clone)]
pub struct StatusHandle {
    status_rx: watch::Receiver<GatewayStatus>,
}

impl StatusHandle {
    pub fn current(&self) -> GatewayStatus {
        self.status_rx.borrow().clone()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&*self.status_rx.borrow()).unwrap_or_default()
    }
}

pub struct Gateway<T: Transport, C: Connectivity> {
    device_id: String,
    fan_in: FanIn,
    max_devices: usize,
    link: LinkStateMachine,
    store: AggregateStore,
    publisher: Publisher<T>,
    clock: Clock,
    connectivity: C,
    events: EventReceiver,
    status_tx: watch::Sender<GatewayStatus>,
    running: bool,
    events_processed: u64,
    devices_rejected: u64,
    link_failure_unreported: bool,
}

impl<T: Transport, C: Connectivity> Gateway<T, C> {
    /// Link transitions are handled in place as they happen, so the bus only
    /// carries driver reports and producer events.
    pub fn new(config: &GatewayConfig, transport: T, connectivity: C, events: EventReceiver) -> Self {
        let link = LinkStateMachine::new(config.link.max_retries);
        let publisher = Publisher::new(
            transport,
            link.handle(),
            &config.publish,
            config.time.unsynced_policy,
        );

        let initial = GatewayStatus {
            device_id: config.device.id.clone(),
            running: false,
            link: link.status(),
            time_synchronized: false,
            devices: 0,
            devices_rejected: 0,
            events_processed: 0,
            bus: events.stats(),
            publish: publisher.stats(),
        };
        let (status_tx, _) = watch::channel(initial);

        Self {
            device_id: config.device.id.clone(),
            fan_in: config.device.fan_in,
            max_devices: config.device.max_devices.max(1),
            link,
            store: AggregateStore::new(),
            publisher,
            clock: Clock::new(config.time.backward_jump_tolerance_ms),
            connectivity,
            events,
            status_tx,
            running: false,
            events_processed: 0,
            devices_rejected: 0,
            link_failure_unreported: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn link_state(&self) -> LinkState {
        self.link.current_state()
    }

    pub fn link_handle(&self) -> LinkHandle {
        self.link.handle()
    }

    pub fn aggregates(&self) -> AggregateView {
        self.store.view()
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            status_rx: self.status_tx.subscribe(),
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.status_tx.borrow().clone()
    }

    pub fn publisher(&self) -> &Publisher<T> {
        &self.publisher
    }

    pub fn connectivity(&self) -> &C {
        &self.connectivity
    }

    pub fn connectivity_mut(&mut self) -> &mut C {
        &mut self.connectivity
    }

    /// Bring the uplink up. Call once before [`run`](Self::run).
    pub fn start(&mut self) {
        info!("Gateway {} starting", self.device_id);
        self.running = true;
        self.drive_link(LinkSignal::Start);
        self.refresh_status();
    }

    /// Consume events until `Shutdown` arrives, then stop accepting new ones
    /// and drain whatever is still queued.
    pub async fn run(&mut self) {
        if !self.running {
            self.start();
        }

        while let Some(event) = self.events.next().await {
            if event == Event::Shutdown {
                info!("Shutdown requested, draining event bus");
                break;
            }
            self.handle_event(event);
        }

        self.events.close();
        while let Some(event) = self.events.try_next() {
            if event != Event::Shutdown {
                self.handle_event(event);
            }
        }
    }

    /// Disconnect the uplink and publish a final status.
    pub fn shutdown(&mut self) {
        self.drive_link(LinkSignal::Stop);
        self.running = false;
        self.refresh_status();
        info!("Gateway stopped: {}", self.status_handle().to_json());
    }

    pub fn handle_event(&mut self, event: Event) {
        debug!("Handling {} event", event.name());

        match event {
            Event::LinkUp => self.drive_link(LinkSignal::LinkUp),
            Event::LinkDown => self.drive_link(LinkSignal::LinkDown),
            Event::LinkStateChanged { from, to, retries } => {
                debug!("Observed link change {:?} -> {:?} (retries {})", from, to, retries);
            }
            Event::ResetLink => self.reset_link(),
            Event::ButtonPressed => {
                self.publisher
                    .publish_event(&self.device_id, BUTTON_EVENT, Priority::High);
            }
            Event::SensorDataReady { source, reading } => self.on_reading(source, &reading),
            Event::CommandReceived(bytes) => self.on_command(&bytes),
            Event::TimeSynced { epoch_ms } => self.clock.mark_synced(epoch_ms),
            Event::PublishTick => self.publish_all(),
            Event::Shutdown => debug!("Shutdown outside run loop ignored"),
        }

        self.events_processed += 1;
        self.refresh_status();
    }

    /// Handle everything already queued without waiting for more. Returns the
    /// number of events handled.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events.try_next() {
            if event == Event::Shutdown {
                continue;
            }
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Publish every known aggregate with a fresh timestamp.
    pub fn publish_all(&mut self) {
        let timestamp = self.clock.now();
        for device_id in self.store.device_ids() {
            let record = self.store.snapshot(&device_id);
            self.publisher.publish_aggregate(&device_id, &record, timestamp);
        }
    }

    fn on_reading(&mut self, source: MacAddress, reading: &SensorReading) {
        let device_id = match self.fan_in {
            FanIn::SingleHub => self.device_id.clone(),
            FanIn::PerNode => source.to_string(),
        };

        if !self.store.contains(&device_id) && self.store.device_count() >= self.max_devices {
            self.devices_rejected += 1;
            warn!(
                "Ignoring reading from unknown device {}: {} devices already tracked",
                device_id, self.max_devices
            );
            return;
        }

        self.store.apply(&device_id, reading);
        info!("{} updated from {}: {:?}", device_id, source, reading);

        let record = self.store.snapshot(&device_id);
        let timestamp = self.clock.now();
        self.publisher.publish_aggregate(&device_id, &record, timestamp);
    }

    fn on_link_changed(&mut self, transition: Transition) {
        match transition.to {
            LinkState::Failed => {
                error!(
                    "Uplink failed after {} attempts; supervisor reset required",
                    transition.retries
                );
                self.link_failure_unreported = true;
            }
            LinkState::Connected if self.link_failure_unreported => {
                let outcome = self.publisher.publish_event(
                    &self.device_id,
                    LINK_FAILED_EVENT,
                    Priority::Critical,
                );
                if outcome == PublishOutcome::Sent {
                    self.link_failure_unreported = false;
                }
            }
            _ => {}
        }
    }

    fn on_command(&mut self, bytes: &[u8]) {
        let command = match parse_command(bytes) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring inbound command: {}", e);
                return;
            }
        };

        info!("Command received: {:?}", command);
        match command {
            GatewayCommand::PublishNow => self.publish_all(),
            GatewayCommand::ResetLink => self.reset_link(),
            GatewayCommand::Alert { event, priority } => {
                self.publisher.publish_event(&self.device_id, &event, priority);
            }
            GatewayCommand::Status => {
                self.refresh_status();
                info!("Status: {}", self.status_handle().to_json());
            }
        }
    }

    fn reset_link(&mut self) {
        self.drive_link(LinkSignal::Reset);
        self.drive_link(LinkSignal::Start);
    }

    /// Apply a signal and carry out the driver actions it asks for. A driver
    /// that refuses to connect outright counts as a failed attempt.
    fn drive_link(&mut self, signal: LinkSignal) {
        let mut next = self.link.apply(signal);

        while let Some(transition) = next.take() {
            self.on_link_changed(transition);
            match transition.action {
                LinkAction::Connect => {
                    if let Err(e) = self.connectivity.connect() {
                        warn!("Connect attempt failed: {}", e);
                        next = self.link.apply(LinkSignal::LinkDown);
                    }
                }
                LinkAction::Disconnect => self.connectivity.disconnect(),
                LinkAction::None => {}
            }
        }
    }

    fn refresh_status(&mut self) {
        let status = GatewayStatus {
            device_id: self.device_id.clone(),
            running: self.running,
            link: self.link.status(),
            time_synchronized: self.clock.is_synchronized(),
            devices: self.store.device_count(),
            devices_rejected: self.devices_rejected,
            events_processed: self.events_processed,
            bus: self.events.stats(),
            publish: self.publisher.stats(),
        };
        self.status_tx.send_replace(status);
    }
}
