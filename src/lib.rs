//! # Sensorhub Gateway
//!
//! Core of a sensor-hub gateway: battery nodes send compact binary readings
//! over a short-range radio, the gateway folds them into per-device aggregate
//! records and publishes those as JSON to a broker.
//!
//! ## Features
//!
//! - **Bit-exact radio codec**: 1-byte kind tag followed by little-endian `f32` fields
//! - **Single consumer loop**: every producer talks to the gateway through a bounded event bus
//! - **Uplink state machine**: bounded retries, terminal `Failed` state, explicit reset
//! - **Timestamped publishing**: only fields that have been set, each with its own stamp
//! - **Clock discipline**: SNTP sync with monotonic output across re-syncs
//!
//! ## Quick Start
//!
//! ```rust
//! use sensorhub::{bus, Event, Gateway, GatewayConfig, RecordingConnectivity, RecordingTransport};
//! use sensorhub::radio::{encode, MacAddress, SensorReading};
//!
//! let config = GatewayConfig::default();
//! let (tx, rx) = bus::channel(&config.bus);
//! let transport = RecordingTransport::new();
//! let mut gateway = Gateway::new(&config, transport.clone(), RecordingConnectivity::default(), rx);
//!
//! gateway.start();
//! tx.try_post(Event::LinkUp).unwrap();
//! tx.try_post(Event::TimeSynced { epoch_ms: 1_700_000_000_000 }).unwrap();
//!
//! let frame = encode(&SensorReading::TemperatureHumidity {
//!     temperature: 21.5,
//!     humidity: 40.0,
//! });
//! let reading = sensorhub::radio::decode(&frame).unwrap();
//! tx.try_post(Event::SensorDataReady {
//!     source: MacAddress::new([0x24, 0x6F, 0x28, 0x00, 0x00, 0x01]),
//!     reading,
//! })
//! .unwrap();
//!
//! gateway.process_pending();
//! assert_eq!(transport.sent_count(), 1);
//! ```
//!
//! ## Architecture
//!
//! - [`radio`] - Frame layout, decode and encode
//! - [`ingress`] - Radio receive path and UDP bridge
//! - [`bus`] - Bounded event bus between producers and the consumer loop
//! - [`link`] - Uplink connectivity state machine
//! - [`aggregate`] - Per-device latest-value records
//! - [`clock`] / [`sntp`] - Wall-clock discipline
//! - [`publisher`] - JSON payloads and broker hand-off
//! - [`command`] - Inbound broker commands
//! - [`gateway`] - The consumer loop tying it together
//! - [`uplink`] - Hosted TCP broker transport

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod aggregate;
pub mod bus;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingress;
pub mod link;
pub mod publisher;
pub mod radio;
pub mod sntp;
pub mod uplink;

// Re-export main public types for convenience
pub use aggregate::{AggregateRecord, AggregateStore, AggregateView};
pub use bus::{Event, EventReceiver, EventSender};
pub use clock::{Clock, Timestamp};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayStatus, StatusHandle};
pub use link::{LinkState, LinkStateMachine, RecordingConnectivity};
pub use publisher::{Priority, PublishOutcome, Publisher, RecordingTransport};
pub use radio::{MacAddress, SensorKind, SensorReading};
