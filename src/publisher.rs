//! Serializes aggregates and alerts to JSON and hands them to the broker
//! transport.
//!
//! Aggregate payloads carry only the fields that have been set, each as
//! `{"value": .., "timestamp": ..}`:
//!
//! ```json
//! {"temperature":{"value":21.5,"timestamp":1700000000000}}
//! ```
//!
//! Routine data goes out at-least-once; alerts use exactly-once. Nothing is
//! buffered: if the uplink is down the publish is logged and dropped.

use crate::aggregate::AggregateRecord;
use crate::clock::Timestamp;
use crate::config::{PublishConfig, UnsyncedPolicy};
use crate::error::TransportError;
use crate::link::LinkHandle;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Broker quality-of-service tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl DeliveryLevel {
    pub fn qos(self) -> u8 {
        match self {
            DeliveryLevel::AtMostOnce => 0,
            DeliveryLevel::AtLeastOnce => 1,
            DeliveryLevel::ExactlyOnce => 2,
        }
    }
}

pub const MAX_TOPIC_LEN: usize = 128;

/// Broker topic: a fixed ASCII prefix followed by the device id.
pub type Topic = ArrayString<MAX_TOPIC_LEN>;

pub fn build_topic(prefix: &str, device_id: &str) -> Option<Topic> {
    let mut topic = Topic::new();
    topic.try_push_str(prefix).ok()?;
    topic.try_push_str(device_id).ok()?;
    Some(topic)
}

/// One outbound message, built per publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEnvelope {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub delivery: DeliveryLevel,
}

impl PublishEnvelope {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Broker client collaborator.
pub trait Transport: Send {
    fn publish(&mut self, envelope: PublishEnvelope) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    NothingToPublish,
    NotConnected,
    /// Clock not synchronized and policy says wait.
    Withheld,
    EncodeFailed,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    pub aggregates_sent: u64,
    pub events_sent: u64,
    pub skipped_empty: u64,
    pub skipped_not_connected: u64,
    pub withheld: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
struct FieldValue<V> {
    value: V,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregatePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<FieldValue<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity: Option<FieldValue<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    heart_rate: Option<FieldValue<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spo2: Option<FieldValue<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    co2: Option<FieldValue<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    breathing_rate: Option<FieldValue<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    illuminance: Option<FieldValue<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pressure: Option<FieldValue<f32>>,
    /// Present only when stamps are boot-relative.
    #[serde(skip_serializing_if = "Option::is_none")]
    clock: Option<&'static str>,
}

impl AggregatePayload {
    fn new(record: &AggregateRecord, timestamp: u64) -> Self {
        fn stamp<V>(value: Option<V>, timestamp: u64) -> Option<FieldValue<V>> {
            value.map(|value| FieldValue { value, timestamp })
        }

        Self {
            temperature: stamp(record.temperature, timestamp),
            humidity: stamp(record.humidity, timestamp),
            heart_rate: stamp(record.heart_rate, timestamp),
            spo2: stamp(record.spo2, timestamp),
            co2: stamp(record.co2, timestamp),
            breathing_rate: stamp(record.breathing_rate, timestamp),
            illuminance: stamp(record.illuminance, timestamp),
            pressure: stamp(record.pressure, timestamp),
            clock: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct EventPayload<'a> {
    event: &'a str,
    priority: Priority,
}

pub struct Publisher<T: Transport> {
    transport: T,
    link: LinkHandle,
    data_topic_prefix: String,
    event_topic_prefix: String,
    unsynced_policy: UnsyncedPolicy,
    stats: PublishStats,
}

impl<T: Transport> Publisher<T> {
    pub fn new(
        transport: T,
        link: LinkHandle,
        config: &PublishConfig,
        unsynced_policy: UnsyncedPolicy,
    ) -> Self {
        Self {
            transport,
            link,
            data_topic_prefix: config.data_topic_prefix.clone(),
            event_topic_prefix: config.event_topic_prefix.clone(),
            unsynced_policy,
            stats: PublishStats::default(),
        }
    }

    pub fn data_topic(&self, device_id: &str) -> Option<Topic> {
        build_topic(&self.data_topic_prefix, device_id)
    }

    pub fn event_topic(&self, device_id: &str) -> Option<Topic> {
        build_topic(&self.event_topic_prefix, device_id)
    }

    pub fn stats(&self) -> PublishStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// May anything be sent right now?
    pub fn is_ready(&self) -> bool {
        self.link.is_connected() && self.transport.is_connected()
    }

    pub fn publish_aggregate(
        &mut self,
        device_id: &str,
        record: &AggregateRecord,
        timestamp: Timestamp,
    ) -> PublishOutcome {
        if record.is_empty() {
            warn!("No valid data to publish for {}", device_id);
            self.stats.skipped_empty += 1;
            return PublishOutcome::NothingToPublish;
        }

        if !self.is_ready() {
            error!("Cannot publish aggregate for {}, uplink not connected", device_id);
            self.stats.skipped_not_connected += 1;
            return PublishOutcome::NotConnected;
        }

        let mut payload = AggregatePayload::new(record, timestamp.millis());
        if !timestamp.is_synchronized() {
            match self.unsynced_policy {
                UnsyncedPolicy::Withhold => {
                    info!("Clock not synchronized yet, withholding aggregate for {}", device_id);
                    self.stats.withheld += 1;
                    return PublishOutcome::Withheld;
                }
                UnsyncedPolicy::BootRelative => payload.clock = Some("boot_relative"),
            }
        }

        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to serialize aggregate for {}: {}", device_id, e);
                self.stats.failed += 1;
                return PublishOutcome::EncodeFailed;
            }
        };

        let Some(topic) = self.data_topic(device_id) else {
            error!("Data topic for {} exceeds {} bytes", device_id, MAX_TOPIC_LEN);
            self.stats.failed += 1;
            return PublishOutcome::EncodeFailed;
        };
        let envelope = PublishEnvelope {
            topic,
            payload: body,
            delivery: DeliveryLevel::AtLeastOnce,
        };

        if self.send(envelope) {
            self.stats.aggregates_sent += 1;
            PublishOutcome::Sent
        } else {
            PublishOutcome::TransportFailed
        }
    }

    pub fn publish_event(
        &mut self,
        device_id: &str,
        event_type: &str,
        priority: Priority,
    ) -> PublishOutcome {
        if !self.is_ready() {
            error!(
                "Cannot publish {} event for {}, uplink not connected",
                event_type, device_id
            );
            self.stats.skipped_not_connected += 1;
            return PublishOutcome::NotConnected;
        }

        let payload = EventPayload {
            event: event_type,
            priority,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event_type, e);
                self.stats.failed += 1;
                return PublishOutcome::EncodeFailed;
            }
        };

        let Some(topic) = self.event_topic(device_id) else {
            error!("Event topic for {} exceeds {} bytes", device_id, MAX_TOPIC_LEN);
            self.stats.failed += 1;
            return PublishOutcome::EncodeFailed;
        };
        let envelope = PublishEnvelope {
            topic,
            payload: body,
            delivery: DeliveryLevel::ExactlyOnce,
        };

        if self.send(envelope) {
            self.stats.events_sent += 1;
            PublishOutcome::Sent
        } else {
            PublishOutcome::TransportFailed
        }
    }

    fn send(&mut self, envelope: PublishEnvelope) -> bool {
        debug!(
            "Publishing to {} (qos {}): {}",
            envelope.topic,
            envelope.delivery.qos(),
            envelope.payload_str().unwrap_or("<binary>")
        );

        let topic = envelope.topic;
        match self.transport.publish(envelope) {
            Ok(()) => {
                info!("Published to {}", topic);
                true
            }
            Err(e) => {
                error!("Publish to {} failed: {}", topic, e);
                self.stats.failed += 1;
                false
            }
        }
    }
}

/// Transport double that keeps every envelope it is given. Clones share the
/// same record, so a test can keep one while the gateway owns another.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<PublishEnvelope>>>,
    connected: Arc<AtomicBool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<PublishEnvelope> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn publish(&mut self, envelope: PublishEnvelope) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        assert_eq!(DeliveryLevel::AtMostOnce.qos(), 0);
        assert_eq!(DeliveryLevel::AtLeastOnce.qos(), 1);
        assert_eq!(DeliveryLevel::ExactlyOnce.qos(), 2);
    }

    #[test]
    fn test_topic_is_prefix_plus_device_id() {
        let topic = build_topic("project_data/", "central_hub_01").unwrap();
        assert_eq!(topic.as_str(), "project_data/central_hub_01");

        let long_id = "x".repeat(MAX_TOPIC_LEN);
        assert!(build_topic("project_data/", &long_id).is_none());
    }

    #[test]
    fn test_payload_skips_unset_fields() {
        let record = AggregateRecord {
            humidity: Some(40.0),
            spo2: Some(98),
            ..AggregateRecord::default()
        };
        let json = serde_json::to_value(AggregatePayload::new(&record, 42)).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(object.len(), 2);
        assert_eq!(json["humidity"]["timestamp"], 42);
        assert_eq!(json["spo2"]["value"], 98);
    }
}
