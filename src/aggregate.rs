//! Per-device aggregate of the latest reading of each sensor kind.
//!
//! Fields start unset (`None`) and keep their last value until a newer reading
//! of the owning kind overwrites them; publishing never clears them.
//!
//! The consumer loop owns the only [`AggregateStore`], so there is exactly one
//! writer. Other tasks read through an [`AggregateView`], which always copies
//! a whole record out under the lock and never hands out a live reference.

use crate::radio::SensorReading;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub heart_rate: Option<i32>,
    pub spo2: Option<i32>,
    pub co2: Option<i32>,
    pub breathing_rate: Option<i32>,
    pub illuminance: Option<f32>,
    pub pressure: Option<f32>,
}

impl AggregateRecord {
    /// Overwrite exactly the fields owned by `reading`'s kind.
    pub fn apply(&mut self, reading: &SensorReading) {
        match *reading {
            SensorReading::TemperatureHumidity {
                temperature,
                humidity,
            } => {
                self.temperature = Some(temperature);
                self.humidity = Some(humidity);
            }
            SensorReading::Illuminance { lux } => self.illuminance = Some(lux),
            SensorReading::Pressure { hpa } => self.pressure = Some(hpa),
            SensorReading::Vitals { heart_rate, spo2 } => {
                self.heart_rate = Some(to_count(heart_rate));
                self.spo2 = Some(to_count(spo2));
            }
            SensorReading::Co2 { ppm } => self.co2 = Some(to_count(ppm)),
            SensorReading::Breathing { rate } => self.breathing_rate = Some(to_count(rate)),
        }
    }

    pub fn set_field_count(&self) -> usize {
        [
            self.temperature.is_some(),
            self.humidity.is_some(),
            self.heart_rate.is_some(),
            self.spo2.is_some(),
            self.co2.is_some(),
            self.breathing_rate.is_some(),
            self.illuminance.is_some(),
            self.pressure.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.set_field_count() == 0
    }
}

// Integer vitals travel as f32 on air; round to the nearest whole count.
fn to_count(value: f32) -> i32 {
    value.round() as i32
}

type Records = BTreeMap<String, AggregateRecord>;

/// Writer side of the aggregate records, owned by the consumer loop.
#[derive(Debug, Default)]
pub struct AggregateStore {
    records: Arc<RwLock<Records>>,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a reading to `device_id`'s record, creating it on first use.
    /// Returns the record as it stands after the update.
    pub fn apply(&mut self, device_id: &str, reading: &SensorReading) -> AggregateRecord {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(device_id.to_string()).or_default();
        record.apply(reading);
        *record
    }

    pub fn snapshot(&self, device_id: &str) -> AggregateRecord {
        snapshot_of(&self.records, device_id)
    }

    pub fn view(&self) -> AggregateView {
        AggregateView {
            records: Arc::clone(&self.records),
        }
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Read-only, cloneable access for status reporters and other tasks.
#[derive(Debug, Clone)]
pub struct AggregateView {
    records: Arc<RwLock<Records>>,
}

impl AggregateView {
    pub fn snapshot(&self, device_id: &str) -> AggregateRecord {
        snapshot_of(&self.records, device_id)
    }

    pub fn snapshot_all(&self) -> Vec<(String, AggregateRecord)> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, record)| (id.clone(), *record))
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn snapshot_of(records: &RwLock<Records>, device_id: &str) -> AggregateRecord {
    records
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(device_id)
        .copied()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_is_all_unset() {
        let record = AggregateRecord::default();
        assert!(record.is_empty());
        assert_eq!(record.temperature, None);
        assert_eq!(record.heart_rate, None);
    }

    #[test]
    fn test_zero_is_a_real_reading() {
        let mut record = AggregateRecord::default();
        record.apply(&SensorReading::Co2 { ppm: 0.0 });
        assert_eq!(record.co2, Some(0));
        assert_eq!(record.set_field_count(), 1);
    }

    #[test]
    fn test_vitals_are_rounded() {
        let mut record = AggregateRecord::default();
        record.apply(&SensorReading::Vitals {
            heart_rate: 71.6,
            spo2: 97.4,
        });
        assert_eq!(record.heart_rate, Some(72));
        assert_eq!(record.spo2, Some(97));
    }

    #[test]
    fn test_view_sees_writer_updates() {
        let mut store = AggregateStore::new();
        let view = store.view();
        assert!(view.snapshot("hub").is_empty());

        store.apply("hub", &SensorReading::Pressure { hpa: 1013.25 });
        assert_eq!(view.snapshot("hub").pressure, Some(1013.25));
        assert_eq!(view.device_count(), 1);
    }
}
