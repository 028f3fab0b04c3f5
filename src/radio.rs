//! Radio wire format shared with the sensor nodes.
//!
//! Every frame is a one-byte kind tag followed directly by the kind's payload,
//! little-endian IEEE-754 `f32` fields with no padding anywhere:
//!
//! ```text
//! tag 0  TemperatureHumidity  [0x00][temperature f32][humidity f32]   9 bytes
//! tag 1  Illuminance          [0x01][lux f32]                         5 bytes
//! tag 2  Pressure             [0x02][hpa f32]                         5 bytes
//! tag 3  Vitals               [0x03][heart_rate f32][spo2 f32]        9 bytes
//! tag 4  Co2                  [0x04][ppm f32]                         5 bytes
//! tag 5  Breathing            [0x05][rate f32]                        5 bytes
//! ```
//!
//! Fields are read and written one at a time, so the layout does not depend
//! on how the host compiler would align an equivalent struct.

use crate::error::{DecodeError, MacParseError};
use core::fmt;
use core::str::FromStr;
use heapless::Vec;
use serde::{Deserialize, Serialize, Serializer};
use static_assertions::const_assert;

/// Largest payload the radio link carries in a single frame.
pub const MAX_RADIO_PAYLOAD: usize = 250;
pub const TAG_SIZE: usize = 1;
pub const FIELD_SIZE: usize = core::mem::size_of::<f32>();
/// Largest frame any known kind encodes to.
pub const MAX_ENCODED_SIZE: usize = TAG_SIZE + 2 * FIELD_SIZE;

const_assert!(FIELD_SIZE == 4);
const_assert!(MAX_ENCODED_SIZE <= MAX_RADIO_PAYLOAD);

pub type EncodedFrame = Vec<u8, MAX_ENCODED_SIZE>;
pub type RadioPayload = Vec<u8, MAX_RADIO_PAYLOAD>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or(MacParseError)?;
            if part.len() != 2 {
                return Err(MacParseError);
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| MacParseError)?;
        }
        if parts.next().is_some() {
            return Err(MacParseError);
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Raw bytes as received from the radio, tagged with the sender address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    pub source: MacAddress,
    pub payload: RadioPayload,
}

impl RadioFrame {
    /// Returns `None` if `payload` is larger than a radio frame can be.
    pub fn new(source: MacAddress, payload: &[u8]) -> Option<Self> {
        Some(Self {
            source,
            payload: Vec::from_slice(payload).ok()?,
        })
    }

    pub fn decode(&self) -> Result<SensorReading, DecodeError> {
        decode(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SensorKind {
    TemperatureHumidity = 0,
    Illuminance = 1,
    Pressure = 2,
    Vitals = 3,
    Co2 = 4,
    Breathing = 5,
}

impl SensorKind {
    pub const ALL: [SensorKind; 6] = [
        SensorKind::TemperatureHumidity,
        SensorKind::Illuminance,
        SensorKind::Pressure,
        SensorKind::Vitals,
        SensorKind::Co2,
        SensorKind::Breathing,
    ];

    pub fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(SensorKind::TemperatureHumidity),
            1 => Ok(SensorKind::Illuminance),
            2 => Ok(SensorKind::Pressure),
            3 => Ok(SensorKind::Vitals),
            4 => Ok(SensorKind::Co2),
            5 => Ok(SensorKind::Breathing),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub const fn field_count(self) -> usize {
        match self {
            SensorKind::TemperatureHumidity | SensorKind::Vitals => 2,
            SensorKind::Illuminance
            | SensorKind::Pressure
            | SensorKind::Co2
            | SensorKind::Breathing => 1,
        }
    }

    /// Exact on-air size of a frame of this kind, tag included.
    pub const fn frame_size(self) -> usize {
        TAG_SIZE + self.field_count() * FIELD_SIZE
    }
}

const_assert!(SensorKind::TemperatureHumidity.frame_size() == 9);
const_assert!(SensorKind::Pressure.frame_size() == 5);

/// A decoded sensor reading. Immutable once produced by [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorReading {
    TemperatureHumidity { temperature: f32, humidity: f32 },
    Illuminance { lux: f32 },
    Pressure { hpa: f32 },
    Vitals { heart_rate: f32, spo2: f32 },
    Co2 { ppm: f32 },
    Breathing { rate: f32 },
}

impl SensorReading {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorReading::TemperatureHumidity { .. } => SensorKind::TemperatureHumidity,
            SensorReading::Illuminance { .. } => SensorKind::Illuminance,
            SensorReading::Pressure { .. } => SensorKind::Pressure,
            SensorReading::Vitals { .. } => SensorKind::Vitals,
            SensorReading::Co2 { .. } => SensorKind::Co2,
            SensorReading::Breathing { .. } => SensorKind::Breathing,
        }
    }

    fn fields(&self) -> ([f32; 2], usize) {
        match *self {
            SensorReading::TemperatureHumidity {
                temperature,
                humidity,
            } => ([temperature, humidity], 2),
            SensorReading::Vitals { heart_rate, spo2 } => ([heart_rate, spo2], 2),
            SensorReading::Illuminance { lux } => ([lux, 0.0], 1),
            SensorReading::Pressure { hpa } => ([hpa, 0.0], 1),
            SensorReading::Co2 { ppm } => ([ppm, 0.0], 1),
            SensorReading::Breathing { rate } => ([rate, 0.0], 1),
        }
    }
}

/// Decode one radio payload into a typed reading.
///
/// The length must match the declared kind exactly; nothing is returned for a
/// short or long frame, so a reading is never partially populated.
pub fn decode(frame: &[u8]) -> Result<SensorReading, DecodeError> {
    let (&tag, body) = frame.split_first().ok_or(DecodeError::Empty)?;
    let kind = SensorKind::from_tag(tag)?;

    if frame.len() != kind.frame_size() {
        return Err(DecodeError::SizeMismatch {
            kind,
            expected: kind.frame_size(),
            actual: frame.len(),
        });
    }

    let field = |index: usize| -> Result<f32, DecodeError> {
        let start = index * FIELD_SIZE;
        let mut raw = [0u8; FIELD_SIZE];
        raw.copy_from_slice(&body[start..start + FIELD_SIZE]);
        let value = f32::from_le_bytes(raw);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(DecodeError::NonFinite { kind })
        }
    };

    let reading = match kind {
        SensorKind::TemperatureHumidity => SensorReading::TemperatureHumidity {
            temperature: field(0)?,
            humidity: field(1)?,
        },
        SensorKind::Illuminance => SensorReading::Illuminance { lux: field(0)? },
        SensorKind::Pressure => SensorReading::Pressure { hpa: field(0)? },
        SensorKind::Vitals => SensorReading::Vitals {
            heart_rate: field(0)?,
            spo2: field(1)?,
        },
        SensorKind::Co2 => SensorReading::Co2 { ppm: field(0)? },
        SensorKind::Breathing => SensorReading::Breathing { rate: field(0)? },
    };

    Ok(reading)
}

/// Encode a reading the way a sensor node puts it on air.
pub fn encode(reading: &SensorReading) -> EncodedFrame {
    let mut out = EncodedFrame::new();
    let (values, count) = reading.fields();

    // Capacity is MAX_ENCODED_SIZE, which fits the largest kind.
    let _ = out.push(reading.kind().tag());
    for value in &values[..count] {
        let _ = out.extend_from_slice(&value.to_le_bytes());
    }

    out
}
