use sensorhub::error::DecodeError;
use sensorhub::radio::*;

fn all_kinds() -> Vec<SensorReading> {
    vec![
        SensorReading::TemperatureHumidity {
            temperature: -12.25,
            humidity: 63.5,
        },
        SensorReading::Illuminance { lux: 321.75 },
        SensorReading::Pressure { hpa: 1013.25 },
        SensorReading::Vitals {
            heart_rate: 72.4,
            spo2: 97.6,
        },
        SensorReading::Co2 { ppm: 612.0 },
        SensorReading::Breathing { rate: 15.8 },
    ]
}

#[test]
fn test_every_kind_decodes_bit_exact() {
    for reading in all_kinds() {
        let frame = encode(&reading);
        assert_eq!(frame.len(), reading.kind().frame_size());

        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, reading);
        // Same bytes back out, not just approximately equal values.
        assert_eq!(encode(&decoded), frame);
    }
}

#[test]
fn test_temperature_frame_layout() {
    let mut frame = vec![0x00];
    frame.extend_from_slice(&21.5f32.to_le_bytes());
    frame.extend_from_slice(&40.0f32.to_le_bytes());

    assert_eq!(
        decode(&frame),
        Ok(SensorReading::TemperatureHumidity {
            temperature: 21.5,
            humidity: 40.0,
        })
    );
}

#[test]
fn test_short_and_long_frames_rejected() {
    let frame = encode(&SensorReading::TemperatureHumidity {
        temperature: 21.5,
        humidity: 40.0,
    });

    assert_eq!(
        decode(&frame[..5]),
        Err(DecodeError::SizeMismatch {
            kind: SensorKind::TemperatureHumidity,
            expected: 9,
            actual: 5,
        })
    );

    let mut long = frame.to_vec();
    long.push(0);
    assert_eq!(
        decode(&long),
        Err(DecodeError::SizeMismatch {
            kind: SensorKind::TemperatureHumidity,
            expected: 9,
            actual: 10,
        })
    );

    // A tag on its own is never a reading.
    assert!(matches!(
        decode(&[SensorKind::Co2.tag()]),
        Err(DecodeError::SizeMismatch { actual: 1, .. })
    ));
}

#[test]
fn test_unknown_and_empty_frames_rejected() {
    assert_eq!(decode(&[]), Err(DecodeError::Empty));
    assert_eq!(decode(&[0x06, 0, 0, 0, 0]), Err(DecodeError::UnknownKind(6)));
    assert_eq!(decode(&[0xFF; 9]), Err(DecodeError::UnknownKind(0xFF)));
}

#[test]
fn test_non_finite_values_rejected() {
    let mut frame = vec![SensorKind::Pressure.tag()];
    frame.extend_from_slice(&f32::NAN.to_le_bytes());
    assert_eq!(
        decode(&frame),
        Err(DecodeError::NonFinite {
            kind: SensorKind::Pressure
        })
    );

    let mut frame = vec![SensorKind::Vitals.tag()];
    frame.extend_from_slice(&72.0f32.to_le_bytes());
    frame.extend_from_slice(&f32::INFINITY.to_le_bytes());
    assert!(decode(&frame).is_err());
}

#[test]
fn test_kind_tags_are_stable() {
    for (expected, kind) in SensorKind::ALL.iter().enumerate() {
        assert_eq!(usize::from(kind.tag()), expected);
        assert_eq!(SensorKind::from_tag(kind.tag()), Ok(*kind));
    }
}

#[test]
fn test_radio_frame_carries_source() {
    let mac: MacAddress = "24:6f:28:00:00:01".parse().unwrap();
    let reading = SensorReading::Illuminance { lux: 88.0 };
    let frame = RadioFrame::new(mac, &encode(&reading)).unwrap();

    assert_eq!(frame.source, mac);
    assert_eq!(frame.decode(), Ok(reading));
}
