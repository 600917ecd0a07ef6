//! Validation of raw MQTT payloads into sensor readings.
//!
//! A reading is a `sensorId` plus the numeric fields of the JSON object;
//! everything else is logged and dropped. Records without a usable id are
//! rejected outright and never touch device state.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const SENSOR_ID_KEY: &str = "sensorId";

/// Largest BACnet device instance (22-bit object identifier field).
const MAX_INSTANCE: i64 = 0x003F_FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadingError {
    #[error("sensorId missing")]
    MissingId,
    #[error("sensorId could not be decoded as an integer")]
    MalformedId,
    #[error("sensorId {0} is negative")]
    NegativeId(i64),
    #[error("sensorId {0} exceeds the BACnet instance range")]
    IdOutOfRange(i64),
}

/// A validated sensor record, ready for the BACnet engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub sensor_id: u32,
    pub values: BTreeMap<String, f64>,
    /// Field names that were present but not numeric.
    pub dropped: Vec<String>,
}

/// Validate one decoded JSON object.
pub fn translate(data: &Map<String, Value>) -> Result<SensorReading, ReadingError> {
    let raw_id = data.get(SENSOR_ID_KEY).ok_or(ReadingError::MissingId)?;
    let sensor_id = coerce_sensor_id(raw_id)?;

    let mut values = BTreeMap::new();
    let mut dropped = Vec::new();
    for (key, value) in data {
        if key == SENSOR_ID_KEY {
            continue;
        }
        match value.as_f64() {
            Some(number) => {
                values.insert(key.clone(), number);
            }
            None => {
                warn!(sensor = sensor_id, field = %key, value = %value,
                      "non-numeric sensor field dropped");
                dropped.push(key.clone());
            }
        }
    }

    Ok(SensorReading {
        sensor_id,
        values,
        dropped,
    })
}

/// Integer coercion mirroring lenient producers: plain integers, integral
/// floats, and decimal strings all resolve; anything else is malformed.
fn coerce_sensor_id(value: &Value) -> Result<u32, ReadingError> {
    let id = match value {
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                integer
            } else if let Some(float) = number.as_f64() {
                if float.fract() != 0.0 || !float.is_finite() {
                    return Err(ReadingError::MalformedId);
                }
                float as i64
            } else {
                return Err(ReadingError::MalformedId);
            }
        }
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| ReadingError::MalformedId)?,
        _ => return Err(ReadingError::MalformedId),
    };

    if id < 0 {
        return Err(ReadingError::NegativeId(id));
    }
    if id > MAX_INSTANCE {
        return Err(ReadingError::IdOutOfRange(id));
    }
    Ok(id as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn numeric_fields_become_values() {
        let reading =
            translate(&object(json!({"sensorId": 1, "temp": 21.5, "hum": 40}))).unwrap();
        assert_eq!(reading.sensor_id, 1);
        assert_eq!(reading.values.len(), 2);
        assert_eq!(reading.values["temp"], 21.5);
        assert_eq!(reading.values["hum"], 40.0);
        assert!(reading.dropped.is_empty());
    }

    #[test]
    fn non_numeric_fields_are_dropped_not_fatal() {
        let reading =
            translate(&object(json!({"sensorId": 2, "t": 1.0, "bad": "oops"}))).unwrap();
        assert_eq!(reading.sensor_id, 2);
        assert_eq!(reading.values.len(), 1);
        assert_eq!(reading.values["t"], 1.0);
        assert_eq!(reading.dropped, vec!["bad".to_string()]);
    }

    #[test]
    fn booleans_are_not_numbers() {
        let reading = translate(&object(json!({"sensorId": 3, "on": true}))).unwrap();
        assert!(reading.values.is_empty());
        assert_eq!(reading.dropped, vec!["on".to_string()]);
    }

    #[test]
    fn missing_id_is_rejected() {
        assert_eq!(
            translate(&object(json!({"temp": 5}))).unwrap_err(),
            ReadingError::MissingId
        );
    }

    #[test]
    fn negative_id_is_rejected() {
        assert_eq!(
            translate(&object(json!({"sensorId": -3, "x": 1}))).unwrap_err(),
            ReadingError::NegativeId(-3)
        );
    }

    #[test]
    fn malformed_ids_are_rejected() {
        for id in [json!("abc"), json!(1.5), json!([1]), json!(null)] {
            let mut map = Map::new();
            map.insert(SENSOR_ID_KEY.to_string(), id);
            assert!(matches!(
                translate(&map).unwrap_err(),
                ReadingError::MalformedId
            ));
        }
    }

    #[test]
    fn string_and_float_ids_coerce_like_integers() {
        let reading = translate(&object(json!({"sensorId": "7", "x": 1}))).unwrap();
        assert_eq!(reading.sensor_id, 7);
        let reading = translate(&object(json!({"sensorId": 7.0, "x": 1}))).unwrap();
        assert_eq!(reading.sensor_id, 7);
    }

    #[test]
    fn oversized_id_is_rejected() {
        assert_eq!(
            translate(&object(json!({"sensorId": 4_194_304, "x": 1}))).unwrap_err(),
            ReadingError::IdOutOfRange(4_194_304)
        );
    }
}
