//! Decoded BTHome measurement values.

use serde::ser::{Serialize, SerializeMap, SerializeTuple, Serializer};
use std::fmt;

/// Property name of the synthetic signal strength measurement.
pub const RSSI: &str = "RSSI";

/// One decoded reading.
///
/// Every variant serializes as a two element JSON array so consumers can
/// treat all properties alike:
/// - `Binary` → `[true, null]`
/// - `Numeric` → `[21.5, "°C"]` (unit may be `null`)
/// - `Text` → `["hello", null]` (text, raw bytes as hex, firmware versions)
/// - `Event` → `["press", null]` or `["rotate_left", 3]`
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Binary(bool),
    Numeric {
        value: f64,
        unit: Option<&'static str>,
    },
    Text(String),
    Event {
        name: &'static str,
        property: Option<u8>,
    },
}

impl Measurement {
    pub fn numeric(value: f64, unit: Option<&'static str>) -> Self {
        Measurement::Numeric { value, unit }
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut pair = serializer.serialize_tuple(2)?;
        match self {
            Measurement::Binary(value) => {
                pair.serialize_element(value)?;
                pair.serialize_element(&None::<&str>)?;
            }
            Measurement::Numeric { value, unit } => {
                pair.serialize_element(value)?;
                pair.serialize_element(unit)?;
            }
            Measurement::Text(text) => {
                pair.serialize_element(text)?;
                pair.serialize_element(&None::<&str>)?;
            }
            Measurement::Event { name, property } => {
                pair.serialize_element(name)?;
                pair.serialize_element(property)?;
            }
        }
        pair.end()
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::Binary(value) => write!(f, "{value}"),
            Measurement::Numeric {
                value,
                unit: Some(unit),
            } => write!(f, "{value} {unit}"),
            Measurement::Numeric { value, unit: None } => write!(f, "{value}"),
            Measurement::Text(text) => write!(f, "{text:?}"),
            Measurement::Event {
                name,
                property: Some(property),
            } => write!(f, "{name}({property})"),
            Measurement::Event {
                name,
                property: None,
            } => write!(f, "{name}"),
        }
    }
}

/// Measurements decoded from one frame, keyed by property name.
///
/// Insertion order is kept so the published JSON object follows the order in
/// which the sensor reported its values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurements {
    entries: Vec<(String, Measurement)>,
}

impl Measurements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a measurement, replacing any previous value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, measurement: Measurement) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) => *existing = measurement,
            None => self.entries.push((name, measurement)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Measurement> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, measurement)| measurement)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Measurement)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Serialize to the JSON object published to brokers.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for Measurements {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, measurement) in &self.entries {
            map.serialize_entry(name, measurement)?;
        }
        map.end()
    }
}

impl fmt::Display for Measurements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, measurement) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{name}={measurement}")?;
        }
        Ok(())
    }
}
