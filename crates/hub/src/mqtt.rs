use serde::Deserialize;

use crate::gate::WeatherSnapshot;

/// Retained status snapshot.
pub(crate) const STATUS_TOPIC: &str = "hub/status";

/// Every topic the hub listens on.
pub(crate) const SUBSCRIPTIONS: &[&str] = &[
    "tele/+/reading",
    "weather/+/obs",
    "session/+/cmd",
    "alert/+/cmd",
    "program/+/cmd",
    "zone/+/cmd",
    "system/+/cmd",
    "session/new",
    "alert/raise",
];

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_id: String,
    pub(crate) raw: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) readings: Vec<Reading>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WeatherMsg {
    pub(crate) ts: i64,
    pub(crate) precipitation_mm: f64,
    pub(crate) temperature_c: f64,
    pub(crate) wind_speed_kmh: f64,
}

impl WeatherMsg {
    pub(crate) fn snapshot(&self) -> WeatherSnapshot {
        WeatherSnapshot {
            precipitation_mm: self.precipitation_mm,
            temperature_c: self.temperature_c,
            wind_speed_kmh: self.wind_speed_kmh,
        }
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Middle segment of "<prefix>/<id>/<suffix>".
fn middle_segment<'a>(topic: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == prefix && parts[2] == suffix && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    middle_segment(topic, "tele", "reading")
}

/// Extract zone_id from "weather/<zone_id>/obs".
pub(crate) fn extract_weather_zone(topic: &str) -> Option<&str> {
    middle_segment(topic, "weather", "obs")
}

/// Where a command message is addressed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CommandTopic<'a> {
    Session(i64),
    Alert(i64),
    Program(i64),
    Zone(&'a str),
    System(&'a str),
    NewSession,
    RaiseAlert,
}

impl<'a> CommandTopic<'a> {
    /// `Ok(None)` when the topic is not a command topic; `Err` when it is
    /// one but the record id is malformed.
    pub(crate) fn parse(topic: &'a str) -> Result<Option<Self>, String> {
        match topic {
            "session/new" => return Ok(Some(Self::NewSession)),
            "alert/raise" => return Ok(Some(Self::RaiseAlert)),
            _ => {}
        }

        let numeric = |id: &str| {
            id.parse::<i64>()
                .map_err(|_| format!("bad record id '{id}' in topic {topic}"))
        };

        if let Some(id) = middle_segment(topic, "session", "cmd") {
            return numeric(id).map(|id| Some(Self::Session(id)));
        }
        if let Some(id) = middle_segment(topic, "alert", "cmd") {
            return numeric(id).map(|id| Some(Self::Alert(id)));
        }
        if let Some(id) = middle_segment(topic, "program", "cmd") {
            return numeric(id).map(|id| Some(Self::Program(id)));
        }
        if let Some(id) = middle_segment(topic, "zone", "cmd") {
            return Ok(Some(Self::Zone(id)));
        }
        if let Some(id) = middle_segment(topic, "system", "cmd") {
            return Ok(Some(Self::System(id)));
        }
        Ok(None)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
