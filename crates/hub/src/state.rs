use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::audit::AuditEntry;
use crate::gate::WeatherSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub weather: HashMap<String, WeatherObservation>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct NodeState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub readings: Vec<SensorReading>,
}

#[derive(Clone, Serialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub raw: i64,
}

/// Latest weather snapshot received for a zone.
#[derive(Clone, Serialize)]
pub struct WeatherObservation {
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    #[serde(flatten)]
    pub snapshot: WeatherSnapshot,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Weather,
    Transition,
    Scheduler,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Status snapshot (published on hub/status)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub weather: HashMap<String, WeatherObservation>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            nodes: HashMap::new(),
            weather: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a telemetry reading from a node.
    pub fn record_reading(&mut self, node_id: &str, readings: Vec<SensorReading>) {
        let detail = format!(
            "{node_id}: {}",
            readings
                .iter()
                .map(|r| format!("{}={}", r.sensor_id, r.raw))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.nodes.insert(
            node_id.to_string(),
            NodeState {
                last_seen: OffsetDateTime::now_utc(),
                readings,
            },
        );

        self.push_event(EventKind::Reading, detail);
    }

    /// Store the latest weather observation for a zone.
    pub fn record_weather(
        &mut self,
        zone_id: &str,
        observed_at: OffsetDateTime,
        snapshot: WeatherSnapshot,
    ) {
        self.weather.insert(
            zone_id.to_string(),
            WeatherObservation {
                observed_at,
                snapshot,
            },
        );
        self.push_event(
            EventKind::Weather,
            format!(
                "{zone_id}: rain {} mm, {} °C, wind {} km/h",
                snapshot.precipitation_mm, snapshot.temperature_c, snapshot.wind_speed_kmh
            ),
        );
    }

    /// Weather for a zone if observed within `max_age` of `now`.
    pub fn fresh_weather(
        &self,
        zone_id: &str,
        now: OffsetDateTime,
        max_age: Duration,
    ) -> Option<WeatherSnapshot> {
        self.weather
            .get(zone_id)
            .filter(|w| now - w.observed_at <= max_age)
            .map(|w| w.snapshot)
    }

    /// Record an accepted workflow transition.
    pub fn record_transition(&mut self, entry: &AuditEntry) {
        self.push_event(EventKind::Transition, entry.summary());
    }

    /// Record a scheduler decision.
    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            nodes: self.nodes.clone(),
            weather: self.weather.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
