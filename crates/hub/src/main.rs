mod alert;
mod audit;
mod clock;
mod commands;
mod config;
mod db;
mod error;
mod gate;
mod mqtt;
mod notify;
mod program;
mod scheduler;
mod sequence;
mod service;
mod session;
mod state;
mod zone;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{collections::HashMap, env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit::DbAuditLog;
use clock::{from_unix, SystemClock};
use db::{compute_moisture, Db, SensorConfig};
use error::IrrigationError;
use mqtt::{
    extract_node_id, extract_weather_zone, CommandTopic, ReadingMsg, WeatherMsg, SUBSCRIPTIONS,
};
use notify::MqttNotifier;
use service::IrrigationService;
use state::{SensorReading, SharedState, SystemState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (settings, sequences, master data, programs) ────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, &db).await?;

    let zones = db.load_zones().await?;
    if zones.is_empty() {
        warn!("no zones configured in the database");
    }

    // Keys are qualified IDs: "node-a/s1", "node-b/s2", etc.
    let sensors = db.load_sensors().await?;
    let sensor_map: HashMap<String, SensorConfig> = sensors
        .into_iter()
        .map(|s| (s.sensor_id.clone(), s))
        .collect();

    info!(zones = zones.len(), sensors = sensor_map.len(), "db ready");

    // ── Shared state (ephemeral, published on hub/status) ───────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("irrigation-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 50);

    for topic in SUBSCRIPTIONS {
        client.subscribe(*topic, QoS::AtLeastOnce).await?;
    }
    info!(topics = ?SUBSCRIPTIONS, "hub subscribed");

    // ── Service + scheduler ─────────────────────────────────────────
    let svc = Arc::new(IrrigationService::new(
        db.clone(),
        Arc::new(SystemClock),
        Arc::new(DbAuditLog::new(db.clone(), Arc::clone(&shared))),
        Arc::new(MqttNotifier::new(client.clone())),
        cfg.hub.clone(),
    ));

    {
        let svc = Arc::clone(&svc);
        let client = client.clone();
        let shared = Arc::clone(&shared);
        let tick = Duration::from_secs(cfg.hub.tick_sec);
        tokio::spawn(async move {
            scheduler::run(svc, client, shared, tick).await;
        });
    }

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();
                let payload = p.payload.to_vec();

                if let Some(node_id) = extract_node_id(&topic) {
                    handle_reading(&db, &shared, &sensor_map, node_id, &payload).await;
                } else if let Some(zone_id) = extract_weather_zone(&topic) {
                    handle_weather(&shared, zone_id, &payload).await;
                } else {
                    match CommandTopic::parse(&topic) {
                        Ok(Some(cmd_topic)) => {
                            handle_command(&svc, &shared, cmd_topic, &payload).await;
                        }
                        Ok(None) => warn!(%topic, "unhandled topic"),
                        Err(msg) => {
                            warn!("{msg}");
                            let mut st = shared.write().await;
                            st.record_error(msg);
                        }
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Persist a telemetry message and mirror it into the shared state.
async fn handle_reading(
    db: &Db,
    shared: &SharedState,
    sensor_map: &HashMap<String, SensorConfig>,
    node_id: &str,
    payload: &[u8],
) {
    let msg = match serde_json::from_slice::<ReadingMsg>(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(node = %node_id, "bad telemetry json: {e}");
            let mut st = shared.write().await;
            st.record_error(format!("bad telemetry json from {node_id}: {e}"));
            return;
        }
    };

    // Qualify sensor_id with node_id so each node's local channel names
    // ("s1", "s2") become unique.
    for r in &msg.readings {
        let qualified_id = format!("{node_id}/{}", r.sensor_id);
        let Some(sc) = sensor_map.get(&qualified_id) else {
            warn!(sensor = %qualified_id, "unknown sensor, skipping db write");
            continue;
        };
        let moisture = compute_moisture(r.raw, sc.raw_dry, sc.raw_wet);
        if let Err(e) = db.insert_reading(msg.ts, &qualified_id, r.raw, moisture).await {
            error!(sensor = %qualified_id, "insert_reading failed: {e:#}");
        }
    }

    let readings: Vec<SensorReading> = msg
        .readings
        .iter()
        .map(|r| SensorReading {
            sensor_id: r.sensor_id.clone(),
            raw: r.raw,
        })
        .collect();
    let mut st = shared.write().await;
    st.record_reading(node_id, readings);
}

async fn handle_weather(shared: &SharedState, zone_id: &str, payload: &[u8]) {
    let parsed = serde_json::from_slice::<WeatherMsg>(payload)
        .map_err(anyhow::Error::from)
        .and_then(|msg| Ok((from_unix(msg.ts)?, msg.snapshot())));

    let mut st = shared.write().await;
    match parsed {
        Ok((observed_at, snapshot)) => st.record_weather(zone_id, observed_at, snapshot),
        Err(e) => {
            warn!(zone = %zone_id, "bad weather message: {e:#}");
            st.record_error(format!("bad weather message for {zone_id}: {e:#}"));
        }
    }
}

/// Run an operator command. Refusals are logged and recorded, never fatal.
async fn handle_command(
    svc: &IrrigationService,
    shared: &SharedState,
    topic: CommandTopic<'_>,
    payload: &[u8],
) {
    let target = format!("{topic:?}");
    match commands::dispatch(svc, shared, topic, payload).await {
        Ok(summary) => {
            info!(%target, "{summary}");
            let mut st = shared.write().await;
            st.record_system(summary);
        }
        Err(e) => {
            match e.downcast_ref::<IrrigationError>() {
                Some(domain) => warn!(%target, "command refused: {domain}"),
                None => error!(%target, "command failed: {e:#}"),
            }
            let mut st = shared.write().await;
            st.record_error(format!("{target}: {e:#}"));
        }
    }
}
