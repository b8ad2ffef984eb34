use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::str::FromStr;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::alert::{plan_recurrence, Alert, AlertPriority, AlertState, AlertType, Recurrence};
use crate::audit::AuditEntry;
use crate::clock::from_unix;
use crate::error::IrrigationError;
use crate::program::{FrequencyType, Program, ProgramPriority, ProgramState, ProgramType, Weekdays};
use crate::sequence::{format_code, SequenceKind};
use crate::session::{EquipmentStatus, Session, SessionResult, SessionState, SessionType};
use crate::zone::{IrrigationSystem, IrrigationType, Parcel, SystemStatus, Zone, ZoneState};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorConfig {
    pub sensor_id: String,
    pub node_id: String,
    pub zone_id: String,
    pub raw_dry: i64,
    pub raw_wet: i64,
}

#[derive(Debug, Clone)]
pub struct SequenceConfig {
    pub kind: SequenceKind,
    pub prefix: String,
    pub padding: i64,
    pub start: i64,
}

/// Convert a raw ADC reading to a 0.0..=1.0 moisture fraction using
/// the sensor's dry/wet calibration endpoints.  Result is clamped so
/// out-of-range readings don't produce nonsensical values.
pub fn compute_moisture(raw: i64, raw_dry: i64, raw_wet: i64) -> f32 {
    let range = raw_dry - raw_wet;
    if range == 0 {
        return 0.0;
    }
    let m = (raw_dry - raw) as f64 / range as f64;
    m.clamp(0.0, 1.0) as f32
}

// ---------------------------------------------------------------------------
// Column encodings
// ---------------------------------------------------------------------------

pub fn date_to_text(d: Date) -> Result<String> {
    d.format(format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("failed to format date {d}"))
}

pub fn date_from_text(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid date '{s}' (expected YYYY-MM-DD)"))
}

fn opt_date_to_text(d: Option<Date>) -> Result<Option<String>> {
    d.map(date_to_text).transpose()
}

fn opt_date_from_text(s: Option<String>) -> Result<Option<Date>> {
    s.as_deref().map(date_from_text).transpose()
}

fn opt_unix(ts: Option<i64>) -> Result<Option<OffsetDateTime>> {
    ts.map(from_unix).transpose()
}

fn opt_ts(t: Option<OffsetDateTime>) -> Option<i64> {
    t.map(|t| t.unix_timestamp())
}

fn conflict(entity: &'static str, id: i64) -> anyhow::Error {
    IrrigationError::Conflict {
        entity,
        key: id.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct SystemRow {
    system_id: String,
    code: String,
    name: String,
    irrigation_type: IrrigationType,
    max_flow_rate: Option<f64>,
    status: SystemStatus,
    last_maintenance: Option<String>,
    maintenance_frequency_days: i64,
}

impl TryFrom<SystemRow> for IrrigationSystem {
    type Error = anyhow::Error;

    fn try_from(r: SystemRow) -> Result<Self> {
        Ok(Self {
            system_id: r.system_id,
            code: r.code,
            name: r.name,
            irrigation_type: r.irrigation_type,
            max_flow_rate: r.max_flow_rate,
            status: r.status,
            last_maintenance: opt_date_from_text(r.last_maintenance)?,
            maintenance_frequency_days: r.maintenance_frequency_days,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ZoneRow {
    zone_id: String,
    code: String,
    name: String,
    parcel_id: String,
    system_id: String,
    surface_ha: f64,
    water_requirement_daily: f64,
    water_flow_rate: Option<f64>,
    irrigation_frequency_days: i64,
    irrigation_duration_min: i64,
    state: ZoneState,
}

impl From<ZoneRow> for Zone {
    fn from(r: ZoneRow) -> Self {
        Self {
            zone_id: r.zone_id,
            code: r.code,
            name: r.name,
            parcel_id: r.parcel_id,
            system_id: r.system_id,
            surface_ha: r.surface_ha,
            water_requirement_daily: r.water_requirement_daily,
            water_flow_rate: r.water_flow_rate,
            irrigation_frequency_days: r.irrigation_frequency_days,
            irrigation_duration_min: r.irrigation_duration_min,
            state: r.state,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProgramRow {
    id: i64,
    code: String,
    name: String,
    zone_id: String,
    system_id: String,
    program_type: ProgramType,
    priority: ProgramPriority,
    start_date: String,
    end_date: Option<String>,
    frequency_type: FrequencyType,
    frequency_days: Option<i64>,
    weekdays: i64,
    preferred_start_time: f64,
    max_start_time: f64,
    duration_minutes: i64,
    water_volume_target: Option<f64>,
    water_flow_rate: Option<f64>,
    soil_moisture_threshold: f64,
    temperature_min: Option<f64>,
    temperature_max: Option<f64>,
    wind_speed_max: Option<f64>,
    stop_if_rain: bool,
    rain_threshold_mm: f64,
    stop_if_wet_soil: bool,
    use_soil_analysis: bool,
    state: ProgramState,
    version: i64,
}

impl TryFrom<ProgramRow> for Program {
    type Error = anyhow::Error;

    fn try_from(r: ProgramRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            code: r.code,
            name: r.name,
            zone_id: r.zone_id,
            system_id: r.system_id,
            program_type: r.program_type,
            priority: r.priority,
            start_date: date_from_text(&r.start_date)?,
            end_date: opt_date_from_text(r.end_date)?,
            frequency_type: r.frequency_type,
            frequency_days: r.frequency_days,
            weekdays: Weekdays::from_bits(r.weekdays),
            preferred_start_time: r.preferred_start_time,
            max_start_time: r.max_start_time,
            duration_minutes: r.duration_minutes,
            water_volume_target: r.water_volume_target,
            water_flow_rate: r.water_flow_rate,
            soil_moisture_threshold: r.soil_moisture_threshold,
            temperature_min: r.temperature_min,
            temperature_max: r.temperature_max,
            wind_speed_max: r.wind_speed_max,
            stop_if_rain: r.stop_if_rain,
            rain_threshold_mm: r.rain_threshold_mm,
            stop_if_wet_soil: r.stop_if_wet_soil,
            use_soil_analysis: r.use_soil_analysis,
            state: r.state,
            version: r.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    code: String,
    name: String,
    zone_id: String,
    system_id: String,
    program_id: Option<i64>,
    session_type: SessionType,
    planned_start: Option<i64>,
    duration_minutes_planned: i64,
    actual_start: Option<i64>,
    actual_end: Option<i64>,
    water_volume_target: Option<f64>,
    water_consumed: f64,
    unit_water_price: f64,
    energy_cost: f64,
    labor_cost: f64,
    equipment_status: EquipmentStatus,
    operator: Option<String>,
    issues: Option<String>,
    state: SessionState,
    result: Option<SessionResult>,
    version: i64,
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(r: SessionRow) -> Result<Self> {
        let mut s = Self {
            id: r.id,
            code: r.code,
            name: r.name,
            zone_id: r.zone_id,
            system_id: r.system_id,
            program_id: r.program_id,
            session_type: r.session_type,
            planned_start: opt_unix(r.planned_start)?,
            duration_minutes_planned: r.duration_minutes_planned,
            actual_start: opt_unix(r.actual_start)?,
            actual_end: opt_unix(r.actual_end)?,
            water_volume_target: r.water_volume_target,
            water_consumed: r.water_consumed,
            unit_water_price: r.unit_water_price,
            energy_cost: r.energy_cost,
            labor_cost: r.labor_cost,
            equipment_status: r.equipment_status,
            operator: r.operator,
            issues: r.issues,
            state: r.state,
            result: r.result,
            version: r.version,
            metrics: Default::default(),
        };
        s.refresh();
        Ok(s)
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    code: String,
    name: String,
    description: Option<String>,
    alert_type: AlertType,
    priority: AlertPriority,
    system_id: Option<String>,
    zone_id: Option<String>,
    session_id: Option<i64>,
    program_id: Option<i64>,
    trigger_value: Option<f64>,
    threshold_value: Option<f64>,
    recommended_action: Option<String>,
    detected_at: i64,
    acknowledged_at: Option<i64>,
    resolved_at: Option<i64>,
    assigned_to: Option<String>,
    acknowledged_by: Option<String>,
    resolved_by: Option<String>,
    resolution_notes: Option<String>,
    state: AlertState,
    is_recurring: bool,
    recurrence_count: i64,
    parent_id: Option<i64>,
    notification_count: i64,
    version: i64,
}

impl TryFrom<AlertRow> for Alert {
    type Error = anyhow::Error;

    fn try_from(r: AlertRow) -> Result<Self> {
        Ok(Self {
            id: r.id,
            code: r.code,
            name: r.name,
            description: r.description,
            alert_type: r.alert_type,
            priority: r.priority,
            system_id: r.system_id,
            zone_id: r.zone_id,
            session_id: r.session_id,
            program_id: r.program_id,
            trigger_value: r.trigger_value,
            threshold_value: r.threshold_value,
            recommended_action: r.recommended_action,
            detected_at: from_unix(r.detected_at)?,
            acknowledged_at: opt_unix(r.acknowledged_at)?,
            resolved_at: opt_unix(r.resolved_at)?,
            assigned_to: r.assigned_to,
            acknowledged_by: r.acknowledged_by,
            resolved_by: r.resolved_by,
            resolution_notes: r.resolution_notes,
            state: r.state,
            is_recurring: r.is_recurring,
            recurrence_count: r.recurrence_count,
            parent_id: r.parent_id,
            notification_count: r.notification_count,
            version: r.version,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/agri-irrigation/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Parcels
    // ----------------------------

    pub async fn upsert_parcel(&self, p: &Parcel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO parcels (parcel_id, name, surface_ha)
            VALUES (?, ?, ?)
            ON CONFLICT(parcel_id) DO UPDATE SET
              name=excluded.name,
              surface_ha=excluded.surface_ha
            "#,
        )
        .bind(&p.parcel_id)
        .bind(&p.name)
        .bind(p.surface_ha)
        .execute(&self.pool)
        .await
        .context("upsert_parcel failed")?;
        Ok(())
    }

    pub async fn get_parcel(&self, parcel_id: &str) -> Result<Option<Parcel>> {
        let row: Option<(String, String, f64)> =
            sqlx::query_as("SELECT parcel_id, name, surface_ha FROM parcels WHERE parcel_id = ?")
                .bind(parcel_id)
                .fetch_optional(&self.pool)
                .await
                .context("get_parcel failed")?;

        Ok(row.map(|(parcel_id, name, surface_ha)| Parcel {
            parcel_id,
            name,
            surface_ha,
        }))
    }

    // ----------------------------
    // Irrigation systems
    // ----------------------------

    pub async fn upsert_system(&self, s: &IrrigationSystem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO irrigation_systems (
              system_id, code, name, irrigation_type, max_flow_rate,
              status, last_maintenance, maintenance_frequency_days
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(system_id) DO UPDATE SET
              code=excluded.code,
              name=excluded.name,
              irrigation_type=excluded.irrigation_type,
              max_flow_rate=excluded.max_flow_rate,
              status=excluded.status,
              last_maintenance=excluded.last_maintenance,
              maintenance_frequency_days=excluded.maintenance_frequency_days
            "#,
        )
        .bind(&s.system_id)
        .bind(&s.code)
        .bind(&s.name)
        .bind(s.irrigation_type)
        .bind(s.max_flow_rate)
        .bind(s.status)
        .bind(opt_date_to_text(s.last_maintenance)?)
        .bind(s.maintenance_frequency_days)
        .execute(&self.pool)
        .await
        .context("upsert_system failed")?;
        Ok(())
    }

    pub async fn get_system(&self, system_id: &str) -> Result<Option<IrrigationSystem>> {
        let row: Option<SystemRow> =
            sqlx::query_as("SELECT * FROM irrigation_systems WHERE system_id = ?")
                .bind(system_id)
                .fetch_optional(&self.pool)
                .await
                .context("get_system failed")?;
        row.map(IrrigationSystem::try_from).transpose()
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn upsert_zone(&self, z: &Zone) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (
              zone_id, code, name, parcel_id, system_id, surface_ha,
              water_requirement_daily, water_flow_rate,
              irrigation_frequency_days, irrigation_duration_min, state
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET
              code=excluded.code,
              name=excluded.name,
              parcel_id=excluded.parcel_id,
              system_id=excluded.system_id,
              surface_ha=excluded.surface_ha,
              water_requirement_daily=excluded.water_requirement_daily,
              water_flow_rate=excluded.water_flow_rate,
              irrigation_frequency_days=excluded.irrigation_frequency_days,
              irrigation_duration_min=excluded.irrigation_duration_min,
              state=excluded.state
            "#,
        )
        .bind(&z.zone_id)
        .bind(&z.code)
        .bind(&z.name)
        .bind(&z.parcel_id)
        .bind(&z.system_id)
        .bind(z.surface_ha)
        .bind(z.water_requirement_daily)
        .bind(z.water_flow_rate)
        .bind(z.irrigation_frequency_days)
        .bind(z.irrigation_duration_min)
        .bind(z.state)
        .execute(&self.pool)
        .await
        .context("upsert_zone failed")?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        let rows: Vec<ZoneRow> = sqlx::query_as("SELECT * FROM zones ORDER BY zone_id")
            .fetch_all(&self.pool)
            .await
            .context("load_zones failed")?;
        Ok(rows.into_iter().map(Zone::from).collect())
    }

    pub async fn get_zone(&self, zone_id: &str) -> Result<Option<Zone>> {
        let row: Option<ZoneRow> = sqlx::query_as("SELECT * FROM zones WHERE zone_id = ?")
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_zone failed")?;
        Ok(row.map(Zone::from))
    }

    // ----------------------------
    // Sensor config
    // ----------------------------

    pub async fn upsert_sensor(&self, s: &SensorConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (sensor_id, node_id, zone_id, raw_dry, raw_wet)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              node_id=excluded.node_id,
              zone_id=excluded.zone_id,
              raw_dry=excluded.raw_dry,
              raw_wet=excluded.raw_wet
            "#,
        )
        .bind(&s.sensor_id)
        .bind(&s.node_id)
        .bind(&s.zone_id)
        .bind(s.raw_dry)
        .bind(s.raw_wet)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn load_sensors(&self) -> Result<Vec<SensorConfig>> {
        sqlx::query_as(
            "SELECT sensor_id, node_id, zone_id, raw_dry, raw_wet FROM sensors ORDER BY sensor_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_sensors failed")
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(
        &self,
        ts: i64,
        sensor_id: &str,
        raw: i64,
        moisture: f32,
    ) -> Result<()> {
        sqlx::query("INSERT INTO readings (ts, sensor_id, raw, moisture) VALUES (?, ?, ?, ?)")
            .bind(ts)
            .bind(sensor_id)
            .bind(raw)
            .bind(moisture as f64)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest moisture reading for a zone across its sensors, as
    /// `(ts, fraction)`.
    pub async fn latest_zone_moisture(&self, zone_id: &str) -> Result<Option<(i64, f32)>> {
        let row: Option<(i64, f64)> = sqlx::query_as(
            r#"
            SELECT r.ts, r.moisture
            FROM readings r
            JOIN sensors s ON s.sensor_id = r.sensor_id
            WHERE s.zone_id = ?
            ORDER BY r.ts DESC, r.id DESC
            LIMIT 1
            "#,
        )
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_zone_moisture failed")?;

        Ok(row.map(|(ts, m)| (ts, m as f32)))
    }

    // ----------------------------
    // Sequences
    // ----------------------------

    /// Register (or re-prefix) a sequence. The counter only moves forward.
    pub async fn upsert_sequence(&self, s: &SequenceConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sequences (kind, prefix, padding, next_number)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(kind) DO UPDATE SET
              prefix=excluded.prefix,
              padding=excluded.padding,
              next_number=MAX(sequences.next_number, excluded.next_number)
            "#,
        )
        .bind(s.kind.as_str())
        .bind(&s.prefix)
        .bind(s.padding)
        .bind(s.start)
        .execute(&self.pool)
        .await
        .context("upsert_sequence failed")?;
        Ok(())
    }

    /// Allocate the next code for `kind`, or its placeholder when the kind
    /// has no configured sequence.
    pub async fn next_code(&self, kind: SequenceKind) -> Result<String> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE sequences
            SET next_number = next_number + 1
            WHERE kind = ?
            RETURNING prefix, padding, next_number - 1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("next_code failed for {}", kind.as_str()))?;

        Ok(match row {
            Some((prefix, padding, n)) => format_code(&prefix, padding, n),
            None => kind.placeholder().to_string(),
        })
    }

    // ----------------------------
    // Programs
    // ----------------------------

    pub async fn insert_program(&self, p: &Program) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO programs (
              code, name, zone_id, system_id, program_type, priority,
              start_date, end_date, frequency_type, frequency_days, weekdays,
              preferred_start_time, max_start_time, duration_minutes,
              water_volume_target, water_flow_rate, soil_moisture_threshold,
              temperature_min, temperature_max, wind_speed_max,
              stop_if_rain, rain_threshold_mm, stop_if_wet_soil, use_soil_analysis,
              state, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&p.code)
        .bind(&p.name)
        .bind(&p.zone_id)
        .bind(&p.system_id)
        .bind(p.program_type)
        .bind(p.priority)
        .bind(date_to_text(p.start_date)?)
        .bind(opt_date_to_text(p.end_date)?)
        .bind(p.frequency_type)
        .bind(p.frequency_days)
        .bind(p.weekdays.bits())
        .bind(p.preferred_start_time)
        .bind(p.max_start_time)
        .bind(p.duration_minutes)
        .bind(p.water_volume_target)
        .bind(p.water_flow_rate)
        .bind(p.soil_moisture_threshold)
        .bind(p.temperature_min)
        .bind(p.temperature_max)
        .bind(p.wind_speed_max)
        .bind(p.stop_if_rain)
        .bind(p.rain_threshold_mm)
        .bind(p.stop_if_wet_soil)
        .bind(p.use_soil_analysis)
        .bind(p.state)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert_program failed for '{}'", p.code))?;
        Ok(res.last_insert_rowid())
    }

    /// Write every field of `p` (definition and state). Fails with
    /// `IrrigationError::Conflict` if the row changed since `p` was read;
    /// on success `p.version` is advanced.
    pub async fn update_program(&self, p: &mut Program) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE programs SET
              code=?, name=?, zone_id=?, system_id=?, program_type=?, priority=?,
              start_date=?, end_date=?, frequency_type=?, frequency_days=?, weekdays=?,
              preferred_start_time=?, max_start_time=?, duration_minutes=?,
              water_volume_target=?, water_flow_rate=?, soil_moisture_threshold=?,
              temperature_min=?, temperature_max=?, wind_speed_max=?,
              stop_if_rain=?, rain_threshold_mm=?, stop_if_wet_soil=?, use_soil_analysis=?,
              state=?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&p.code)
        .bind(&p.name)
        .bind(&p.zone_id)
        .bind(&p.system_id)
        .bind(p.program_type)
        .bind(p.priority)
        .bind(date_to_text(p.start_date)?)
        .bind(opt_date_to_text(p.end_date)?)
        .bind(p.frequency_type)
        .bind(p.frequency_days)
        .bind(p.weekdays.bits())
        .bind(p.preferred_start_time)
        .bind(p.max_start_time)
        .bind(p.duration_minutes)
        .bind(p.water_volume_target)
        .bind(p.water_flow_rate)
        .bind(p.soil_moisture_threshold)
        .bind(p.temperature_min)
        .bind(p.temperature_max)
        .bind(p.wind_speed_max)
        .bind(p.stop_if_rain)
        .bind(p.rain_threshold_mm)
        .bind(p.stop_if_wet_soil)
        .bind(p.use_soil_analysis)
        .bind(p.state)
        .bind(p.id)
        .bind(p.version)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update_program failed for {}", p.id))?;

        if res.rows_affected() == 0 {
            return Err(conflict("program", p.id));
        }
        p.version += 1;
        Ok(())
    }

    pub async fn get_program(&self, id: i64) -> Result<Option<Program>> {
        let row: Option<ProgramRow> = sqlx::query_as("SELECT * FROM programs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_program failed")?;
        row.map(Program::try_from).transpose()
    }

    pub async fn program_by_code(&self, code: &str) -> Result<Option<Program>> {
        let row: Option<ProgramRow> =
            sqlx::query_as("SELECT * FROM programs WHERE code = ? ORDER BY id LIMIT 1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await
                .context("program_by_code failed")?;
        row.map(Program::try_from).transpose()
    }

    pub async fn program_by_name(&self, zone_id: &str, name: &str) -> Result<Option<Program>> {
        let row: Option<ProgramRow> = sqlx::query_as(
            "SELECT * FROM programs WHERE zone_id = ? AND name = ? ORDER BY id LIMIT 1",
        )
        .bind(zone_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("program_by_name failed")?;
        row.map(Program::try_from).transpose()
    }

    pub async fn programs_in_state(&self, state: ProgramState) -> Result<Vec<Program>> {
        let rows: Vec<ProgramRow> =
            sqlx::query_as("SELECT * FROM programs WHERE state = ? ORDER BY id")
                .bind(state)
                .fetch_all(&self.pool)
                .await
                .context("programs_in_state failed")?;
        convert_all(rows)
    }

    // ----------------------------
    // Sessions
    // ----------------------------

    pub async fn insert_session(&self, s: &Session) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO sessions (
              code, name, zone_id, system_id, program_id, session_type,
              planned_start, duration_minutes_planned, actual_start, actual_end,
              water_volume_target, water_consumed, unit_water_price,
              energy_cost, labor_cost, equipment_status, operator, issues,
              state, result, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&s.code)
        .bind(&s.name)
        .bind(&s.zone_id)
        .bind(&s.system_id)
        .bind(s.program_id)
        .bind(s.session_type)
        .bind(opt_ts(s.planned_start))
        .bind(s.duration_minutes_planned)
        .bind(opt_ts(s.actual_start))
        .bind(opt_ts(s.actual_end))
        .bind(s.water_volume_target)
        .bind(s.water_consumed)
        .bind(s.unit_water_price)
        .bind(s.energy_cost)
        .bind(s.labor_cost)
        .bind(s.equipment_status)
        .bind(&s.operator)
        .bind(&s.issues)
        .bind(s.state)
        .bind(s.result)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert_session failed for '{}'", s.code))?;
        Ok(res.last_insert_rowid())
    }

    /// Optimistic write of every mutable session column.
    pub async fn update_session(&self, s: &mut Session) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE sessions SET
              name=?, planned_start=?, duration_minutes_planned=?,
              actual_start=?, actual_end=?, water_volume_target=?, water_consumed=?,
              energy_cost=?, labor_cost=?, equipment_status=?, operator=?, issues=?,
              state=?, result=?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&s.name)
        .bind(opt_ts(s.planned_start))
        .bind(s.duration_minutes_planned)
        .bind(opt_ts(s.actual_start))
        .bind(opt_ts(s.actual_end))
        .bind(s.water_volume_target)
        .bind(s.water_consumed)
        .bind(s.energy_cost)
        .bind(s.labor_cost)
        .bind(s.equipment_status)
        .bind(&s.operator)
        .bind(&s.issues)
        .bind(s.state)
        .bind(s.result)
        .bind(s.id)
        .bind(s.version)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update_session failed for {}", s.id))?;

        if res.rows_affected() == 0 {
            return Err(conflict("session", s.id));
        }
        s.version += 1;
        Ok(())
    }

    pub async fn get_session(&self, id: i64) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("get_session failed")?;
        row.map(Session::try_from).transpose()
    }

    pub async fn sessions_for_program(&self, program_id: i64) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions WHERE program_id = ? ORDER BY id")
                .bind(program_id)
                .fetch_all(&self.pool)
                .await
                .context("sessions_for_program failed")?;
        convert_all(rows)
    }

    pub async fn sessions_in_state(&self, state: SessionState) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions WHERE state = ? ORDER BY planned_start, id")
                .bind(state)
                .fetch_all(&self.pool)
                .await
                .context("sessions_in_state failed")?;
        convert_all(rows)
    }

    pub async fn has_open_session(&self, program_id: i64) -> Result<bool> {
        let (n,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sessions
            WHERE program_id = ? AND state IN ('planned', 'in_progress', 'paused')
            "#,
        )
        .bind(program_id)
        .fetch_one(&self.pool)
        .await
        .context("has_open_session failed")?;
        Ok(n > 0)
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn insert_alert(&self, a: &Alert) -> Result<i64> {
        let mut conn = self.pool.acquire().await.context("acquire failed")?;
        Self::insert_alert_on(&mut conn, a).await
    }

    pub async fn update_alert(&self, a: &mut Alert) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("acquire failed")?;
        Self::update_alert_on(&mut conn, a).await
    }

    pub async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        let mut conn = self.pool.acquire().await.context("acquire failed")?;
        Self::get_alert_on(&mut conn, id).await
    }

    pub async fn similar_alerts(&self, a: &Alert) -> Result<Vec<Alert>> {
        let mut conn = self.pool.acquire().await.context("acquire failed")?;
        Self::similar_alerts_on(&mut conn, a).await
    }

    /// Insert a new alert and link it to its recurrence group in one
    /// transaction: the new row, its recurrence fields and the parent's are
    /// all written or none is. Sets `a.id`.
    pub async fn insert_alert_grouped(&self, a: &mut Alert) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;

        let similar = Self::similar_alerts_on(&mut tx, a).await?;
        if let Some(rec) = plan_recurrence(&similar) {
            a.mark_recurring(rec);
            let mut parent = Self::get_alert_on(&mut tx, rec.parent_id)
                .await?
                .ok_or_else(|| IrrigationError::not_found("alert", rec.parent_id))?;
            parent.mark_recurring(Recurrence {
                parent_id: parent.id,
                count: rec.count,
            });
            Self::update_alert_on(&mut tx, &mut parent).await?;
        }
        a.id = Self::insert_alert_on(&mut tx, a).await?;

        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    async fn insert_alert_on(conn: &mut SqliteConnection, a: &Alert) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO alerts (
              code, name, description, alert_type, priority,
              system_id, zone_id, session_id, program_id,
              trigger_value, threshold_value, recommended_action,
              detected_at, acknowledged_at, resolved_at,
              assigned_to, acknowledged_by, resolved_by, resolution_notes,
              state, is_recurring, recurrence_count, parent_id, notification_count, version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&a.code)
        .bind(&a.name)
        .bind(&a.description)
        .bind(a.alert_type)
        .bind(a.priority)
        .bind(&a.system_id)
        .bind(&a.zone_id)
        .bind(a.session_id)
        .bind(a.program_id)
        .bind(a.trigger_value)
        .bind(a.threshold_value)
        .bind(&a.recommended_action)
        .bind(a.detected_at.unix_timestamp())
        .bind(opt_ts(a.acknowledged_at))
        .bind(opt_ts(a.resolved_at))
        .bind(&a.assigned_to)
        .bind(&a.acknowledged_by)
        .bind(&a.resolved_by)
        .bind(&a.resolution_notes)
        .bind(a.state)
        .bind(a.is_recurring)
        .bind(a.recurrence_count)
        .bind(a.parent_id)
        .bind(a.notification_count)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("insert_alert failed for '{}'", a.code))?;
        Ok(res.last_insert_rowid())
    }

    /// Optimistic write of every mutable alert column.
    async fn update_alert_on(conn: &mut SqliteConnection, a: &mut Alert) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE alerts SET
              priority=?, acknowledged_at=?, resolved_at=?,
              assigned_to=?, acknowledged_by=?, resolved_by=?, resolution_notes=?,
              state=?, is_recurring=?, recurrence_count=?, parent_id=?,
              notification_count=?, version = version + 1
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(a.priority)
        .bind(opt_ts(a.acknowledged_at))
        .bind(opt_ts(a.resolved_at))
        .bind(&a.assigned_to)
        .bind(&a.acknowledged_by)
        .bind(&a.resolved_by)
        .bind(&a.resolution_notes)
        .bind(a.state)
        .bind(a.is_recurring)
        .bind(a.recurrence_count)
        .bind(a.parent_id)
        .bind(a.notification_count)
        .bind(a.id)
        .bind(a.version)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("update_alert failed for {}", a.id))?;

        if res.rows_affected() == 0 {
            return Err(conflict("alert", a.id));
        }
        a.version += 1;
        Ok(())
    }

    async fn get_alert_on(conn: &mut SqliteConnection, id: i64) -> Result<Option<Alert>> {
        let row: Option<AlertRow> = sqlx::query_as("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .context("get_alert failed")?;
        row.map(Alert::try_from).transpose()
    }

    /// Alerts of the same type on the same system and zone (NULL matches
    /// NULL) detected in the 24 h before `a`, excluding `a` itself. Oldest
    /// first.
    async fn similar_alerts_on(conn: &mut SqliteConnection, a: &Alert) -> Result<Vec<Alert>> {
        let to = a.detected_at.unix_timestamp();
        let from = to - 24 * 3600;
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT * FROM alerts
            WHERE alert_type = ?
              AND system_id IS ?
              AND zone_id IS ?
              AND detected_at >= ? AND detected_at <= ?
              AND id != ?
            ORDER BY detected_at, id
            "#,
        )
        .bind(a.alert_type)
        .bind(&a.system_id)
        .bind(&a.zone_id)
        .bind(from)
        .bind(to)
        .bind(a.id)
        .fetch_all(&mut *conn)
        .await
        .context("similar_alerts failed")?;
        convert_all(rows)
    }

    /// Up to `limit` other resolved alerts of `a`'s type carrying resolution notes,
    /// scoped to `a`'s system if set, else its zone. Most recent first.
    pub async fn resolved_alerts_like(&self, a: &Alert, limit: i64) -> Result<Vec<Alert>> {
        let (scope_sql, scope_val) = match (&a.system_id, &a.zone_id) {
            (Some(s), _) => (" AND system_id = ?", Some(s.clone())),
            (None, Some(z)) => (" AND zone_id = ?", Some(z.clone())),
            (None, None) => ("", None),
        };
        let sql = format!(
            "SELECT * FROM alerts \
             WHERE alert_type = ? AND state = 'resolved' AND id != ? \
               AND resolution_notes IS NOT NULL AND resolution_notes != ''{scope_sql} \
             ORDER BY resolved_at DESC, id DESC LIMIT ?"
        );

        let mut q = sqlx::query_as::<_, AlertRow>(&sql).bind(a.alert_type).bind(a.id);
        if let Some(v) = scope_val {
            q = q.bind(v);
        }
        let rows = q
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("resolved_alerts_like failed")?;
        convert_all(rows)
    }

    // ----------------------------
    // Audit trail
    // ----------------------------

    pub async fn insert_audit(&self, e: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (ts, entity, entity_id, action, actor, from_state, to_state, detail)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(e.ts.unix_timestamp())
        .bind(e.entity)
        .bind(&e.entity_id)
        .bind(e.action)
        .bind(&e.actor)
        .bind(&e.from_state)
        .bind(&e.to_state)
        .bind(&e.detail)
        .execute(&self.pool)
        .await
        .context("insert_audit failed")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn audit_for(
        &self,
        entity: &str,
        entity_id: &str,
    ) -> Result<Vec<(String, String, String)>> {
        sqlx::query_as(
            "SELECT action, actor, to_state FROM audit_log WHERE entity = ? AND entity_id = ? ORDER BY id",
        )
        .bind(entity)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .context("audit_for failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
