//! TOML config file loading, validation, and database seeding for hub
//! settings, code sequences and the irrigation master data.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

use crate::db::{date_from_text, Db, SensorConfig, SequenceConfig};
use crate::program::{
    FrequencyType, Program, ProgramPriority, ProgramState, ProgramType, Weekdays,
};
use crate::sequence::SequenceKind;
use crate::zone::{IrrigationSystem, IrrigationType, Parcel, SystemStatus, Zone, ZoneState};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub sequences: Vec<SequenceEntry>,
    #[serde(default)]
    pub parcels: Vec<Parcel>,
    #[serde(default)]
    pub systems: Vec<SystemEntry>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub programs: Vec<ProgramEntry>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Captured on each session at creation.
    pub water_price_per_liter: f64,
    /// Extra recipients for critical and emergency alerts.
    pub supervisors: Vec<String>,
    pub tick_sec: u64,
    pub weather_stale_min: i64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            water_price_per_liter: 0.002,
            supervisors: Vec::new(),
            tick_sec: 60,
            weather_stale_min: 180,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SequenceEntry {
    pub kind: SequenceKind,
    pub prefix: String,
    #[serde(default = "default_padding")]
    pub padding: i64,
    #[serde(default = "default_start")]
    pub start: i64,
}

#[derive(Debug, Deserialize)]
pub struct SystemEntry {
    pub system_id: String,
    pub code: Option<String>,
    pub name: String,
    pub irrigation_type: IrrigationType,
    pub max_flow_rate: Option<f64>,
    /// YYYY-MM-DD.
    pub last_maintenance: Option<String>,
    #[serde(default = "default_maintenance_days")]
    pub maintenance_frequency_days: i64,
    /// Only used the first time the system is written.
    #[serde(default = "default_system_status")]
    pub status: SystemStatus,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub code: Option<String>,
    pub name: String,
    pub parcel_id: String,
    pub system_id: String,
    pub surface_ha: f64,
    #[serde(default = "default_water_requirement")]
    pub water_requirement_daily: f64,
    pub water_flow_rate: Option<f64>,
    #[serde(default = "default_frequency_days")]
    pub irrigation_frequency_days: i64,
    #[serde(default = "default_duration_min")]
    pub irrigation_duration_min: i64,
    /// Only used the first time the zone is written.
    #[serde(default = "default_zone_state")]
    pub state: ZoneState,
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub node_id: String,
    pub zone_id: String,
    pub raw_dry: i64,
    pub raw_wet: i64,
}

/// Programs are matched to stored ones by `code` when given, else by
/// `(zone_id, name)`.
#[derive(Debug, Deserialize)]
pub struct ProgramEntry {
    pub code: Option<String>,
    pub name: String,
    pub zone_id: String,
    #[serde(default = "default_program_type")]
    pub program_type: ProgramType,
    #[serde(default = "default_program_priority")]
    pub priority: ProgramPriority,
    pub start_date: String,
    pub end_date: Option<String>,
    #[serde(default = "default_frequency_type")]
    pub frequency_type: FrequencyType,
    pub frequency_days: Option<i64>,
    #[serde(default)]
    pub weekdays: Vec<String>,
    pub preferred_start_time: f64,
    pub max_start_time: f64,
    pub duration_minutes: i64,
    pub water_volume_target: Option<f64>,
    pub water_flow_rate: Option<f64>,
    #[serde(default = "default_soil_threshold")]
    pub soil_moisture_threshold: f64,
    pub temperature_min: Option<f64>,
    pub temperature_max: Option<f64>,
    pub wind_speed_max: Option<f64>,
    #[serde(default = "default_true")]
    pub stop_if_rain: bool,
    #[serde(default = "default_rain_threshold")]
    pub rain_threshold_mm: f64,
    #[serde(default = "default_true")]
    pub stop_if_wet_soil: bool,
    #[serde(default = "default_true")]
    pub use_soil_analysis: bool,
    /// Only used the first time the program is written.
    #[serde(default = "default_program_state")]
    pub state: ProgramState,
}

fn default_padding() -> i64 {
    4
}
fn default_start() -> i64 {
    1
}
fn default_maintenance_days() -> i64 {
    90
}
fn default_system_status() -> SystemStatus {
    SystemStatus::Active
}
fn default_water_requirement() -> f64 {
    2.0
}
fn default_frequency_days() -> i64 {
    2
}
fn default_duration_min() -> i64 {
    60
}
fn default_zone_state() -> ZoneState {
    ZoneState::Active
}
fn default_program_type() -> ProgramType {
    ProgramType::Scheduled
}
fn default_program_priority() -> ProgramPriority {
    ProgramPriority::Normal
}
fn default_frequency_type() -> FrequencyType {
    FrequencyType::Daily
}
fn default_soil_threshold() -> f64 {
    30.0
}
fn default_rain_threshold() -> f64 {
    5.0
}
fn default_true() -> bool {
    true
}
fn default_program_state() -> ProgramState {
    ProgramState::Active
}

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: i64 = 32767;

/// Longest zero padding accepted for a sequence.
const MAX_PADDING: i64 = 12;

// ---------------------------------------------------------------------------
// Entry -> model
// ---------------------------------------------------------------------------

impl SystemEntry {
    fn to_system(&self, code: String, status: SystemStatus) -> Result<IrrigationSystem> {
        Ok(IrrigationSystem {
            system_id: self.system_id.clone(),
            code,
            name: self.name.clone(),
            irrigation_type: self.irrigation_type,
            max_flow_rate: self.max_flow_rate,
            status,
            last_maintenance: self
                .last_maintenance
                .as_deref()
                .map(date_from_text)
                .transpose()?,
            maintenance_frequency_days: self.maintenance_frequency_days,
        })
    }
}

impl ZoneEntry {
    fn to_zone(&self, code: String, state: ZoneState) -> Zone {
        Zone {
            zone_id: self.zone_id.clone(),
            code,
            name: self.name.clone(),
            parcel_id: self.parcel_id.clone(),
            system_id: self.system_id.clone(),
            surface_ha: self.surface_ha,
            water_requirement_daily: self.water_requirement_daily,
            water_flow_rate: self.water_flow_rate,
            irrigation_frequency_days: self.irrigation_frequency_days,
            irrigation_duration_min: self.irrigation_duration_min,
            state,
        }
    }
}

impl ProgramEntry {
    /// Build the program definition. Identity and workflow fields (`id`,
    /// `code`, `state`, `version`) come from the caller.
    fn to_program(
        &self,
        id: i64,
        code: String,
        system_id: String,
        state: ProgramState,
        version: i64,
    ) -> Result<Program> {
        let weekdays = Weekdays::from_names(&self.weekdays).map_err(|e| anyhow!(e))?;
        Ok(Program {
            id,
            code,
            name: self.name.clone(),
            zone_id: self.zone_id.clone(),
            system_id,
            program_type: self.program_type,
            priority: self.priority,
            start_date: date_from_text(&self.start_date)?,
            end_date: self.end_date.as_deref().map(date_from_text).transpose()?,
            frequency_type: self.frequency_type,
            frequency_days: self.frequency_days,
            weekdays,
            preferred_start_time: self.preferred_start_time,
            max_start_time: self.max_start_time,
            duration_minutes: self.duration_minutes,
            water_volume_target: self.water_volume_target,
            water_flow_rate: self.water_flow_rate,
            soil_moisture_threshold: self.soil_moisture_threshold,
            temperature_min: self.temperature_min,
            temperature_max: self.temperature_max,
            wind_speed_max: self.wind_speed_max,
            stop_if_rain: self.stop_if_rain,
            rain_threshold_mm: self.rain_threshold_mm,
            stop_if_wet_soil: self.stop_if_wet_soil,
            use_soil_analysis: self.use_soil_analysis,
            state,
            version,
        })
    }

    fn label(&self) -> String {
        match &self.code {
            Some(c) => c.clone(),
            None => self.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_hub(&mut errors);
        self.validate_sequences(&mut errors);
        self.validate_parcels(&mut errors);
        self.validate_systems(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_programs(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_hub(&self, errors: &mut Vec<String>) {
        let h = &self.hub;
        if h.water_price_per_liter < 0.0 {
            errors.push(format!(
                "hub: water_price_per_liter must not be negative, got {}",
                h.water_price_per_liter
            ));
        }
        if h.tick_sec == 0 {
            errors.push("hub: tick_sec must be positive".to_string());
        }
        if h.weather_stale_min <= 0 {
            errors.push(format!(
                "hub: weather_stale_min must be positive, got {}",
                h.weather_stale_min
            ));
        }
        if h.supervisors.iter().any(|s| s.trim().is_empty()) {
            errors.push("hub: supervisors contains an empty name".to_string());
        }
    }

    fn validate_sequences(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<SequenceKind> = HashSet::new();
        for s in &self.sequences {
            let ctx = format!("sequence '{}'", s.kind.as_str());
            if !seen.insert(s.kind) {
                errors.push(format!("{ctx}: duplicate kind"));
            }
            if s.prefix.trim().is_empty() {
                errors.push(format!("{ctx}: prefix is empty"));
            }
            if !(0..=MAX_PADDING).contains(&s.padding) {
                errors.push(format!(
                    "{ctx}: padding {} out of range [0, {MAX_PADDING}]",
                    s.padding
                ));
            }
            if s.start < 1 {
                errors.push(format!("{ctx}: start must be at least 1, got {}", s.start));
            }
        }
    }

    fn validate_parcels(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, p) in self.parcels.iter().enumerate() {
            let ctx = || {
                if p.parcel_id.is_empty() {
                    format!("parcels[{i}]")
                } else {
                    format!("parcel '{}'", p.parcel_id)
                }
            };

            if p.parcel_id.trim().is_empty() {
                errors.push(format!("{}: parcel_id is empty", ctx()));
            } else if !seen_ids.insert(&p.parcel_id) {
                errors.push(format!("{}: duplicate parcel_id", ctx()));
            }
            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if p.surface_ha <= 0.0 {
                errors.push(format!(
                    "{}: surface_ha must be positive, got {}",
                    ctx(),
                    p.surface_ha
                ));
            }
        }
    }

    fn validate_systems(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, s) in self.systems.iter().enumerate() {
            let ctx = || {
                if s.system_id.is_empty() {
                    format!("systems[{i}]")
                } else {
                    format!("system '{}'", s.system_id)
                }
            };

            if s.system_id.trim().is_empty() {
                errors.push(format!("{}: system_id is empty", ctx()));
            } else if !seen_ids.insert(&s.system_id) {
                errors.push(format!("{}: duplicate system_id", ctx()));
            }
            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if s.maintenance_frequency_days <= 0 {
                errors.push(format!(
                    "{}: maintenance_frequency_days must be positive, got {}",
                    ctx(),
                    s.maintenance_frequency_days
                ));
            }

            match s.to_system(String::new(), s.status) {
                Ok(system) => {
                    if let Err(e) = system.validate() {
                        errors.push(e.to_string());
                    }
                }
                Err(e) => errors.push(format!("{}: {e:#}", ctx())),
            }
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let parcels: HashMap<&str, &Parcel> = self
            .parcels
            .iter()
            .map(|p| (p.parcel_id.as_str(), p))
            .collect();
        let system_ids: HashSet<&str> = self.systems.iter().map(|s| s.system_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }
            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── References ──────────────────────────────────────
            if !system_ids.contains(z.system_id.as_str()) {
                errors.push(format!(
                    "{}: system_id '{}' does not match any defined system",
                    ctx(),
                    z.system_id
                ));
            }
            match parcels.get(z.parcel_id.as_str()) {
                Some(parcel) => {
                    if let Err(e) = z.to_zone(String::new(), z.state).validate(parcel) {
                        errors.push(e.to_string());
                    }
                }
                None => errors.push(format!(
                    "{}: parcel_id '{}' does not match any defined parcel",
                    ctx(),
                    z.parcel_id
                )),
            }

            // ── Schedule defaults ───────────────────────────────
            if z.irrigation_frequency_days <= 0 {
                errors.push(format!(
                    "{}: irrigation_frequency_days must be positive, got {}",
                    ctx(),
                    z.irrigation_frequency_days
                ));
            }
            if z.irrigation_duration_min <= 0 {
                errors.push(format!(
                    "{}: irrigation_duration_min must be positive, got {}",
                    ctx(),
                    z.irrigation_duration_min
                ));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<&str> = self.zones.iter().map(|z| z.zone_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }

            if s.node_id.trim().is_empty() {
                errors.push(format!("{}: node_id is empty", ctx()));
            }

            if s.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !zone_ids.contains(s.zone_id.as_str()) {
                errors.push(format!(
                    "{}: zone_id '{}' does not match any defined zone",
                    ctx(),
                    s.zone_id
                ));
            }

            // ── ADC calibration bounds ──────────────────────────
            if s.raw_dry < 0 || s.raw_dry > ADS1115_MAX {
                errors.push(format!(
                    "{}: raw_dry {} out of ADS1115 range [0, {ADS1115_MAX}]",
                    ctx(),
                    s.raw_dry
                ));
            }
            if s.raw_wet < 0 || s.raw_wet > ADS1115_MAX {
                errors.push(format!(
                    "{}: raw_wet {} out of ADS1115 range [0, {ADS1115_MAX}]",
                    ctx(),
                    s.raw_wet
                ));
            }
            if s.raw_dry == s.raw_wet {
                errors.push(format!(
                    "{}: raw_dry and raw_wet are both {}, calibration range is zero",
                    ctx(),
                    s.raw_dry
                ));
            }
        }
    }

    fn validate_programs(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<&str> = self.zones.iter().map(|z| z.zone_id.as_str()).collect();
        let mut seen_codes: HashSet<&str> = HashSet::new();
        let mut seen_names: HashSet<(&str, &str)> = HashSet::new();

        for p in &self.programs {
            let ctx = format!("program '{}'", p.label());

            if let Some(code) = &p.code {
                if code.trim().is_empty() {
                    errors.push(format!("{ctx}: code is empty"));
                } else if !seen_codes.insert(code) {
                    errors.push(format!("{ctx}: duplicate code"));
                }
            } else if !seen_names.insert((p.zone_id.as_str(), p.name.as_str())) {
                errors.push(format!(
                    "{ctx}: duplicate name in zone '{}' (set a code to disambiguate)",
                    p.zone_id
                ));
            }

            if !zone_ids.contains(p.zone_id.as_str()) {
                errors.push(format!(
                    "{ctx}: zone_id '{}' does not match any defined zone",
                    p.zone_id
                ));
            }
            if p.frequency_type == FrequencyType::Weekly && p.weekdays.is_empty() {
                errors.push(format!("{ctx}: weekly frequency needs at least one weekday"));
            }

            match p.to_program(0, p.label(), String::new(), p.state, 0) {
                Ok(program) => {
                    if let Err(e) = program.validate() {
                        errors.push(e.to_string());
                    }
                }
                Err(e) => errors.push(format!("{ctx}: {e:#}")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert every config entry into the database. Stored codes and workflow
/// states win over the file so that re-applying never rewinds a workflow.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for s in &config.sequences {
        db.upsert_sequence(&SequenceConfig {
            kind: s.kind,
            prefix: s.prefix.clone(),
            padding: s.padding,
            start: s.start,
        })
        .await
        .with_context(|| format!("failed to upsert sequence '{}'", s.kind.as_str()))?;
    }

    for p in &config.parcels {
        db.upsert_parcel(p)
            .await
            .with_context(|| format!("failed to upsert parcel '{}'", p.parcel_id))?;
    }

    for s in &config.systems {
        let (code, status) = match db.get_system(&s.system_id).await? {
            Some(existing) => (existing.code, existing.status),
            None => (code_or_next(db, &s.code, SequenceKind::System).await?, s.status),
        };
        db.upsert_system(&s.to_system(code, status)?)
            .await
            .with_context(|| format!("failed to upsert system '{}'", s.system_id))?;
    }

    for z in &config.zones {
        let (code, state) = match db.get_zone(&z.zone_id).await? {
            Some(existing) => (existing.code, existing.state),
            None => (code_or_next(db, &z.code, SequenceKind::Zone).await?, z.state),
        };
        db.upsert_zone(&z.to_zone(code, state))
            .await
            .with_context(|| format!("failed to upsert zone '{}'", z.zone_id))?;
    }

    for s in &config.sensors {
        db.upsert_sensor(&SensorConfig {
            sensor_id: s.sensor_id.clone(),
            node_id: s.node_id.clone(),
            zone_id: s.zone_id.clone(),
            raw_dry: s.raw_dry,
            raw_wet: s.raw_wet,
        })
        .await
        .with_context(|| format!("failed to upsert sensor '{}'", s.sensor_id))?;
    }

    for p in &config.programs {
        apply_program(p, db)
            .await
            .with_context(|| format!("failed to apply program '{}'", p.label()))?;
    }

    tracing::info!(
        parcels = config.parcels.len(),
        systems = config.systems.len(),
        zones = config.zones.len(),
        sensors = config.sensors.len(),
        programs = config.programs.len(),
        "config applied"
    );

    Ok(())
}

async fn code_or_next(db: &Db, code: &Option<String>, kind: SequenceKind) -> Result<String> {
    match code {
        Some(c) => Ok(c.clone()),
        None => db.next_code(kind).await,
    }
}

async fn apply_program(entry: &ProgramEntry, db: &Db) -> Result<()> {
    let zone = db
        .get_zone(&entry.zone_id)
        .await?
        .with_context(|| format!("zone '{}' not found", entry.zone_id))?;

    let existing = match &entry.code {
        Some(code) => db.program_by_code(code).await?,
        None => db.program_by_name(&entry.zone_id, &entry.name).await?,
    };

    match existing {
        Some(stored) => {
            let mut p = entry.to_program(
                stored.id,
                stored.code.clone(),
                zone.system_id,
                stored.state,
                stored.version,
            )?;
            if p == stored_definition(&p, &stored) {
                return Ok(());
            }
            db.update_program(&mut p).await?;
            tracing::info!(program = p.id, code = %p.code, "program definition updated");
        }
        None => {
            let code = code_or_next(db, &entry.code, SequenceKind::Program).await?;
            let p = entry.to_program(0, code, zone.system_id, entry.state, 0)?;
            let id = db.insert_program(&p).await?;
            tracing::info!(program = id, code = %p.code, "program created");
        }
    }
    Ok(())
}

/// `stored` with the identity fields of `p`, for change detection.
fn stored_definition(p: &Program, stored: &Program) -> Program {
    Program {
        id: p.id,
        code: p.code.clone(),
        state: p.state,
        version: p.version,
        ..stored.clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_parcel() -> Parcel {
        Parcel {
            parcel_id: "p1".into(),
            name: "North field".into(),
            surface_ha: 2.0,
        }
    }

    fn valid_system() -> SystemEntry {
        SystemEntry {
            system_id: "sys1".into(),
            code: None,
            name: "Drip line".into(),
            irrigation_type: IrrigationType::Drip,
            max_flow_rate: Some(8000.0),
            last_maintenance: Some("2024-01-01".into()),
            maintenance_frequency_days: 90,
            status: SystemStatus::Active,
        }
    }

    fn valid_zone() -> ZoneEntry {
        ZoneEntry {
            zone_id: "z1".into(),
            code: None,
            name: "Orchard".into(),
            parcel_id: "p1".into(),
            system_id: "sys1".into(),
            surface_ha: 0.5,
            water_requirement_daily: 2.0,
            water_flow_rate: Some(5000.0),
            irrigation_frequency_days: 2,
            irrigation_duration_min: 60,
            state: ZoneState::Active,
        }
    }

    fn valid_sensor() -> SensorEntry {
        SensorEntry {
            sensor_id: "node-a/s1".into(),
            node_id: "node-a".into(),
            zone_id: "z1".into(),
            raw_dry: 26000,
            raw_wet: 12000,
        }
    }

    fn valid_program() -> ProgramEntry {
        toml::from_str(
            r#"
name = "Orchard morning"
zone_id = "z1"
start_date = "2024-01-01"
end_date = "2024-12-31"
frequency_type = "alternate"
frequency_days = 2
preferred_start_time = 6.0
max_start_time = 8.0
duration_minutes = 60
water_volume_target = 1000.0
"#,
        )
        .unwrap()
    }

    fn valid_config() -> Config {
        Config {
            hub: HubSettings::default(),
            sequences: vec![SequenceEntry {
                kind: SequenceKind::Program,
                prefix: "PROG-".into(),
                padding: 4,
                start: 1,
            }],
            parcels: vec![valid_parcel()],
            systems: vec![valid_system()],
            zones: vec![valid_zone()],
            sensors: vec![valid_sensor()],
            programs: vec![valid_program()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[hub]
water_price_per_liter = 0.003
supervisors = ["chief"]

[[sequences]]
kind = "session"
prefix = "SESS-"

[[parcels]]
parcel_id = "p1"
name = "North field"
surface_ha = 2.0

[[systems]]
system_id = "sys1"
name = "Drip line"
irrigation_type = "drip"

[[zones]]
zone_id = "z1"
name = "Orchard"
parcel_id = "p1"
system_id = "sys1"
surface_ha = 0.5

[[sensors]]
sensor_id = "node-a/s1"
node_id = "node-a"
zone_id = "z1"
raw_dry = 26000
raw_wet = 12000

[[programs]]
name = "Weekly soak"
zone_id = "z1"
start_date = "2024-01-01"
frequency_type = "weekly"
weekdays = ["mon", "thu"]
preferred_start_time = 5.5
max_start_time = 7.0
duration_minutes = 45
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.hub.water_price_per_liter, 0.003);
        assert_eq!(config.hub.tick_sec, 60);
        assert_eq!(config.sequences[0].padding, 4);
        assert_eq!(config.sequences[0].start, 1);
        assert_eq!(config.systems[0].maintenance_frequency_days, 90);
        assert_eq!(config.zones[0].water_requirement_daily, 2.0);
        assert_eq!(config.zones[0].state, ZoneState::Active);

        let p = &config.programs[0];
        assert_eq!(p.soil_moisture_threshold, 30.0);
        assert_eq!(p.rain_threshold_mm, 5.0);
        assert!(p.stop_if_rain && p.stop_if_wet_soil && p.use_soil_analysis);
        assert_eq!(p.state, ProgramState::Active);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.zones.is_empty());
        assert!(config.programs.is_empty());
        assert_eq!(config.hub, HubSettings::default());
        config.validate().unwrap();
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn every_violation_is_reported() {
        let mut cfg = valid_config();
        cfg.parcels[0].surface_ha = 0.0;
        cfg.sensors[0].raw_wet = 26000;
        cfg.programs[0].duration_minutes = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("errors"), "{msg}");
        assert!(msg.contains("surface_ha must be positive"), "{msg}");
        assert!(msg.contains("calibration range is zero"), "{msg}");
        assert!(msg.contains("duration_minutes must be positive"), "{msg}");
    }

    #[test]
    fn zone_larger_than_parcel_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].surface_ha = 3.0;
        assert_validation_err(&cfg, "exceeds parcel 'p1'");
    }

    #[test]
    fn zone_unknown_references_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].parcel_id = "nope".into();
        cfg.zones[0].system_id = "nope".into();
        assert_validation_err(&cfg, "parcel_id 'nope' does not match");
        assert_validation_err(&cfg, "system_id 'nope' does not match");
    }

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(valid_zone());
        assert_validation_err(&cfg, "duplicate zone_id");
    }

    #[test]
    fn system_bad_maintenance_date_rejected() {
        let mut cfg = valid_config();
        cfg.systems[0].last_maintenance = Some("01/01/2024".into());
        assert_validation_err(&cfg, "expected YYYY-MM-DD");
    }

    #[test]
    fn sensor_out_of_adc_range_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].raw_dry = 40000;
        assert_validation_err(&cfg, "out of ADS1115 range");
    }

    #[test]
    fn sensor_unknown_zone_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].zone_id = "z9".into();
        assert_validation_err(&cfg, "zone_id 'z9' does not match any defined zone");
    }

    #[test]
    fn program_times_checked_by_model() {
        let mut cfg = valid_config();
        cfg.programs[0].max_start_time = 5.0;
        assert_validation_err(&cfg, "must be later than preferred_start_time");
    }

    #[test]
    fn program_bad_weekday_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].weekdays = vec!["funday".into()];
        assert_validation_err(&cfg, "unknown weekday 'funday'");
    }

    #[test]
    fn weekly_program_without_days_rejected() {
        let mut cfg = valid_config();
        cfg.programs[0].frequency_type = FrequencyType::Weekly;
        assert_validation_err(&cfg, "at least one weekday");
    }

    #[test]
    fn duplicate_unnamed_program_rejected() {
        let mut cfg = valid_config();
        cfg.programs.push(valid_program());
        assert_validation_err(&cfg, "duplicate name in zone 'z1'");
    }

    #[test]
    fn sequence_checks() {
        let mut cfg = valid_config();
        cfg.sequences.push(SequenceEntry {
            kind: SequenceKind::Program,
            prefix: "".into(),
            padding: 20,
            start: 0,
        });
        assert_validation_err(&cfg, "duplicate kind");
        assert_validation_err(&cfg, "prefix is empty");
        assert_validation_err(&cfg, "padding 20 out of range");
        assert_validation_err(&cfg, "start must be at least 1");
    }

    #[test]
    fn hub_settings_checked() {
        let mut cfg = valid_config();
        cfg.hub.tick_sec = 0;
        cfg.hub.weather_stale_min = 0;
        assert_validation_err(&cfg, "tick_sec must be positive");
        assert_validation_err(&cfg, "weather_stale_min must be positive");
    }

    // -- Apply ------------------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_master_data_and_codes() {
        let db = test_db().await;
        let cfg = valid_config();
        apply(&cfg, &db).await.unwrap();

        let sys = db.get_system("sys1").await.unwrap().unwrap();
        // No system sequence configured.
        assert_eq!(sys.code, "SYS-NEW");
        assert_eq!(sys.status, SystemStatus::Active);

        let zone = db.get_zone("z1").await.unwrap().unwrap();
        assert_eq!(zone.parcel_id, "p1");

        let p = db
            .program_by_name("z1", "Orchard morning")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.code, "PROG-0001");
        assert_eq!(p.system_id, "sys1");
        assert_eq!(p.state, ProgramState::Active);
        assert_eq!(db.load_sensors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reapply_keeps_codes_and_workflow_state() {
        let db = test_db().await;
        let mut cfg = valid_config();
        apply(&cfg, &db).await.unwrap();

        let mut p = db
            .program_by_name("z1", "Orchard morning")
            .await
            .unwrap()
            .unwrap();
        p.suspend().unwrap();
        db.update_program(&mut p).await.unwrap();

        let mut zone = db.get_zone("z1").await.unwrap().unwrap();
        zone.suspend().unwrap();
        db.upsert_zone(&zone).await.unwrap();

        cfg.programs[0].duration_minutes = 90;
        apply(&cfg, &db).await.unwrap();

        let again = db.get_program(p.id).await.unwrap().unwrap();
        assert_eq!(again.code, "PROG-0001");
        assert_eq!(again.state, ProgramState::Suspended);
        assert_eq!(again.duration_minutes, 90);
        assert_eq!(again.version, p.version + 1);
        assert_eq!(
            db.get_zone("z1").await.unwrap().unwrap().state,
            ZoneState::Suspended
        );
    }

    #[tokio::test]
    async fn unchanged_program_is_not_rewritten() {
        let db = test_db().await;
        let cfg = valid_config();
        apply(&cfg, &db).await.unwrap();
        apply(&cfg, &db).await.unwrap();

        let p = db
            .program_by_name("z1", "Orchard morning")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.version, 0);
        assert_eq!(p.code, "PROG-0001");
    }

    #[tokio::test]
    async fn program_with_code_is_matched_by_code() {
        let db = test_db().await;
        let mut cfg = valid_config();
        cfg.programs[0].code = Some("ORCH-AM".into());
        apply(&cfg, &db).await.unwrap();

        cfg.programs[0].name = "Orchard dawn".into();
        apply(&cfg, &db).await.unwrap();

        let p = db.program_by_code("ORCH-AM").await.unwrap().unwrap();
        assert_eq!(p.name, "Orchard dawn");
        assert!(db
            .program_by_name("z1", "Orchard morning")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn bundled_config_is_valid() {
        let config: Config = toml::from_str(include_str!("../config.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.sequences.len(), 5);
        assert_eq!(config.programs[0].frequency_type, FrequencyType::Weekly);
    }
}
