//! Irrigation programs: recurring schedule definitions attached to a zone.
//!
//! A program never waters by itself. The scheduler asks the gate evaluator
//! (`gate.rs`) whether a program may run today and, if so, materialises a
//! planned [`Session`] from it with [`Program::session_draft`].

use serde::{Deserialize, Serialize};
use std::fmt;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, Time, Weekday};

use crate::error::{DomainResult, IrrigationError};
use crate::session::{NewSession, Session, SessionState, SessionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProgramType {
    Manual,
    Scheduled,
    Conditional,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProgramPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FrequencyType {
    Daily,
    Alternate,
    Weekly,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProgramState {
    Draft,
    Active,
    Suspended,
    Completed,
    Cancelled,
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        })
    }
}

// ---------------------------------------------------------------------------
// Weekday mask
// ---------------------------------------------------------------------------

/// Seven enable flags, Monday first. Persisted as a bitmask (bit 0 = Monday).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Weekdays([bool; 7]);

impl Weekdays {
    #[cfg(test)]
    pub fn none() -> Self {
        Self([false; 7])
    }

    pub fn from_bits(bits: i64) -> Self {
        let mut days = [false; 7];
        for (i, d) in days.iter_mut().enumerate() {
            *d = bits & (1 << i) != 0;
        }
        Self(days)
    }

    pub fn bits(&self) -> i64 {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0, |acc, (i, _)| acc | (1 << i))
    }

    /// Parse short English day names ("mon", "tue", ...). Case-insensitive.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut days = [false; 7];
        for name in names {
            let idx = match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "mon" | "monday" => 0,
                "tue" | "tuesday" => 1,
                "wed" | "wednesday" => 2,
                "thu" | "thursday" => 3,
                "fri" | "friday" => 4,
                "sat" | "saturday" => 5,
                "sun" | "sunday" => 6,
                other => return Err(format!("unknown weekday '{other}'")),
            };
            days[idx] = true;
        }
        Ok(Self(days))
    }

    #[cfg(test)]
    pub fn with(mut self, day: Weekday) -> Self {
        self.0[day.number_days_from_monday() as usize] = true;
        self
    }

    pub fn allows(&self, day: Weekday) -> bool {
        self.0[day.number_days_from_monday() as usize]
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub zone_id: String,
    pub system_id: String,
    pub program_type: ProgramType,
    pub priority: ProgramPriority,

    pub start_date: Date,
    pub end_date: Option<Date>,

    pub frequency_type: FrequencyType,
    pub frequency_days: Option<i64>,
    pub weekdays: Weekdays,

    /// Hour of day, e.g. 6.5 = 06:30.
    pub preferred_start_time: f64,
    pub max_start_time: f64,
    pub duration_minutes: i64,

    pub water_volume_target: Option<f64>,
    pub water_flow_rate: Option<f64>,

    /// Percent.
    pub soil_moisture_threshold: f64,
    pub temperature_min: Option<f64>,
    pub temperature_max: Option<f64>,
    pub wind_speed_max: Option<f64>,

    pub stop_if_rain: bool,
    pub rain_threshold_mm: f64,
    pub stop_if_wet_soil: bool,
    pub use_soil_analysis: bool,

    pub state: ProgramState,
    pub version: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgramStats {
    pub session_count: usize,
    pub total_water_consumed: f64,
    pub success_rate: f64,
    pub average_duration_min: f64,
}

/// Convert an hour-of-day float into a wall-clock time (minutes truncated).
pub fn hour_to_time(hour: f64) -> DomainResult<Time> {
    if !(0.0..24.0).contains(&hour) {
        return Err(IrrigationError::validation(format!(
            "hour {hour} is not a time of day"
        )));
    }
    let h = hour.trunc();
    let m = ((hour - h) * 60.0).trunc();
    Time::from_hms(h as u8, m as u8, 0)
        .map_err(|e| IrrigationError::validation(format!("hour {hour}: {e}")))
}

impl Program {
    pub fn validate(&self) -> DomainResult<()> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name is empty".to_string());
        }
        if let Some(end) = self.end_date {
            if end <= self.start_date {
                errors.push(format!(
                    "end_date ({end}) must be after start_date ({})",
                    self.start_date
                ));
            }
        }
        if !(0.0..=24.0).contains(&self.preferred_start_time) {
            errors.push(format!(
                "preferred_start_time {} out of range [0, 24]",
                self.preferred_start_time
            ));
        }
        if !(0.0..=24.0).contains(&self.max_start_time) {
            errors.push(format!(
                "max_start_time {} out of range [0, 24]",
                self.max_start_time
            ));
        }
        if self.max_start_time <= self.preferred_start_time {
            errors.push(format!(
                "max_start_time ({}) must be later than preferred_start_time ({})",
                self.max_start_time, self.preferred_start_time
            ));
        }
        if self.duration_minutes <= 0 {
            errors.push(format!(
                "duration_minutes must be positive, got {}",
                self.duration_minutes
            ));
        }
        if let Some(days) = self.frequency_days {
            if days <= 0 {
                errors.push(format!("frequency_days must be positive, got {days}"));
            }
        }
        if !(0.0..=100.0).contains(&self.soil_moisture_threshold) {
            errors.push(format!(
                "soil_moisture_threshold {} out of range [0, 100]",
                self.soil_moisture_threshold
            ));
        }
        if let (Some(lo), Some(hi)) = (self.temperature_min, self.temperature_max) {
            if lo > hi {
                errors.push(format!(
                    "temperature_min ({lo}) exceeds temperature_max ({hi})"
                ));
            }
        }
        if self.rain_threshold_mm < 0.0 {
            errors.push(format!(
                "rain_threshold_mm must not be negative, got {}",
                self.rain_threshold_mm
            ));
        }
        if matches!(self.water_volume_target, Some(v) if v <= 0.0) {
            errors.push("water_volume_target must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IrrigationError::validation(format!(
                "program '{}': {}",
                self.code,
                errors.join("; ")
            )))
        }
    }

    // ── Workflow ─────────────────────────────────────────────────────

    pub fn activate(&mut self) -> DomainResult<()> {
        if !matches!(self.state, ProgramState::Draft | ProgramState::Suspended) {
            return Err(IrrigationError::transition(
                "program",
                "activate",
                self.state,
                "draft or suspended",
            ));
        }
        self.state = ProgramState::Active;
        Ok(())
    }

    pub fn suspend(&mut self) -> DomainResult<()> {
        if self.state != ProgramState::Active {
            return Err(IrrigationError::transition(
                "program", "suspend", self.state, "active",
            ));
        }
        self.state = ProgramState::Suspended;
        Ok(())
    }

    pub fn complete(&mut self) -> DomainResult<()> {
        if !matches!(self.state, ProgramState::Active | ProgramState::Suspended) {
            return Err(IrrigationError::transition(
                "program",
                "complete",
                self.state,
                "active or suspended",
            ));
        }
        self.state = ProgramState::Completed;
        Ok(())
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        if self.state == ProgramState::Completed {
            return Err(IrrigationError::transition(
                "program",
                "cancel",
                self.state,
                "any state except completed",
            ));
        }
        self.state = ProgramState::Cancelled;
        Ok(())
    }

    pub fn reset_to_draft(&mut self) {
        self.state = ProgramState::Draft;
    }

    // ── Scheduling ───────────────────────────────────────────────────

    /// First instant at the preferred start time strictly after `now`:
    /// today if that time is still ahead, tomorrow otherwise.
    pub fn planned_start_after(&self, now: OffsetDateTime) -> DomainResult<OffsetDateTime> {
        let at = now.replace_time(hour_to_time(self.preferred_start_time)?);
        if at <= now {
            Ok(at + Duration::days(1))
        } else {
            Ok(at)
        }
    }

    /// Latest acceptable start for a session planned on `day`.
    pub fn start_deadline(&self, day: Date) -> DomainResult<OffsetDateTime> {
        if self.max_start_time >= 24.0 {
            return Ok(day.midnight().assume_utc() + Duration::days(1));
        }
        Ok(day.with_time(hour_to_time(self.max_start_time)?).assume_utc())
    }

    pub fn next_execution(
        &self,
        last_execution: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Option<OffsetDateTime> {
        if self.state != ProgramState::Active {
            return None;
        }
        match (last_execution, self.frequency_days) {
            (Some(last), Some(days)) => Some(last + Duration::days(days)),
            (None, _) => Some(now + Duration::days(1)),
            (Some(_), None) => None,
        }
    }

    /// Build the planned session this program produces when run at `now`.
    pub fn session_draft(&self, now: OffsetDateTime) -> DomainResult<NewSession> {
        let start = self.planned_start_after(now)?;
        let stamp = start
            .format(format_description!("[day]/[month]/[year] [hour]:[minute]"))
            .map_err(|e| IrrigationError::validation(format!("format planned start: {e}")))?;

        Ok(NewSession {
            name: format!("{} - {stamp}", self.name),
            zone_id: self.zone_id.clone(),
            system_id: self.system_id.clone(),
            program_id: Some(self.id),
            session_type: SessionType::Automatic,
            planned_start: Some(start),
            duration_minutes_planned: self.duration_minutes,
            water_volume_target: self.water_volume_target,
        })
    }
}

/// Latest start among non-cancelled sessions: the actual start if the
/// session ran, else its planned start.
pub fn last_execution(sessions: &[Session]) -> Option<OffsetDateTime> {
    sessions
        .iter()
        .filter(|s| s.state != SessionState::Cancelled)
        .filter_map(|s| s.actual_start.or(s.planned_start))
        .max()
}

pub fn program_stats(sessions: &[Session]) -> ProgramStats {
    if sessions.is_empty() {
        return ProgramStats::default();
    }
    let completed: Vec<&Session> = sessions
        .iter()
        .filter(|s| s.state == SessionState::Completed)
        .collect();
    let total_hours: f64 = sessions.iter().map(|s| s.metrics.duration_hours).sum();

    ProgramStats {
        session_count: sessions.len(),
        total_water_consumed: completed.iter().map(|s| s.water_consumed).sum(),
        success_rate: completed.len() as f64 / sessions.len() as f64 * 100.0,
        average_duration_min: total_hours * 60.0 / sessions.len() as f64,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
