//! Irrigation sessions: one concrete, timestamped irrigation execution.
//!
//! ## Lifecycle
//!
//! ```text
//! Planned ──start──▶ InProgress ──complete──▶ Completed
//!                      │    ▲
//!                 pause│    │resume
//!                      ▼    │
//!                     Paused ──complete──▶ Completed
//!
//! any except Completed/Failed ──cancel──▶ Cancelled
//! any except Completed ──mark_failed──▶ Failed
//! ```
//!
//! Every mutating method ends with [`Session::refresh`] followed by
//! [`Session::validate`], so derived metrics never go stale and an invalid
//! record never leaves this module.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Duration, OffsetDateTime};

use crate::alert::{AlertPriority, AlertType, NewAlert};
use crate::clock::hours_between;
use crate::error::{DomainResult, IrrigationError};

/// Efficiency (percent) at or above which a completed session counts as a
/// success.
pub const SUCCESS_EFFICIENCY_PCT: f64 = 80.0;

/// How far in the past a new session may be planned.
const MAX_PLANNED_BACKDATE_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionType {
    Manual,
    Automatic,
    Emergency,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionState {
    Planned,
    InProgress,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionResult {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EquipmentStatus {
    Excellent,
    Good,
    Average,
    Poor,
    Broken,
}

/// Values derived from the stored fields. Never written directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub planned_end: Option<OffsetDateTime>,
    pub duration_hours: f64,
    pub duration_minutes: i64,
    pub water_efficiency: f64,
    pub target_achievement: f64,
    pub flow_rate_actual: Option<f64>,
    pub time_variance_min: f64,
    pub water_cost: f64,
    pub total_cost: f64,
}

/// Creation input; the store assigns `id` and the sequence assigns `code`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub name: String,
    pub zone_id: String,
    pub system_id: String,
    pub program_id: Option<i64>,
    pub session_type: SessionType,
    pub planned_start: Option<OffsetDateTime>,
    pub duration_minutes_planned: i64,
    pub water_volume_target: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub zone_id: String,
    pub system_id: String,
    pub program_id: Option<i64>,
    pub session_type: SessionType,

    pub planned_start: Option<OffsetDateTime>,
    pub duration_minutes_planned: i64,
    pub actual_start: Option<OffsetDateTime>,
    pub actual_end: Option<OffsetDateTime>,

    pub water_volume_target: Option<f64>,
    pub water_consumed: f64,
    pub unit_water_price: f64,
    pub energy_cost: f64,
    pub labor_cost: f64,

    pub equipment_status: EquipmentStatus,
    pub operator: Option<String>,
    pub issues: Option<String>,

    pub state: SessionState,
    pub result: Option<SessionResult>,
    pub version: i64,

    #[serde(flatten)]
    pub metrics: SessionMetrics,
}

/// `min(100, consumed / target * 100)`, zero without a positive target.
pub fn water_efficiency(target: Option<f64>, consumed: f64) -> f64 {
    match target {
        Some(t) if t > 0.0 => (consumed / t * 100.0).min(100.0),
        _ => 0.0,
    }
}

impl Session {
    /// Materialise a planned session. `id` stays 0 until the store inserts it.
    pub fn new(
        code: String,
        input: NewSession,
        unit_water_price: f64,
        now: OffsetDateTime,
    ) -> DomainResult<Self> {
        if let Some(planned) = input.planned_start {
            if planned < now - Duration::hours(MAX_PLANNED_BACKDATE_HOURS) {
                return Err(IrrigationError::validation(format!(
                    "planned start {planned} is more than {MAX_PLANNED_BACKDATE_HOURS}h in the past"
                )));
            }
        }

        let mut s = Self {
            id: 0,
            code,
            name: input.name,
            zone_id: input.zone_id,
            system_id: input.system_id,
            program_id: input.program_id,
            session_type: input.session_type,
            planned_start: input.planned_start,
            duration_minutes_planned: input.duration_minutes_planned,
            actual_start: None,
            actual_end: None,
            water_volume_target: input.water_volume_target,
            water_consumed: 0.0,
            unit_water_price,
            energy_cost: 0.0,
            labor_cost: 0.0,
            equipment_status: EquipmentStatus::Good,
            operator: None,
            issues: None,
            state: SessionState::Planned,
            result: None,
            version: 0,
            metrics: SessionMetrics::default(),
        };
        s.commit()?;
        Ok(s)
    }

    /// Recompute every derived metric from the stored fields.
    pub fn refresh(&mut self) {
        let planned_end = match self.planned_start {
            Some(start) if self.duration_minutes_planned > 0 => {
                Some(start + Duration::minutes(self.duration_minutes_planned))
            }
            _ => None,
        };

        let duration_hours = match (self.actual_start, self.actual_end) {
            (Some(start), Some(end)) => hours_between(start, end),
            _ => 0.0,
        };
        let duration_minutes = (duration_hours * 60.0).trunc() as i64;

        let efficiency = water_efficiency(self.water_volume_target, self.water_consumed);

        let flow_rate_actual = if duration_hours > 0.0 && self.water_consumed > 0.0 {
            Some(self.water_consumed / duration_hours)
        } else {
            None
        };

        let time_variance_min = if self.duration_minutes_planned > 0 && duration_minutes > 0 {
            (duration_minutes - self.duration_minutes_planned) as f64
        } else {
            0.0
        };

        let water_cost = self.water_consumed * self.unit_water_price;

        self.metrics = SessionMetrics {
            planned_end,
            duration_hours,
            duration_minutes,
            water_efficiency: efficiency,
            target_achievement: efficiency,
            flow_rate_actual,
            time_variance_min,
            water_cost,
            total_cost: water_cost + self.energy_cost + self.labor_cost,
        };
    }

    pub fn validate(&self) -> DomainResult<()> {
        if let (Some(start), Some(end)) = (self.actual_start, self.actual_end) {
            if end < start {
                return Err(IrrigationError::validation(format!(
                    "session {}: end ({end}) precedes start ({start})",
                    self.code
                )));
            }
        }
        if matches!(self.water_volume_target, Some(t) if t <= 0.0) {
            return Err(IrrigationError::validation(format!(
                "session {}: target water volume must be positive",
                self.code
            )));
        }
        if self.water_consumed < 0.0 {
            return Err(IrrigationError::validation(format!(
                "session {}: consumed water volume cannot be negative",
                self.code
            )));
        }
        if self.energy_cost < 0.0 || self.labor_cost < 0.0 {
            return Err(IrrigationError::validation(format!(
                "session {}: costs cannot be negative",
                self.code
            )));
        }
        Ok(())
    }

    fn commit(&mut self) -> DomainResult<()> {
        self.refresh();
        self.validate()
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub fn start(&mut self, now: OffsetDateTime, actor: &str) -> DomainResult<()> {
        if self.state != SessionState::Planned {
            return Err(IrrigationError::transition(
                "session", "start", self.state, "planned",
            ));
        }
        self.state = SessionState::InProgress;
        self.actual_start = Some(now);
        self.operator = Some(actor.to_string());
        self.commit()
    }

    pub fn pause(&mut self) -> DomainResult<()> {
        if self.state != SessionState::InProgress {
            return Err(IrrigationError::transition(
                "session",
                "pause",
                self.state,
                "in_progress",
            ));
        }
        self.state = SessionState::Paused;
        self.commit()
    }

    pub fn resume(&mut self) -> DomainResult<()> {
        if self.state != SessionState::Paused {
            return Err(IrrigationError::transition(
                "session", "resume", self.state, "paused",
            ));
        }
        self.state = SessionState::InProgress;
        self.commit()
    }

    pub fn complete(&mut self, now: OffsetDateTime) -> DomainResult<()> {
        if !matches!(self.state, SessionState::InProgress | SessionState::Paused) {
            return Err(IrrigationError::transition(
                "session",
                "complete",
                self.state,
                "in_progress or paused",
            ));
        }
        self.state = SessionState::Completed;
        self.actual_end = Some(now);
        self.refresh();
        self.result = Some(if self.metrics.water_efficiency >= SUCCESS_EFFICIENCY_PCT {
            SessionResult::Success
        } else {
            SessionResult::Partial
        });
        self.validate()
    }

    pub fn cancel(&mut self, now: OffsetDateTime) -> DomainResult<()> {
        if matches!(self.state, SessionState::Completed | SessionState::Failed) {
            return Err(IrrigationError::transition(
                "session",
                "cancel",
                self.state,
                "planned, in_progress, paused or cancelled",
            ));
        }
        if self.state == SessionState::InProgress {
            self.actual_end = Some(now);
        }
        self.state = SessionState::Cancelled;
        self.commit()
    }

    pub fn mark_failed(&mut self, now: OffsetDateTime) -> DomainResult<()> {
        if self.state == SessionState::Completed {
            return Err(IrrigationError::transition(
                "session",
                "mark_failed",
                self.state,
                "any state except completed",
            ));
        }
        if self.state == SessionState::InProgress {
            self.actual_end = Some(now);
        }
        self.state = SessionState::Failed;
        self.result = Some(SessionResult::Failed);
        self.commit()
    }

    // ── Field updates ────────────────────────────────────────────────

    /// Consumption is metered while the session runs; `complete` fixes the
    /// result from it.
    pub fn record_consumption(&mut self, volume_l: f64) -> DomainResult<()> {
        if !matches!(self.state, SessionState::InProgress | SessionState::Paused) {
            return Err(IrrigationError::transition(
                "session",
                "record_consumption",
                self.state,
                "in_progress or paused",
            ));
        }
        if volume_l < 0.0 {
            return Err(IrrigationError::validation(format!(
                "session {}: consumed water volume cannot be negative",
                self.code
            )));
        }
        self.water_consumed = volume_l;
        self.commit()
    }

    /// Costs may still be entered after the run has ended.
    pub fn record_costs(&mut self, energy: f64, labor: f64) -> DomainResult<()> {
        if matches!(self.state, SessionState::Planned | SessionState::Cancelled) {
            return Err(IrrigationError::transition(
                "session",
                "record_costs",
                self.state,
                "in_progress, paused, completed or failed",
            ));
        }
        self.energy_cost = energy;
        self.labor_cost = labor;
        self.commit()
    }

    /// Log an equipment problem and return the maintenance alert it raises.
    pub fn report_issue(
        &mut self,
        description: &str,
        status: EquipmentStatus,
    ) -> DomainResult<NewAlert> {
        if description.trim().is_empty() {
            return Err(IrrigationError::validation("issue description is empty"));
        }
        self.issues = Some(match self.issues.take() {
            Some(prev) => format!("{prev}\n{description}"),
            None => description.to_string(),
        });
        self.equipment_status = status;
        self.commit()?;
        Ok(self.maintenance_alert(description))
    }

    pub fn maintenance_alert(&self, description: &str) -> NewAlert {
        NewAlert {
            name: format!("Maintenance - {}", self.system_id),
            description: Some(description.to_string()),
            alert_type: AlertType::Equipment,
            priority: AlertPriority::High,
            system_id: Some(self.system_id.clone()),
            zone_id: Some(self.zone_id.clone()),
            session_id: Some(self.id),
            program_id: self.program_id,
            ..NewAlert::default()
        }
    }

    /// Alerts raised when a session completes outside expected bounds.
    pub fn follow_up_alerts(&self) -> Vec<NewAlert> {
        let mut alerts = Vec::new();
        if self.state != SessionState::Completed {
            return alerts;
        }

        if self.water_volume_target.is_some()
            && self.metrics.water_efficiency < SUCCESS_EFFICIENCY_PCT
        {
            alerts.push(NewAlert {
                name: format!("Low water efficiency - {}", self.code),
                description: Some(format!(
                    "Session delivered {:.1} L of {:.1} L target ({:.1}%)",
                    self.water_consumed,
                    self.water_volume_target.unwrap_or_default(),
                    self.metrics.water_efficiency
                )),
                alert_type: AlertType::Water,
                priority: AlertPriority::Warning,
                system_id: Some(self.system_id.clone()),
                zone_id: Some(self.zone_id.clone()),
                session_id: Some(self.id),
                program_id: self.program_id,
                trigger_value: Some(self.metrics.water_efficiency),
                threshold_value: Some(SUCCESS_EFFICIENCY_PCT),
                recommended_action: Some("Check flow meter, filters and emitters".into()),
                ..NewAlert::default()
            });
        }

        if matches!(
            self.equipment_status,
            EquipmentStatus::Poor | EquipmentStatus::Broken
        ) {
            let detail = self
                .issues
                .clone()
                .unwrap_or_else(|| "Equipment reported in poor condition".to_string());
            alerts.push(self.maintenance_alert(&detail));
        }

        alerts
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-06-12 06:00 UTC);

    pub(crate) fn new_session_input() -> NewSession {
        NewSession {
            name: "Orchard morning".into(),
            zone_id: "z1".into(),
            system_id: "sys1".into(),
            program_id: Some(1),
            session_type: SessionType::Automatic,
            planned_start: Some(T0),
            duration_minutes_planned: 60,
            water_volume_target: Some(100.0),
        }
    }

    pub(crate) fn planned_session() -> Session {
        Session::new("SESS-0001".into(), new_session_input(), 0.002, T0).unwrap()
    }

    /// A session forced into `state` without going through transitions.
    pub(crate) fn session_with(state: SessionState) -> Session {
        Session {
            state,
            ..planned_session()
        }
    }

    // -- Derived metrics ---------------------------------------------------

    #[test]
    fn efficiency_is_ratio_capped_at_100() {
        assert_eq!(water_efficiency(Some(100.0), 85.0), 85.0);
        assert_eq!(water_efficiency(Some(100.0), 150.0), 100.0);
    }

    #[test]
    fn efficiency_guards_zero_target() {
        assert_eq!(water_efficiency(Some(0.0), 50.0), 0.0);
        assert_eq!(water_efficiency(None, 50.0), 0.0);
    }

    #[test]
    fn refresh_computes_duration_flow_and_cost() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.record_consumption(90.0).unwrap();
        s.record_costs(1.5, 3.0).unwrap();
        s.complete(T0 + Duration::minutes(90)).unwrap();

        assert_eq!(s.metrics.duration_hours, 1.5);
        assert_eq!(s.metrics.duration_minutes, 90);
        assert_eq!(s.metrics.time_variance_min, 30.0);
        assert_eq!(s.metrics.flow_rate_actual, Some(60.0));
        assert!((s.metrics.water_cost - 0.18).abs() < 1e-9);
        assert!((s.metrics.total_cost - 4.68).abs() < 1e-9);
        assert_eq!(s.metrics.planned_end, Some(T0 + Duration::minutes(60)));
    }

    // -- Transitions -------------------------------------------------------

    #[test]
    fn start_records_actual_start_and_operator() {
        let mut s = planned_session();
        s.start(T0, "alice").unwrap();
        assert_eq!(s.state, SessionState::InProgress);
        assert_eq!(s.actual_start, Some(T0));
        assert_eq!(s.operator.as_deref(), Some("alice"));
    }

    #[test]
    fn start_requires_planned() {
        let mut s = session_with(SessionState::Paused);
        let err = s.start(T0, "alice").unwrap_err();
        assert_eq!(
            err,
            IrrigationError::InvalidTransition {
                entity: "session",
                action: "start",
                current: "paused".into(),
                required: "planned".into(),
            }
        );
    }

    #[test]
    fn pause_and_resume() {
        let mut s = planned_session();
        s.pause().unwrap_err();
        s.start(T0, "op").unwrap();
        s.pause().unwrap();
        assert_eq!(s.state, SessionState::Paused);
        s.pause().unwrap_err();
        s.resume().unwrap();
        assert_eq!(s.state, SessionState::InProgress);
    }

    #[test]
    fn complete_at_exactly_80_percent_is_success() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.record_consumption(80.0).unwrap();
        s.complete(T0 + Duration::hours(1)).unwrap();
        assert_eq!(s.metrics.water_efficiency, 80.0);
        assert_eq!(s.result, Some(SessionResult::Success));
    }

    #[test]
    fn complete_below_80_percent_is_partial() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.record_consumption(79.9).unwrap();
        s.complete(T0 + Duration::hours(1)).unwrap();
        assert_eq!(s.result, Some(SessionResult::Partial));
    }

    #[test]
    fn complete_from_paused() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.pause().unwrap();
        s.complete(T0 + Duration::hours(1)).unwrap();
        assert_eq!(s.state, SessionState::Completed);
        assert_eq!(s.actual_end, Some(T0 + Duration::hours(1)));
    }

    #[test]
    fn complete_requires_running_session() {
        let mut s = planned_session();
        let err = s.complete(T0).unwrap_err();
        assert!(err.to_string().contains("requires in_progress or paused"));
    }

    #[test]
    fn end_before_start_rejected() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        let err = s.complete(T0 - Duration::minutes(1)).unwrap_err();
        assert!(matches!(err, IrrigationError::Validation(_)));
    }

    #[test]
    fn end_equal_to_start_accepted() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.complete(T0).unwrap();
        assert_eq!(s.metrics.duration_hours, 0.0);
    }

    #[test]
    fn cancel_running_session_stamps_end() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.cancel(T0 + Duration::minutes(10)).unwrap();
        assert_eq!(s.state, SessionState::Cancelled);
        assert_eq!(s.actual_end, Some(T0 + Duration::minutes(10)));
    }

    #[test]
    fn cancel_planned_session_leaves_end_unset() {
        let mut s = planned_session();
        s.cancel(T0).unwrap();
        assert_eq!(s.actual_end, None);
    }

    #[test]
    fn cancel_refused_after_completion_or_failure() {
        for state in [SessionState::Completed, SessionState::Failed] {
            let mut s = session_with(state);
            assert!(s.cancel(T0).is_err(), "cancel allowed from {state}");
        }
    }

    #[test]
    fn mark_failed_sets_result() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.mark_failed(T0 + Duration::minutes(5)).unwrap();
        assert_eq!(s.state, SessionState::Failed);
        assert_eq!(s.result, Some(SessionResult::Failed));
        assert_eq!(s.actual_end, Some(T0 + Duration::minutes(5)));

        let mut done = session_with(SessionState::Completed);
        assert!(done.mark_failed(T0).is_err());

        let mut cancelled = session_with(SessionState::Cancelled);
        cancelled.mark_failed(T0).unwrap();
    }

    // -- Validation --------------------------------------------------------

    #[test]
    fn negative_consumption_rejected() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        assert!(matches!(
            s.record_consumption(-1.0),
            Err(IrrigationError::Validation(_))
        ));
    }

    #[test]
    fn consumption_only_recorded_while_running() {
        let mut s = planned_session();
        assert!(matches!(
            s.record_consumption(10.0),
            Err(IrrigationError::InvalidTransition { .. })
        ));

        s.start(T0, "op").unwrap();
        s.record_consumption(100.0).unwrap();
        s.complete(T0 + Duration::hours(1)).unwrap();
        assert_eq!(s.result, Some(SessionResult::Success));

        let err = s.record_consumption(10.0).unwrap_err();
        assert!(matches!(err, IrrigationError::InvalidTransition { .. }));
        assert_eq!(s.water_consumed, 100.0);
        assert_eq!(s.metrics.water_efficiency, 100.0);
        assert_eq!(s.result, Some(SessionResult::Success));
    }

    #[test]
    fn costs_accepted_after_completion_but_not_before_start() {
        let mut s = planned_session();
        assert!(s.record_costs(1.0, 2.0).is_err());

        s.start(T0, "op").unwrap();
        s.complete(T0 + Duration::hours(1)).unwrap();
        s.record_costs(1.0, 2.0).unwrap();
        assert_eq!(s.labor_cost, 2.0);
    }

    #[test]
    fn non_positive_target_rejected_on_creation() {
        let input = NewSession {
            water_volume_target: Some(0.0),
            ..new_session_input()
        };
        assert!(Session::new("S".into(), input, 0.002, T0).is_err());
    }

    #[test]
    fn planned_start_older_than_a_day_rejected() {
        let input = NewSession {
            planned_start: Some(T0 - Duration::hours(25)),
            ..new_session_input()
        };
        let err = Session::new("S".into(), input, 0.002, T0).unwrap_err();
        assert!(err.to_string().contains("in the past"));
    }

    // -- Alerts raised by sessions -----------------------------------------

    #[test]
    fn report_issue_builds_equipment_alert() {
        let mut s = Session {
            id: 7,
            ..planned_session()
        };
        let alert = s.report_issue("pump cavitation", EquipmentStatus::Poor).unwrap();
        assert_eq!(s.issues.as_deref(), Some("pump cavitation"));
        assert_eq!(alert.alert_type, AlertType::Equipment);
        assert_eq!(alert.priority, AlertPriority::High);
        assert_eq!(alert.session_id, Some(7));
        assert_eq!(alert.system_id.as_deref(), Some("sys1"));
    }

    #[test]
    fn follow_up_alerts_on_low_efficiency_and_poor_equipment() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.record_consumption(50.0).unwrap();
        s.equipment_status = EquipmentStatus::Broken;
        s.complete(T0 + Duration::hours(1)).unwrap();

        let alerts = s.follow_up_alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].alert_type, AlertType::Water);
        assert_eq!(alerts[0].trigger_value, Some(50.0));
        assert_eq!(alerts[1].alert_type, AlertType::Equipment);
    }

    #[test]
    fn no_follow_up_for_successful_session() {
        let mut s = planned_session();
        s.start(T0, "op").unwrap();
        s.record_consumption(100.0).unwrap();
        s.complete(T0 + Duration::hours(1)).unwrap();
        assert!(s.follow_up_alerts().is_empty());
    }
}
