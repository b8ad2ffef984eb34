//! Workflow operations over the store: every program, session, alert, zone
//! and system action goes through here so that validation, optimistic
//! persistence, audit and notification happen in one place.
//!
//! Domain refusals surface as [`IrrigationError`] inside the returned
//! `anyhow::Error` and can be recovered with `downcast_ref`.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::alert::{Alert, NewAlert};
use crate::audit::{AuditEntry, AuditLog};
use crate::clock::Clock;
use crate::config::HubSettings;
use crate::db::Db;
use crate::error::{DomainResult, IrrigationError};
use crate::gate::{self, GateContext, GateRejection, WeatherSnapshot};
use crate::notify::Notifier;
use crate::program::{self, Program, ProgramStats};
use crate::sequence::SequenceKind;
use crate::session::{EquipmentStatus, NewSession, Session, SessionType};
use crate::zone::{IrrigationSystem, Zone};

/// Actor recorded for scheduler-driven actions.
pub const SYSTEM_ACTOR: &str = "system";

/// How many past resolutions are offered as suggestions.
const MAX_SUGGESTIONS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionSuggestion {
    pub alert_id: i64,
    pub alert_code: String,
    pub resolution: String,
    pub resolution_time_hours: f64,
}

/// Input for an operator-created session.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualSessionRequest {
    pub name: String,
    pub zone_id: String,
    pub session_type: SessionType,
    pub planned_start: Option<OffsetDateTime>,
    /// Derived from the zone's flow rate when absent.
    pub duration_minutes_planned: Option<i64>,
    pub water_volume_target: Option<f64>,
}

pub struct IrrigationService {
    db: Db,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditLog>,
    notifier: Arc<dyn Notifier>,
    settings: HubSettings,
}

impl IrrigationService {
    pub fn new(
        db: Db,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditLog>,
        notifier: Arc<dyn Notifier>,
        settings: HubSettings,
    ) -> Self {
        Self {
            db,
            clock,
            audit,
            notifier,
            settings,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    // ── Lookups ──────────────────────────────────────────────────────

    pub async fn program(&self, id: i64) -> Result<Program> {
        self.db
            .get_program(id)
            .await?
            .ok_or_else(|| IrrigationError::not_found("program", id).into())
    }

    pub async fn session(&self, id: i64) -> Result<Session> {
        self.db
            .get_session(id)
            .await?
            .ok_or_else(|| IrrigationError::not_found("session", id).into())
    }

    pub async fn alert(&self, id: i64) -> Result<Alert> {
        self.db
            .get_alert(id)
            .await?
            .ok_or_else(|| IrrigationError::not_found("alert", id).into())
    }

    async fn zone(&self, zone_id: &str) -> Result<Zone> {
        self.db
            .get_zone(zone_id)
            .await?
            .ok_or_else(|| IrrigationError::not_found("zone", zone_id).into())
    }

    async fn system(&self, system_id: &str) -> Result<IrrigationSystem> {
        self.db
            .get_system(system_id)
            .await?
            .ok_or_else(|| IrrigationError::not_found("system", system_id).into())
    }

    async fn audit(
        &self,
        entity: &'static str,
        entity_id: impl ToString,
        action: &'static str,
        actor: &str,
        from_state: Option<String>,
        to_state: String,
        detail: Option<String>,
    ) {
        let entry = AuditEntry {
            ts: self.clock.now(),
            entity,
            entity_id: entity_id.to_string(),
            action,
            actor: actor.to_string(),
            from_state,
            to_state,
            detail,
        };
        if let Err(e) = self.audit.record(entry).await {
            warn!(entity, action, "audit record failed: {e:#}");
        }
    }

    // ── Programs ─────────────────────────────────────────────────────

    async fn transition_program<F>(
        &self,
        id: i64,
        action: &'static str,
        actor: &str,
        f: F,
    ) -> Result<Program>
    where
        F: FnOnce(&mut Program) -> DomainResult<()>,
    {
        let mut p = self.program(id).await?;
        let from = p.state;
        f(&mut p)?;
        self.db.update_program(&mut p).await?;

        info!(program = id, action, from = %from, to = %p.state, actor, "program transition");
        self.audit("program", id, action, actor, Some(from.to_string()), p.state.to_string(), None)
            .await;
        Ok(p)
    }

    pub async fn activate_program(&self, id: i64, actor: &str) -> Result<Program> {
        self.transition_program(id, "activate", actor, |p| {
            p.validate()?;
            p.activate()
        })
        .await
    }

    pub async fn suspend_program(&self, id: i64, actor: &str) -> Result<Program> {
        self.transition_program(id, "suspend", actor, Program::suspend).await
    }

    pub async fn complete_program(&self, id: i64, actor: &str) -> Result<Program> {
        self.transition_program(id, "complete", actor, Program::complete).await
    }

    pub async fn cancel_program(&self, id: i64, actor: &str) -> Result<Program> {
        self.transition_program(id, "cancel", actor, Program::cancel).await
    }

    pub async fn reset_program_to_draft(&self, id: i64, actor: &str) -> Result<Program> {
        self.transition_program(id, "reset_to_draft", actor, |p| {
            p.reset_to_draft();
            Ok(())
        })
        .await
    }

    /// Run the gate checks for `p` today, using the zone's latest soil
    /// moisture and the supplied weather.
    pub async fn evaluate_program(
        &self,
        p: &Program,
        weather: Option<WeatherSnapshot>,
    ) -> Result<Result<(), GateRejection>> {
        let sessions = self.db.sessions_for_program(p.id).await?;
        let soil = self.db.latest_zone_moisture(&p.zone_id).await?;
        let ctx = GateContext {
            today: self.clock.now().date(),
            last_execution: program::last_execution(&sessions).map(|t| t.date()),
            weather,
            soil_moisture_pct: soil.map(|(_, m)| m as f64 * 100.0),
        };
        Ok(gate::evaluate(p, &ctx))
    }

    /// Materialise the next planned session of `p`. Gate checks are the
    /// caller's responsibility.
    pub async fn create_session_from_program(&self, p: &Program, actor: &str) -> Result<Session> {
        let draft = p.session_draft(self.clock.now())?;
        self.insert_session(draft, actor).await
    }

    /// Evaluate and, if the gates pass, create a session.
    pub async fn run_program(
        &self,
        id: i64,
        actor: &str,
        weather: Option<WeatherSnapshot>,
    ) -> Result<Session> {
        let p = self.program(id).await?;
        if let Err(rejection) = self.evaluate_program(&p, weather).await? {
            return Err(IrrigationError::GateRejected(rejection).into());
        }
        self.create_session_from_program(&p, actor).await
    }

    pub async fn program_stats(&self, id: i64) -> Result<ProgramStats> {
        let sessions = self.db.sessions_for_program(id).await?;
        Ok(program::program_stats(&sessions))
    }

    pub async fn next_execution(&self, id: i64) -> Result<Option<OffsetDateTime>> {
        let p = self.program(id).await?;
        let sessions = self.db.sessions_for_program(id).await?;
        Ok(p.next_execution(program::last_execution(&sessions), self.clock.now()))
    }

    // ── Sessions ─────────────────────────────────────────────────────

    async fn insert_session(&self, input: NewSession, actor: &str) -> Result<Session> {
        let code = self.db.next_code(SequenceKind::Session).await?;
        let now = self.clock.now();
        let mut s = Session::new(code, input, self.settings.water_price_per_liter, now)?;
        s.id = self.db.insert_session(&s).await?;

        info!(session = s.id, code = %s.code, zone = %s.zone_id, "session planned");
        self.audit(
            "session",
            s.id,
            "create",
            actor,
            None,
            s.state.to_string(),
            Some(s.name.clone()),
        )
        .await;
        Ok(s)
    }

    pub async fn create_manual_session(
        &self,
        req: ManualSessionRequest,
        actor: &str,
    ) -> Result<Session> {
        let zone = self.zone(&req.zone_id).await?;
        let duration = match req.duration_minutes_planned {
            Some(d) => d,
            None => (zone.optimal_duration_hours(req.water_volume_target) * 60.0).round() as i64,
        };
        let input = NewSession {
            name: req.name,
            zone_id: zone.zone_id.clone(),
            system_id: zone.system_id.clone(),
            program_id: None,
            session_type: req.session_type,
            planned_start: req.planned_start,
            duration_minutes_planned: duration,
            water_volume_target: req.water_volume_target,
        };
        self.insert_session(input, actor).await
    }

    async fn transition_session<F, T>(
        &self,
        id: i64,
        action: &'static str,
        actor: &str,
        f: F,
    ) -> Result<(Session, T)>
    where
        F: FnOnce(&mut Session, OffsetDateTime) -> DomainResult<T>,
    {
        let mut s = self.session(id).await?;
        let from = s.state;
        let out = f(&mut s, self.clock.now())?;
        self.db.update_session(&mut s).await?;

        info!(session = id, action, from = %from, to = %s.state, actor, "session transition");
        self.audit("session", id, action, actor, Some(from.to_string()), s.state.to_string(), None)
            .await;
        Ok((s, out))
    }

    pub async fn start_session(&self, id: i64, actor: &str) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "start", actor, |s, now| s.start(now, actor))
            .await?;
        Ok(s)
    }

    pub async fn pause_session(&self, id: i64, actor: &str) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "pause", actor, |s, _| s.pause())
            .await?;
        Ok(s)
    }

    pub async fn resume_session(&self, id: i64, actor: &str) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "resume", actor, |s, _| s.resume())
            .await?;
        Ok(s)
    }

    /// Complete a session and raise its follow-up alerts.
    pub async fn complete_session(&self, id: i64, actor: &str) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "complete", actor, |s, now| s.complete(now))
            .await?;
        for input in s.follow_up_alerts() {
            if let Err(e) = self.raise_alert(input, actor).await {
                warn!(session = id, "follow-up alert failed: {e:#}");
            }
        }
        Ok(s)
    }

    pub async fn cancel_session(&self, id: i64, actor: &str) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "cancel", actor, |s, now| s.cancel(now))
            .await?;
        Ok(s)
    }

    pub async fn fail_session(&self, id: i64, actor: &str) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "mark_failed", actor, |s, now| s.mark_failed(now))
            .await?;
        Ok(s)
    }

    pub async fn record_consumption(&self, id: i64, liters: f64, actor: &str) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "record_consumption", actor, |s, _| {
                s.record_consumption(liters)
            })
            .await?;
        Ok(s)
    }

    pub async fn record_costs(
        &self,
        id: i64,
        energy: f64,
        labor: f64,
        actor: &str,
    ) -> Result<Session> {
        let (s, ()) = self
            .transition_session(id, "record_costs", actor, |s, _| s.record_costs(energy, labor))
            .await?;
        Ok(s)
    }

    /// Log an equipment problem on a session and raise the matching
    /// maintenance alert.
    pub async fn report_issue(
        &self,
        id: i64,
        description: &str,
        status: EquipmentStatus,
        actor: &str,
    ) -> Result<(Session, Alert)> {
        let (s, input) = self
            .transition_session(id, "report_issue", actor, |s, _| {
                s.report_issue(description, status)
            })
            .await?;
        let alert = self.raise_alert(input, actor).await?;
        Ok((s, alert))
    }

    // ── Alerts ───────────────────────────────────────────────────────

    /// Create an alert, group it with recent similar alerts and notify when
    /// its priority warrants it.
    pub async fn raise_alert(&self, input: NewAlert, actor: &str) -> Result<Alert> {
        let code = self.db.next_code(SequenceKind::Alert).await?;
        let mut alert = Alert::new(code, input, self.clock.now())?;
        self.db.insert_alert_grouped(&mut alert).await?;

        info!(
            alert = alert.id,
            code = %alert.code,
            kind = %alert.alert_type,
            priority = %alert.priority,
            recurring = alert.is_recurring,
            "alert raised"
        );
        self.audit(
            "alert",
            alert.id,
            "create",
            actor,
            None,
            alert.state.to_string(),
            Some(alert.name.clone()),
        )
        .await;

        if alert.notifies_on_creation() {
            if let Err(e) = self.notify(&mut alert).await {
                warn!(alert = alert.id, "notification failed: {e:#}");
            }
        }
        Ok(alert)
    }

    /// Send the alert's notification. Returns false when it has no
    /// recipients.
    async fn notify(&self, alert: &mut Alert) -> Result<bool> {
        let Some(n) = alert.notification(&self.settings.supervisors) else {
            return Ok(false);
        };
        self.notifier.send(&n).await?;
        alert.notification_count += 1;
        self.db.update_alert(alert).await?;
        info!(alert = alert.id, recipients = n.recipients.len(), "alert notified");
        Ok(true)
    }

    pub async fn send_notification(&self, id: i64) -> Result<bool> {
        let mut alert = self.alert(id).await?;
        self.notify(&mut alert).await
    }

    async fn transition_alert<F>(
        &self,
        id: i64,
        action: &'static str,
        actor: &str,
        f: F,
    ) -> Result<Alert>
    where
        F: FnOnce(&mut Alert, OffsetDateTime) -> DomainResult<()>,
    {
        let mut a = self.alert(id).await?;
        let from = a.state;
        f(&mut a, self.clock.now())?;
        self.db.update_alert(&mut a).await?;

        info!(alert = id, action, from = %from, to = %a.state, actor, "alert transition");
        self.audit("alert", id, action, actor, Some(from.to_string()), a.state.to_string(), None)
            .await;
        Ok(a)
    }

    pub async fn acknowledge_alert(&self, id: i64, actor: &str) -> Result<Alert> {
        self.transition_alert(id, "acknowledge", actor, |a, now| a.acknowledge(now, actor))
            .await
    }

    pub async fn start_alert_resolution(&self, id: i64, actor: &str) -> Result<Alert> {
        self.transition_alert(id, "start_resolution", actor, |a, _| a.start_resolution(actor))
            .await
    }

    pub async fn resolve_alert(
        &self,
        id: i64,
        actor: &str,
        notes: Option<String>,
    ) -> Result<Alert> {
        self.transition_alert(id, "resolve", actor, |a, now| a.resolve(now, actor, notes))
            .await
    }

    pub async fn dismiss_alert(&self, id: i64, actor: &str) -> Result<Alert> {
        self.transition_alert(id, "dismiss", actor, |a, now| a.dismiss(now, actor))
            .await
    }

    pub async fn reactivate_alert(&self, id: i64, actor: &str) -> Result<Alert> {
        self.transition_alert(id, "reactivate", actor, |a, _| a.reactivate())
            .await
    }

    pub async fn escalate_alert(&self, id: i64, actor: &str) -> Result<Alert> {
        self.transition_alert(id, "escalate", actor, |a, _| a.escalate())
            .await
    }

    pub async fn resolution_suggestions(&self, id: i64) -> Result<Vec<ResolutionSuggestion>> {
        let alert = self.alert(id).await?;
        let resolved = self.db.resolved_alerts_like(&alert, MAX_SUGGESTIONS).await?;
        Ok(resolved
            .into_iter()
            .filter_map(|a| {
                let resolution = a.resolution_notes.clone()?;
                Some(ResolutionSuggestion {
                    alert_id: a.id,
                    alert_code: a.code.clone(),
                    resolution,
                    resolution_time_hours: a.resolution_time_hours(),
                })
            })
            .collect())
    }

    // ── Zones & systems ──────────────────────────────────────────────

    pub async fn transition_zone<F>(
        &self,
        zone_id: &str,
        action: &'static str,
        actor: &str,
        f: F,
    ) -> Result<Zone>
    where
        F: FnOnce(&mut Zone) -> DomainResult<()>,
    {
        let mut z = self.zone(zone_id).await?;
        let from = z.state;
        f(&mut z)?;
        let parcel = self
            .db
            .get_parcel(&z.parcel_id)
            .await?
            .ok_or_else(|| IrrigationError::not_found("parcel", &z.parcel_id))?;
        z.validate(&parcel)?;
        self.db.upsert_zone(&z).await?;

        info!(zone = %zone_id, action, from = %from, to = %z.state, actor, "zone transition");
        self.audit(
            "zone",
            zone_id,
            action,
            actor,
            Some(from.to_string()),
            z.state.to_string(),
            None,
        )
        .await;
        Ok(z)
    }

    pub async fn transition_system<F>(
        &self,
        system_id: &str,
        action: &'static str,
        actor: &str,
        f: F,
    ) -> Result<IrrigationSystem>
    where
        F: FnOnce(&mut IrrigationSystem) -> DomainResult<()>,
    {
        let mut s = self.system(system_id).await?;
        let from = s.status;
        f(&mut s)?;
        s.validate()?;
        self.db.upsert_system(&s).await?;

        info!(
            system = %system_id,
            action,
            from = %from,
            to = %s.status,
            actor,
            "system transition"
        );
        self.audit(
            "system",
            system_id,
            action,
            actor,
            Some(from.to_string()),
            s.status.to_string(),
            None,
        )
        .await;
        Ok(s)
    }

    /// Latest instant at which a planned automatic session may still be
    /// started, or `None` when it has no program (no deadline).
    pub async fn start_deadline(&self, s: &Session) -> Result<Option<OffsetDateTime>> {
        let (Some(pid), Some(planned)) = (s.program_id, s.planned_start) else {
            return Ok(None);
        };
        let p = self.program(pid).await?;
        Ok(Some(p.start_deadline(planned.date())?))
    }

    /// Weather older than this is ignored by the gate checks.
    pub fn weather_max_age(&self) -> Duration {
        Duration::minutes(self.settings.weather_stale_min)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
