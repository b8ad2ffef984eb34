//! Batch scheduler: turns active programs into planned sessions, starts
//! automatic sessions when they come due and fails the ones whose start
//! window has passed.
//!
//! Each tick runs the passes in order, then publishes the retained status
//! snapshot on `hub/status`. A failure on one record is logged and counted;
//! the rest of the batch still runs. Nothing is retried within a tick.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use tracing::{debug, error, info, warn};

use crate::alert::{AlertPriority, AlertType, NewAlert};
use crate::gate::CONDITIONS_MET;
use crate::mqtt::STATUS_TOPIC;
use crate::program::{Program, ProgramState};
use crate::service::{IrrigationService, SYSTEM_ACTOR};
use crate::session::{Session, SessionState, SessionType};
use crate::state::SharedState;

/// Counters for one scheduler tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub planned: usize,
    pub rejected: usize,
    pub started: usize,
    pub missed: usize,
    pub withdrawn: usize,
    pub errors: usize,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop.  Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    svc: Arc<IrrigationService>,
    mqtt: AsyncClient,
    shared: SharedState,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);

    info!(tick_sec = tick.as_secs(), "scheduler started");
    {
        let mut st = shared.write().await;
        st.record_scheduler(format!("scheduler started (tick {}s)", tick.as_secs()));
    }

    loop {
        ticker.tick().await;

        let report = tick_once(&svc, &shared).await;
        if report != TickReport::default() {
            info!(
                planned = report.planned,
                rejected = report.rejected,
                started = report.started,
                missed = report.missed,
                withdrawn = report.withdrawn,
                errors = report.errors,
                "scheduler tick"
            );
        }

        publish_status(&mqtt, &shared).await;
    }
}

/// One pass over programs and planned sessions.
pub async fn tick_once(svc: &IrrigationService, shared: &SharedState) -> TickReport {
    let mut report = TickReport::default();
    plan_sessions(svc, shared, &mut report).await;
    advance_planned_sessions(svc, shared, &mut report).await;
    report
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

/// Evaluate every active program without an open session and plan a
/// session for each one that passes its gates.
async fn plan_sessions(svc: &IrrigationService, shared: &SharedState, report: &mut TickReport) {
    let programs = match svc.db().programs_in_state(ProgramState::Active).await {
        Ok(p) => p,
        Err(e) => {
            error!("scheduler: programs_in_state failed: {e:#}");
            report.errors += 1;
            return;
        }
    };

    for p in programs {
        if let Err(e) = plan_program(svc, shared, &p, report).await {
            warn!(program = p.id, code = %p.code, "scheduler: planning failed: {e:#}");
            report.errors += 1;
            let mut st = shared.write().await;
            st.record_error(format!("program {}: planning failed: {e:#}", p.code));
        }
    }
}

async fn plan_program(
    svc: &IrrigationService,
    shared: &SharedState,
    p: &Program,
    report: &mut TickReport,
) -> anyhow::Result<()> {
    if svc.db().has_open_session(p.id).await? {
        return Ok(());
    }

    let weather = {
        let st = shared.read().await;
        st.fresh_weather(&p.zone_id, svc.now(), svc.weather_max_age())
    };

    if let Err(rejection) = svc.evaluate_program(p, weather).await? {
        debug!(
            program = p.id,
            code = %p.code,
            reason = rejection.reason(),
            "scheduler: gate rejected"
        );
        report.rejected += 1;
        return Ok(());
    }

    let s = svc.create_session_from_program(p, SYSTEM_ACTOR).await?;
    report.planned += 1;

    info!(
        program = p.id,
        session = s.id,
        code = %s.code,
        reason = CONDITIONS_MET,
        "scheduler: session planned"
    );
    let mut st = shared.write().await;
    st.record_scheduler(format!("{}: planned {} ({})", p.code, s.code, s.name));
    Ok(())
}

/// Start due automatic sessions; fail the ones past their start deadline.
/// Sessions whose program left `active` since planning are cancelled.
async fn advance_planned_sessions(
    svc: &IrrigationService,
    shared: &SharedState,
    report: &mut TickReport,
) {
    let sessions = match svc.db().sessions_in_state(SessionState::Planned).await {
        Ok(s) => s,
        Err(e) => {
            error!("scheduler: sessions_in_state failed: {e:#}");
            report.errors += 1;
            return;
        }
    };

    let now = svc.now();
    for s in sessions {
        if s.session_type != SessionType::Automatic {
            continue;
        }
        let Some(planned) = s.planned_start else {
            continue;
        };
        if planned > now {
            continue;
        }

        if let Err(e) = advance_session(svc, shared, &s, report).await {
            warn!(session = s.id, code = %s.code, "scheduler: session update failed: {e:#}");
            report.errors += 1;
            let mut st = shared.write().await;
            st.record_error(format!("session {}: {e:#}", s.code));
        }
    }
}

async fn advance_session(
    svc: &IrrigationService,
    shared: &SharedState,
    s: &Session,
    report: &mut TickReport,
) -> anyhow::Result<()> {
    if let Some(program_id) = s.program_id {
        let program = svc.program(program_id).await?;
        if program.state != ProgramState::Active {
            svc.cancel_session(s.id, SYSTEM_ACTOR).await?;
            report.withdrawn += 1;
            info!(
                session = s.id,
                code = %s.code,
                program = %program.code,
                program_state = %program.state,
                "scheduler: program no longer active, session cancelled"
            );
            let mut st = shared.write().await;
            st.record_scheduler(format!(
                "{}: cancelled, program {} is {}",
                s.code, program.code, program.state
            ));
            return Ok(());
        }
    }

    let now = svc.now();
    let missed = matches!(svc.start_deadline(s).await?, Some(deadline) if now > deadline);

    if !missed {
        svc.start_session(s.id, SYSTEM_ACTOR).await?;
        report.started += 1;
        info!(session = s.id, code = %s.code, "scheduler: session started");
        let mut st = shared.write().await;
        st.record_scheduler(format!("{}: started", s.code));
        return Ok(());
    }

    svc.fail_session(s.id, SYSTEM_ACTOR).await?;
    report.missed += 1;
    warn!(session = s.id, code = %s.code, "scheduler: start window missed");

    svc.raise_alert(missed_start_alert(s), SYSTEM_ACTOR).await?;
    let mut st = shared.write().await;
    st.record_scheduler(format!("{}: start window missed, marked failed", s.code));
    Ok(())
}

fn missed_start_alert(s: &Session) -> NewAlert {
    NewAlert {
        name: format!("Missed start - {}", s.code),
        description: Some(format!(
            "Session {} was not started before its program's latest start time",
            s.name
        )),
        alert_type: AlertType::Schedule,
        priority: AlertPriority::Warning,
        system_id: Some(s.system_id.clone()),
        zone_id: Some(s.zone_id.clone()),
        session_id: Some(s.id),
        program_id: s.program_id,
        recommended_action: Some("Check the controller and reschedule the session".into()),
        ..NewAlert::default()
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

async fn publish_status(mqtt: &AsyncClient, shared: &SharedState) {
    let payload = {
        let st = shared.read().await;
        serde_json::to_vec(&st.to_status())
    };
    let payload = match payload {
        Ok(p) => p,
        Err(e) => {
            error!("scheduler: status serialisation failed: {e}");
            return;
        }
    };
    if let Err(e) = mqtt
        .publish(STATUS_TOPIC, QoS::AtLeastOnce, true, payload)
        .await
    {
        warn!("scheduler: failed to publish status: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
