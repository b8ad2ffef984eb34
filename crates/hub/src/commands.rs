//! Operator commands received over MQTT.
//!
//! Payloads are JSON objects carrying the acting user and an `action` tag,
//! e.g. `{"user": "alice", "action": "record_consumption", "liters": 850}`.
//! Each command maps onto one service operation.

use anyhow::{Context, Result};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::alert::NewAlert;
use crate::mqtt::CommandTopic;
use crate::service::{IrrigationService, ManualSessionRequest};
use crate::session::{EquipmentStatus, SessionType};
use crate::state::SharedState;
use crate::zone::{IrrigationSystem, Zone};

#[derive(Debug, Deserialize)]
pub struct Command<A> {
    pub user: String,
    #[serde(flatten)]
    pub action: A,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionAction {
    Start,
    Pause,
    Resume,
    Complete,
    Cancel,
    Fail,
    RecordConsumption {
        liters: f64,
    },
    RecordCosts {
        #[serde(default)]
        energy: f64,
        #[serde(default)]
        labor: f64,
    },
    ReportIssue {
        description: String,
        equipment_status: EquipmentStatus,
    },
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AlertAction {
    Acknowledge,
    StartResolution,
    Resolve {
        #[serde(default)]
        notes: Option<String>,
    },
    Dismiss,
    Reactivate,
    Escalate,
    Notify,
    Suggest,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProgramAction {
    Activate,
    Suspend,
    Complete,
    Cancel,
    ResetToDraft,
    /// Evaluate the gates now and create a session if they pass.
    Run,
    Report,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ZoneAction {
    Activate,
    Suspend,
    Archive,
    ResetToDraft,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SystemAction {
    Activate,
    Suspend,
    SetMaintenance,
    SetBroken,
    Archive,
    ResetToDraft,
}

/// Payload of `session/new`.
#[derive(Debug, Deserialize)]
pub struct NewSessionMsg {
    pub user: String,
    pub name: String,
    pub zone_id: String,
    #[serde(default = "default_session_type")]
    pub session_type: SessionType,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub planned_start: Option<OffsetDateTime>,
    pub duration_minutes_planned: Option<i64>,
    pub water_volume_target: Option<f64>,
}

fn default_session_type() -> SessionType {
    SessionType::Manual
}

fn parse<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).context("bad command json")
}

/// Run the command addressed by `topic`. Returns a one-line summary of what
/// happened.
pub async fn dispatch(
    svc: &IrrigationService,
    shared: &SharedState,
    topic: CommandTopic<'_>,
    payload: &[u8],
) -> Result<String> {
    match topic {
        CommandTopic::Session(id) => session_command(svc, id, parse(payload)?).await,
        CommandTopic::Alert(id) => alert_command(svc, id, parse(payload)?).await,
        CommandTopic::Program(id) => program_command(svc, shared, id, parse(payload)?).await,
        CommandTopic::Zone(zone_id) => zone_command(svc, zone_id, parse(payload)?).await,
        CommandTopic::System(system_id) => system_command(svc, system_id, parse(payload)?).await,
        CommandTopic::NewSession => {
            let msg: NewSessionMsg = parse(payload)?;
            let s = svc
                .create_manual_session(
                    ManualSessionRequest {
                        name: msg.name,
                        zone_id: msg.zone_id,
                        session_type: msg.session_type,
                        planned_start: msg.planned_start,
                        duration_minutes_planned: msg.duration_minutes_planned,
                        water_volume_target: msg.water_volume_target,
                    },
                    &msg.user,
                )
                .await?;
            Ok(format!("session {} ({}) planned", s.id, s.code))
        }
        CommandTopic::RaiseAlert => {
            let cmd: Command<NewAlert> = parse(payload)?;
            let a = svc.raise_alert(cmd.action, &cmd.user).await?;
            Ok(format!(
                "alert {} ({}) raised, priority {}",
                a.id, a.code, a.priority
            ))
        }
    }
}

async fn session_command(
    svc: &IrrigationService,
    id: i64,
    cmd: Command<SessionAction>,
) -> Result<String> {
    let user = cmd.user.as_str();
    let s = match cmd.action {
        SessionAction::Start => svc.start_session(id, user).await?,
        SessionAction::Pause => svc.pause_session(id, user).await?,
        SessionAction::Resume => svc.resume_session(id, user).await?,
        SessionAction::Complete => svc.complete_session(id, user).await?,
        SessionAction::Cancel => svc.cancel_session(id, user).await?,
        SessionAction::Fail => svc.fail_session(id, user).await?,
        SessionAction::RecordConsumption { liters } => {
            svc.record_consumption(id, liters, user).await?
        }
        SessionAction::RecordCosts { energy, labor } => {
            svc.record_costs(id, energy, labor, user).await?
        }
        SessionAction::ReportIssue {
            description,
            equipment_status,
        } => {
            let (s, alert) = svc
                .report_issue(id, &description, equipment_status, user)
                .await?;
            return Ok(format!(
                "session {} issue logged, alert {} raised",
                s.code, alert.code
            ));
        }
    };
    Ok(format!(
        "session {} {} (efficiency {:.1}%)",
        s.code, s.state, s.metrics.water_efficiency
    ))
}

async fn alert_command(
    svc: &IrrigationService,
    id: i64,
    cmd: Command<AlertAction>,
) -> Result<String> {
    let user = cmd.user.as_str();
    let a = match cmd.action {
        AlertAction::Acknowledge => svc.acknowledge_alert(id, user).await?,
        AlertAction::StartResolution => svc.start_alert_resolution(id, user).await?,
        AlertAction::Resolve { notes } => svc.resolve_alert(id, user, notes).await?,
        AlertAction::Dismiss => svc.dismiss_alert(id, user).await?,
        AlertAction::Reactivate => svc.reactivate_alert(id, user).await?,
        AlertAction::Escalate => svc.escalate_alert(id, user).await?,
        AlertAction::Notify => {
            let sent = svc.send_notification(id).await?;
            return Ok(if sent {
                format!("alert {id} notified")
            } else {
                format!("alert {id} has no recipients")
            });
        }
        AlertAction::Suggest => {
            let suggestions = svc.resolution_suggestions(id).await?;
            if suggestions.is_empty() {
                return Ok(format!("alert {id}: no past resolutions"));
            }
            let lines: Vec<String> = suggestions
                .iter()
                .map(|s| {
                    format!(
                        "{} ({:.1} h): {}",
                        s.alert_code, s.resolution_time_hours, s.resolution
                    )
                })
                .collect();
            return Ok(format!("alert {id} suggestions: {}", lines.join(" | ")));
        }
    };
    let mut summary = format!(
        "alert {} {} ({}, score {})",
        a.code,
        a.state,
        a.priority,
        a.priority_score()
    );
    if a.resolved_at.is_some() {
        summary.push_str(&format!(
            ", response {:.1} h, resolution {:.1} h",
            a.response_time_hours(),
            a.resolution_time_hours()
        ));
    }
    Ok(summary)
}

async fn program_command(
    svc: &IrrigationService,
    shared: &SharedState,
    id: i64,
    cmd: Command<ProgramAction>,
) -> Result<String> {
    let user = cmd.user.as_str();
    let p = match cmd.action {
        ProgramAction::Activate => svc.activate_program(id, user).await?,
        ProgramAction::Suspend => svc.suspend_program(id, user).await?,
        ProgramAction::Complete => svc.complete_program(id, user).await?,
        ProgramAction::Cancel => svc.cancel_program(id, user).await?,
        ProgramAction::ResetToDraft => svc.reset_program_to_draft(id, user).await?,
        ProgramAction::Run => {
            let p = svc.program(id).await?;
            let weather = {
                let st = shared.read().await;
                st.fresh_weather(&p.zone_id, svc.now(), svc.weather_max_age())
            };
            let s = svc.run_program(id, user, weather).await?;
            return Ok(format!("program {} planned session {}", p.code, s.code));
        }
        ProgramAction::Report => {
            let p = svc.program(id).await?;
            let stats = svc.program_stats(id).await?;
            let next = svc.next_execution(id).await?;
            return Ok(format!(
                "program {}: {} session(s), {:.1} L, {:.1}% success, avg {:.1} min, next {}",
                p.code,
                stats.session_count,
                stats.total_water_consumed,
                stats.success_rate,
                stats.average_duration_min,
                next.map(|t| t.to_string()).unwrap_or_else(|| "none".to_string())
            ));
        }
    };
    Ok(format!("program {} {}", p.code, p.state))
}

async fn zone_command(
    svc: &IrrigationService,
    zone_id: &str,
    cmd: Command<ZoneAction>,
) -> Result<String> {
    let user = cmd.user.as_str();
    let z = match cmd.action {
        ZoneAction::Activate => {
            svc.transition_zone(zone_id, "activate", user, Zone::activate)
                .await?
        }
        ZoneAction::Suspend => {
            svc.transition_zone(zone_id, "suspend", user, Zone::suspend)
                .await?
        }
        ZoneAction::Archive => {
            svc.transition_zone(zone_id, "archive", user, |z| {
                z.archive();
                Ok(())
            })
            .await?
        }
        ZoneAction::ResetToDraft => {
            svc.transition_zone(zone_id, "reset_to_draft", user, |z| {
                z.reset_to_draft();
                Ok(())
            })
            .await?
        }
    };
    Ok(format!("zone {} {}", z.zone_id, z.state))
}

async fn system_command(
    svc: &IrrigationService,
    system_id: &str,
    cmd: Command<SystemAction>,
) -> Result<String> {
    let user = cmd.user.as_str();
    let s = match cmd.action {
        SystemAction::Activate => {
            svc.transition_system(system_id, "activate", user, IrrigationSystem::activate)
                .await?
        }
        SystemAction::Suspend => {
            svc.transition_system(system_id, "suspend", user, IrrigationSystem::suspend)
                .await?
        }
        SystemAction::SetMaintenance => {
            svc.transition_system(
                system_id,
                "set_maintenance",
                user,
                IrrigationSystem::set_maintenance,
            )
            .await?
        }
        SystemAction::SetBroken => {
            svc.transition_system(system_id, "set_broken", user, IrrigationSystem::set_broken)
                .await?
        }
        SystemAction::Archive => {
            svc.transition_system(system_id, "archive", user, |s| {
                s.archive();
                Ok(())
            })
            .await?
        }
        SystemAction::ResetToDraft => {
            svc.transition_system(system_id, "reset_to_draft", user, |s| {
                s.reset_to_draft();
                Ok(())
            })
            .await?
        }
    };
    Ok(format!("system {} {}", s.system_id, s.status))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertPriority, AlertState, AlertType};
    use crate::error::IrrigationError;
    use crate::gate::WeatherSnapshot;
    use crate::program::tests::test_program;
    use crate::program::ProgramState;
    use crate::service::tests::{harness, insert_program, T0};
    use crate::session::SessionState;
    use crate::state::SystemState;
    use crate::zone::ZoneState;
    use std::sync::Arc;
    use time::macros::datetime;
    use tokio::sync::RwLock;

    fn shared() -> SharedState {
        Arc::new(RwLock::new(SystemState::new()))
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn session_actions_parse() {
        let cmd: Command<SessionAction> =
            serde_json::from_str(r#"{"user":"alice","action":"record_consumption","liters":850}"#)
                .unwrap();
        assert_eq!(cmd.user, "alice");
        assert_eq!(cmd.action, SessionAction::RecordConsumption { liters: 850.0 });

        let cmd: Command<SessionAction> = serde_json::from_str(
            r#"{"user":"bob","action":"report_issue","description":"leak","equipment_status":"broken"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd.action,
            SessionAction::ReportIssue {
                description: "leak".into(),
                equipment_status: EquipmentStatus::Broken
            }
        );
    }

    #[test]
    fn costs_default_to_zero() {
        let cmd: Command<SessionAction> =
            serde_json::from_str(r#"{"user":"a","action":"record_costs","energy":2.5}"#).unwrap();
        assert_eq!(
            cmd.action,
            SessionAction::RecordCosts {
                energy: 2.5,
                labor: 0.0
            }
        );
    }

    #[test]
    fn resolve_notes_optional() {
        let cmd: Command<AlertAction> =
            serde_json::from_str(r#"{"user":"a","action":"resolve"}"#).unwrap();
        assert_eq!(cmd.action, AlertAction::Resolve { notes: None });
    }

    #[test]
    fn unknown_action_rejected() {
        let unknown = r#"{"user":"a","action":"explode"}"#;
        assert!(serde_json::from_str::<Command<SessionAction>>(unknown).is_err());
        let no_user = r#"{"action":"start"}"#;
        assert!(serde_json::from_str::<Command<SessionAction>>(no_user).is_err());
    }

    #[test]
    fn new_session_msg_parses_rfc3339() {
        let msg: NewSessionMsg = serde_json::from_str(
            r#"{"user":"a","name":"Flush","zone_id":"z1","planned_start":"2024-06-12T07:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(msg.session_type, SessionType::Manual);
        assert_eq!(msg.planned_start, Some(datetime!(2024-06-12 07:00 UTC)));
        assert_eq!(msg.duration_minutes_planned, None);
    }

    #[test]
    fn raise_alert_payload_uses_defaults() {
        let cmd: Command<NewAlert> = serde_json::from_str(
            r#"{"user":"a","name":"Valve stuck","alert_type":"equipment","system_id":"sys1"}"#,
        )
        .unwrap();
        assert_eq!(cmd.action.alert_type, AlertType::Equipment);
        assert_eq!(cmd.action.priority, AlertPriority::Warning);
        assert_eq!(cmd.action.detected_at, None);
    }

    // -- Dispatch -----------------------------------------------------------

    #[tokio::test]
    async fn session_commands_drive_lifecycle() {
        let h = harness().await;
        let st = shared();
        let id = insert_program(&h.db, test_program()).await;
        let s = h.svc.run_program(id, "alice", None).await.unwrap();

        h.clock.set(datetime!(2024-06-12 06:00 UTC));
        let topic = format!("session/{}/cmd", s.id);
        let t = CommandTopic::parse(&topic).unwrap().unwrap();
        dispatch(&h.svc, &st, t.clone(), br#"{"user":"op","action":"start"}"#)
            .await
            .unwrap();
        dispatch(
            &h.svc,
            &st,
            t.clone(),
            br#"{"user":"op","action":"record_consumption","liters":1000}"#,
        )
        .await
        .unwrap();
        h.clock.set(datetime!(2024-06-12 07:00 UTC));
        let summary = dispatch(&h.svc, &st, t, br#"{"user":"op","action":"complete"}"#)
            .await
            .unwrap();
        assert_eq!(summary, "session SESS-0001 completed (efficiency 100.0%)");
        assert_eq!(h.svc.session(s.id).await.unwrap().state, SessionState::Completed);
    }

    #[tokio::test]
    async fn illegal_transition_is_domain_error() {
        let h = harness().await;
        let st = shared();
        let id = insert_program(&h.db, test_program()).await;
        let s = h.svc.run_program(id, "alice", None).await.unwrap();

        let err = dispatch(
            &h.svc,
            &st,
            CommandTopic::Session(s.id),
            br#"{"user":"op","action":"pause"}"#,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IrrigationError>(),
            Some(IrrigationError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn bad_json_is_reported() {
        let h = harness().await;
        let err = dispatch(&h.svc, &shared(), CommandTopic::Alert(1), b"not json")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("bad command json"));
    }

    #[tokio::test]
    async fn program_run_uses_fresh_weather() {
        let h = harness().await;
        let st = shared();
        let id = insert_program(&h.db, test_program()).await;
        st.write().await.record_weather(
            "z1",
            T0,
            WeatherSnapshot {
                precipitation_mm: 12.0,
                temperature_c: 18.0,
                wind_speed_kmh: 3.0,
            },
        );

        let err = dispatch(
            &h.svc,
            &st,
            CommandTopic::Program(id),
            br#"{"user":"alice","action":"run"}"#,
        )
        .await
        .unwrap_err();
        match err.downcast_ref::<IrrigationError>() {
            Some(IrrigationError::GateRejected(r)) => assert_eq!(r.reason(), "rain detected"),
            other => panic!("unexpected {other:?}"),
        }

        // Stale after the configured window.
        h.clock.advance(time::Duration::minutes(181));
        let summary = dispatch(
            &h.svc,
            &st,
            CommandTopic::Program(id),
            br#"{"user":"alice","action":"run"}"#,
        )
        .await
        .unwrap();
        assert_eq!(summary, "program PROG-0001 planned session SESS-0001");
    }

    #[tokio::test]
    async fn program_transitions_and_report() {
        let h = harness().await;
        let st = shared();
        let id = insert_program(&h.db, test_program()).await;

        let summary = dispatch(
            &h.svc,
            &st,
            CommandTopic::Program(id),
            br#"{"user":"alice","action":"suspend"}"#,
        )
        .await
        .unwrap();
        assert_eq!(summary, "program PROG-0001 suspended");
        assert_eq!(h.svc.program(id).await.unwrap().state, ProgramState::Suspended);

        let report = dispatch(
            &h.svc,
            &st,
            CommandTopic::Program(id),
            br#"{"user":"alice","action":"report"}"#,
        )
        .await
        .unwrap();
        assert!(report.contains("0 session(s)"), "{report}");
        assert!(report.ends_with("next none"), "{report}");
    }

    #[tokio::test]
    async fn new_session_and_raise_alert_topics() {
        let h = harness().await;
        let st = shared();

        let summary = dispatch(
            &h.svc,
            &st,
            CommandTopic::NewSession,
            br#"{"user":"alice","name":"Flush","zone_id":"z1","duration_minutes_planned":15}"#,
        )
        .await
        .unwrap();
        assert_eq!(summary, "session 1 (SESS-0001) planned");

        let summary = dispatch(
            &h.svc,
            &st,
            CommandTopic::RaiseAlert,
            br#"{"user":"alice","name":"Valve stuck","alert_type":"equipment","priority":"high","assigned_to":"bob"}"#,
        )
        .await
        .unwrap();
        assert_eq!(summary, "alert 1 (ALERT-0001) raised, priority high");
        assert_eq!(h.notifier.sent()[0].recipients, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn alert_commands() {
        let h = harness().await;
        let st = shared();
        let a = h
            .svc
            .raise_alert(
                NewAlert {
                    name: "Pump".into(),
                    alert_type: AlertType::Equipment,
                    system_id: Some("sys1".into()),
                    ..NewAlert::default()
                },
                "system",
            )
            .await
            .unwrap();

        let t = CommandTopic::Alert(a.id);
        dispatch(&h.svc, &st, t.clone(), br#"{"user":"bob","action":"acknowledge"}"#)
            .await
            .unwrap();
        let summary = dispatch(
            &h.svc,
            &st,
            t.clone(),
            br#"{"user":"bob","action":"resolve","notes":"primed pump"}"#,
        )
        .await
        .unwrap();
        assert_eq!(
            summary,
            "alert ALERT-0001 resolved (warning, score 2), response 0.0 h, resolution 0.0 h"
        );
        assert_eq!(h.svc.alert(a.id).await.unwrap().state, AlertState::Resolved);

        let summary = dispatch(&h.svc, &st, t, br#"{"user":"bob","action":"suggest"}"#)
            .await
            .unwrap();
        assert_eq!(summary, "alert 1: no past resolutions");
    }

    #[tokio::test]
    async fn zone_and_system_commands() {
        let h = harness().await;
        let st = shared();

        let summary = dispatch(
            &h.svc,
            &st,
            CommandTopic::Zone("z1"),
            br#"{"user":"alice","action":"archive"}"#,
        )
        .await
        .unwrap();
        assert_eq!(summary, "zone z1 archived");
        assert_eq!(
            h.db.get_zone("z1").await.unwrap().unwrap().state,
            ZoneState::Archived
        );

        let summary = dispatch(
            &h.svc,
            &st,
            CommandTopic::System("sys1"),
            br#"{"user":"alice","action":"set_broken"}"#,
        )
        .await
        .unwrap();
        assert_eq!(summary, "system sys1 broken");
    }
}
