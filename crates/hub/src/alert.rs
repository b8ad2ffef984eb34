//! Irrigation alerts: lifecycle, escalation ladder, recurrence grouping and
//! notification composition.
//!
//! ```text
//! Active ──acknowledge──▶ Acknowledged ──start_resolution──▶ InProgress ──resolve──▶ Resolved
//!   │                         │                                  │
//!   └──────────── dismiss ────┴──────────────────────────────────┴──▶ Dismissed ──reactivate──▶ Active
//!
//! any non-terminal ──escalate──▶ Escalated (priority +1, capped)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::clock::hours_between;
use crate::error::{DomainResult, IrrigationError};
use crate::notify::Notification;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AlertType {
    Equipment,
    Water,
    Weather,
    Soil,
    Maintenance,
    Schedule,
    Quality,
    #[default]
    System,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Equipment => "equipment",
            Self::Water => "water",
            Self::Weather => "weather",
            Self::Soil => "soil",
            Self::Maintenance => "maintenance",
            Self::Schedule => "schedule",
            Self::Quality => "quality",
            Self::System => "system",
        })
    }
}

/// Ordered ladder; `Ord` follows declaration order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AlertPriority {
    Info,
    #[default]
    Warning,
    High,
    Critical,
    Emergency,
}

impl AlertPriority {
    pub fn score(&self) -> u8 {
        match self {
            Self::Info => 1,
            Self::Warning => 2,
            Self::High => 3,
            Self::Critical => 4,
            Self::Emergency => 5,
        }
    }

    /// One step up the ladder; `Emergency` is the ceiling.
    pub fn escalated(&self) -> Self {
        match self {
            Self::Info => Self::Warning,
            Self::Warning => Self::High,
            Self::High => Self::Critical,
            Self::Critical | Self::Emergency => Self::Emergency,
        }
    }
}

impl fmt::Display for AlertPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Acknowledged,
    InProgress,
    Resolved,
    Dismissed,
    Escalated,
}

impl AlertState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
            Self::Escalated => "escalated",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NewAlert {
    pub name: String,
    pub description: Option<String>,
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub system_id: Option<String>,
    pub zone_id: Option<String>,
    pub session_id: Option<i64>,
    pub program_id: Option<i64>,
    pub trigger_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub recommended_action: Option<String>,
    pub assigned_to: Option<String>,
    /// Defaults to the creation instant.
    #[serde(skip)]
    pub detected_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub alert_type: AlertType,
    pub priority: AlertPriority,

    pub system_id: Option<String>,
    pub zone_id: Option<String>,
    pub session_id: Option<i64>,
    pub program_id: Option<i64>,

    pub trigger_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub recommended_action: Option<String>,

    pub detected_at: OffsetDateTime,
    pub acknowledged_at: Option<OffsetDateTime>,
    pub resolved_at: Option<OffsetDateTime>,
    pub assigned_to: Option<String>,
    pub acknowledged_by: Option<String>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,

    pub state: AlertState,
    pub is_recurring: bool,
    pub recurrence_count: i64,
    pub parent_id: Option<i64>,
    pub notification_count: i64,
    pub version: i64,
}

/// Outcome of a recurrence search for a freshly created alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recurrence {
    pub parent_id: i64,
    pub count: i64,
}

/// Group a new alert with `similar` ones (same type, system and zone, trailing
/// 24 h). The parent is the root of the oldest similar alert.
pub fn plan_recurrence(similar: &[Alert]) -> Option<Recurrence> {
    let oldest = similar.iter().min_by_key(|a| (a.detected_at, a.id))?;
    Some(Recurrence {
        parent_id: oldest.parent_id.unwrap_or(oldest.id),
        count: similar.len() as i64 + 1,
    })
}

impl Alert {
    pub fn new(code: String, input: NewAlert, now: OffsetDateTime) -> DomainResult<Self> {
        let alert = Self {
            id: 0,
            code,
            name: input.name,
            description: input.description,
            alert_type: input.alert_type,
            priority: input.priority,
            system_id: input.system_id,
            zone_id: input.zone_id,
            session_id: input.session_id,
            program_id: input.program_id,
            trigger_value: input.trigger_value,
            threshold_value: input.threshold_value,
            recommended_action: input.recommended_action,
            detected_at: input.detected_at.unwrap_or(now),
            acknowledged_at: None,
            resolved_at: None,
            assigned_to: input.assigned_to,
            acknowledged_by: None,
            resolved_by: None,
            resolution_notes: None,
            state: AlertState::Active,
            is_recurring: false,
            recurrence_count: 1,
            parent_id: None,
            notification_count: 0,
            version: 0,
        };
        alert.validate()?;
        Ok(alert)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(IrrigationError::validation("alert name is empty"));
        }
        if let Some(ack) = self.acknowledged_at {
            if ack < self.detected_at {
                return Err(IrrigationError::validation(format!(
                    "alert {}: acknowledgement ({ack}) precedes detection ({})",
                    self.code, self.detected_at
                )));
            }
        }
        if let Some(resolved) = self.resolved_at {
            if resolved < self.detected_at {
                return Err(IrrigationError::validation(format!(
                    "alert {}: resolution ({resolved}) precedes detection ({})",
                    self.code, self.detected_at
                )));
            }
        }
        Ok(())
    }

    pub fn priority_score(&self) -> u8 {
        self.priority.score()
    }

    /// Hours from detection to acknowledgement, 0 when not acknowledged.
    pub fn response_time_hours(&self) -> f64 {
        self.acknowledged_at
            .map(|ack| hours_between(self.detected_at, ack))
            .unwrap_or(0.0)
    }

    /// Hours from detection to resolution, 0 when not resolved.
    pub fn resolution_time_hours(&self) -> f64 {
        self.resolved_at
            .map(|done| hours_between(self.detected_at, done))
            .unwrap_or(0.0)
    }

    // ── Transitions ──────────────────────────────────────────────────

    pub fn acknowledge(&mut self, now: OffsetDateTime, actor: &str) -> DomainResult<()> {
        if !matches!(self.state, AlertState::Active | AlertState::Escalated) {
            return Err(IrrigationError::transition(
                "alert",
                "acknowledge",
                self.state,
                "active or escalated",
            ));
        }
        self.state = AlertState::Acknowledged;
        self.acknowledged_at = Some(now);
        self.acknowledged_by = Some(actor.to_string());
        self.validate()
    }

    pub fn start_resolution(&mut self, actor: &str) -> DomainResult<()> {
        if !matches!(
            self.state,
            AlertState::Active | AlertState::Acknowledged | AlertState::Escalated
        ) {
            return Err(IrrigationError::transition(
                "alert",
                "start_resolution",
                self.state,
                "active, acknowledged or escalated",
            ));
        }
        self.state = AlertState::InProgress;
        self.assigned_to = Some(actor.to_string());
        self.validate()
    }

    pub fn resolve(
        &mut self,
        now: OffsetDateTime,
        actor: &str,
        notes: Option<String>,
    ) -> DomainResult<()> {
        if !matches!(self.state, AlertState::Acknowledged | AlertState::InProgress) {
            return Err(IrrigationError::transition(
                "alert",
                "resolve",
                self.state,
                "acknowledged or in_progress",
            ));
        }
        self.state = AlertState::Resolved;
        self.resolved_at = Some(now);
        self.resolved_by = Some(actor.to_string());
        if notes.is_some() {
            self.resolution_notes = notes;
        }
        self.validate()
    }

    pub fn dismiss(&mut self, now: OffsetDateTime, actor: &str) -> DomainResult<()> {
        if self.state.is_terminal() {
            return Err(IrrigationError::transition(
                "alert",
                "dismiss",
                self.state,
                "active, acknowledged, in_progress or escalated",
            ));
        }
        self.state = AlertState::Dismissed;
        self.resolved_at = Some(now);
        self.resolved_by = Some(actor.to_string());
        self.validate()
    }

    pub fn reactivate(&mut self) -> DomainResult<()> {
        if self.state != AlertState::Dismissed {
            return Err(IrrigationError::transition(
                "alert",
                "reactivate",
                self.state,
                "dismissed",
            ));
        }
        self.state = AlertState::Active;
        self.resolved_at = None;
        self.resolved_by = None;
        self.validate()
    }

    pub fn escalate(&mut self) -> DomainResult<()> {
        if self.state.is_terminal() {
            return Err(IrrigationError::transition(
                "alert",
                "escalate",
                self.state,
                "active, acknowledged, in_progress or escalated",
            ));
        }
        self.priority = self.priority.escalated();
        self.state = AlertState::Escalated;
        self.validate()
    }

    pub fn mark_recurring(&mut self, recurrence: Recurrence) {
        self.is_recurring = true;
        self.recurrence_count = recurrence.count;
        if recurrence.parent_id != self.id {
            self.parent_id = Some(recurrence.parent_id);
        }
    }

    // ── Notifications ────────────────────────────────────────────────

    /// Priorities at which a freshly created alert notifies on its own.
    pub fn notifies_on_creation(&self) -> bool {
        self.priority >= AlertPriority::High
    }

    /// Compose the notification for this alert, or `None` without recipients.
    pub fn notification(&self, supervisors: &[String]) -> Option<Notification> {
        let mut recipients: Vec<String> = self.assigned_to.iter().cloned().collect();
        if self.priority >= AlertPriority::Critical {
            for s in supervisors {
                if !recipients.contains(s) {
                    recipients.push(s.clone());
                }
            }
        }
        if recipients.is_empty() {
            return None;
        }

        let detected = self
            .detected_at
            .format(format_description!("[day]/[month]/[year] [hour]:[minute]"))
            .unwrap_or_else(|_| self.detected_at.to_string());
        let or_na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());

        let body = format!(
            "New irrigation alert detected:\n\
             \n\
             Type: {}\n\
             Priority: {}\n\
             \n\
             Description: {}\n\
             \n\
             System: {}\n\
             Zone: {}\n\
             \n\
             Detected: {detected}\n\
             \n\
             Recommended action: {}\n",
            self.alert_type,
            self.priority,
            or_na(&self.description),
            or_na(&self.system_id),
            or_na(&self.zone_id),
            self.recommended_action
                .clone()
                .unwrap_or_else(|| "See alert details".to_string()),
        );

        Some(Notification {
            recipients,
            subject: format!(
                "[{}] {}",
                self.priority.to_string().to_uppercase(),
                self.name
            ),
            body,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-06-12 06:00 UTC);

    pub(crate) fn equipment_alert() -> NewAlert {
        NewAlert {
            name: "Pump pressure drop".into(),
            alert_type: AlertType::Equipment,
            priority: AlertPriority::Warning,
            system_id: Some("sys1".into()),
            zone_id: Some("z1".into()),
            ..NewAlert::default()
        }
    }

    fn active_alert() -> Alert {
        Alert::new("ALERT-0001".into(), equipment_alert(), T0).unwrap()
    }

    // -- Priority ladder ---------------------------------------------------

    #[test]
    fn priority_scores_follow_ladder() {
        let scores: Vec<u8> = [
            AlertPriority::Info,
            AlertPriority::Warning,
            AlertPriority::High,
            AlertPriority::Critical,
            AlertPriority::Emergency,
        ]
        .iter()
        .map(AlertPriority::score)
        .collect();
        assert_eq!(scores, vec![1, 2, 3, 4, 5]);
        assert!(AlertPriority::High > AlertPriority::Warning);
    }

    #[test]
    fn escalate_bumps_priority_one_step() {
        let mut a = active_alert();
        a.escalate().unwrap();
        assert_eq!(a.priority, AlertPriority::High);
        assert_eq!(a.state, AlertState::Escalated);
        a.escalate().unwrap();
        assert_eq!(a.priority, AlertPriority::Critical);
    }

    #[test]
    fn escalate_at_emergency_stays_emergency() {
        let mut a = Alert {
            priority: AlertPriority::Emergency,
            ..active_alert()
        };
        a.escalate().unwrap();
        a.escalate().unwrap();
        assert_eq!(a.priority, AlertPriority::Emergency);
    }

    #[test]
    fn escalate_refused_on_terminal_states() {
        for state in [AlertState::Resolved, AlertState::Dismissed] {
            let mut a = Alert {
                state,
                ..active_alert()
            };
            assert!(a.escalate().is_err());
            assert_eq!(a.priority, AlertPriority::Warning);
        }
    }

    // -- Lifecycle ---------------------------------------------------------

    #[test]
    fn full_resolution_path_records_actors_and_times() {
        let mut a = active_alert();
        a.acknowledge(T0 + Duration::minutes(30), "alice").unwrap();
        a.start_resolution("bob").unwrap();
        a.resolve(T0 + Duration::hours(2), "bob", Some("replaced seal".into()))
            .unwrap();

        assert_eq!(a.state, AlertState::Resolved);
        assert_eq!(a.acknowledged_by.as_deref(), Some("alice"));
        assert_eq!(a.assigned_to.as_deref(), Some("bob"));
        assert_eq!(a.resolved_by.as_deref(), Some("bob"));
        assert_eq!(a.resolution_notes.as_deref(), Some("replaced seal"));
        assert_eq!(a.response_time_hours(), 0.5);
        assert_eq!(a.resolution_time_hours(), 2.0);
    }

    #[test]
    fn times_are_zero_until_set() {
        let a = active_alert();
        assert_eq!(a.response_time_hours(), 0.0);
        assert_eq!(a.resolution_time_hours(), 0.0);
    }

    #[test]
    fn resolve_requires_acknowledged_or_in_progress() {
        let mut a = active_alert();
        let err = a.resolve(T0, "bob", None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot resolve alert in state 'active' (requires acknowledged or in_progress)"
        );
    }

    #[test]
    fn acknowledgement_before_detection_rejected() {
        let mut a = active_alert();
        let err = a.acknowledge(T0 - Duration::minutes(1), "alice").unwrap_err();
        assert!(matches!(err, IrrigationError::Validation(_)));
    }

    #[test]
    fn escalated_alert_can_be_acknowledged_and_worked() {
        let mut a = active_alert();
        a.escalate().unwrap();
        a.acknowledge(T0, "alice").unwrap();

        let mut b = active_alert();
        b.escalate().unwrap();
        b.start_resolution("bob").unwrap();
        assert_eq!(b.state, AlertState::InProgress);
    }

    #[test]
    fn dismiss_and_reactivate() {
        let mut a = active_alert();
        a.dismiss(T0 + Duration::hours(1), "alice").unwrap();
        assert_eq!(a.state, AlertState::Dismissed);
        assert_eq!(a.resolved_by.as_deref(), Some("alice"));

        a.reactivate().unwrap();
        assert_eq!(a.state, AlertState::Active);
        assert_eq!(a.resolved_at, None);
        assert_eq!(a.resolved_by, None);

        let mut resolved = Alert {
            state: AlertState::Resolved,
            ..active_alert()
        };
        assert!(resolved.dismiss(T0, "alice").is_err());
        assert!(resolved.reactivate().is_err());
    }

    // -- Recurrence --------------------------------------------------------

    #[test]
    fn no_similar_alerts_no_recurrence() {
        assert_eq!(plan_recurrence(&[]), None);
    }

    #[test]
    fn second_alert_two_hours_later_is_recurring() {
        let first = Alert {
            id: 1,
            ..active_alert()
        };
        let mut second = Alert::new(
            "ALERT-0002".into(),
            NewAlert {
                detected_at: Some(T0 + Duration::hours(2)),
                ..equipment_alert()
            },
            T0 + Duration::hours(2),
        )
        .unwrap();
        second.id = 2;

        let rec = plan_recurrence(std::slice::from_ref(&first)).unwrap();
        second.mark_recurring(rec);

        assert!(second.is_recurring);
        assert_eq!(second.recurrence_count, 2);
        assert_eq!(second.parent_id, Some(1));
    }

    #[test]
    fn recurrence_parent_is_root_of_oldest() {
        let root = Alert {
            id: 1,
            detected_at: T0 - Duration::hours(30),
            ..active_alert()
        };
        let older = Alert {
            id: 5,
            parent_id: Some(root.id),
            detected_at: T0,
            ..active_alert()
        };
        let newer = Alert {
            id: 6,
            parent_id: Some(root.id),
            detected_at: T0 + Duration::hours(1),
            ..active_alert()
        };
        let rec = plan_recurrence(&[newer, older]).unwrap();
        assert_eq!(rec, Recurrence { parent_id: 1, count: 3 });
    }

    #[test]
    fn parent_marked_recurring_keeps_no_self_link() {
        let mut parent = Alert {
            id: 1,
            ..active_alert()
        };
        parent.mark_recurring(Recurrence { parent_id: 1, count: 2 });
        assert!(parent.is_recurring);
        assert_eq!(parent.parent_id, None);
    }

    // -- Notifications -----------------------------------------------------

    #[test]
    fn notification_needs_recipients() {
        assert_eq!(active_alert().notification(&["sup".into()]), None);
    }

    #[test]
    fn critical_alert_notifies_supervisors() {
        let a = Alert {
            priority: AlertPriority::Critical,
            assigned_to: Some("alice".into()),
            ..active_alert()
        };
        let n = a.notification(&["sup".into(), "alice".into()]).unwrap();
        assert_eq!(n.recipients, vec!["alice".to_string(), "sup".to_string()]);
        assert_eq!(n.subject, "[CRITICAL] Pump pressure drop");
        assert!(n.body.contains("Type: equipment"));
        assert!(n.body.contains("System: sys1"));
        assert!(n.body.contains("Detected: 12/06/2024 06:00"));
        assert!(n.body.contains("Description: N/A"));
    }

    #[test]
    fn high_alert_skips_supervisors() {
        let a = Alert {
            priority: AlertPriority::High,
            assigned_to: Some("alice".into()),
            ..active_alert()
        };
        assert!(a.notifies_on_creation());
        let n = a.notification(&["sup".into()]).unwrap();
        assert_eq!(n.recipients, vec!["alice".to_string()]);
    }
}
