//! Irrigation master data: parcels, irrigation systems and zones.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Date, Duration};

use crate::error::{DomainResult, IrrigationError};

/// Square metres per hectare.
const M2_PER_HA: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    pub parcel_id: String,
    pub name: String,
    pub surface_ha: f64,
}

// ---------------------------------------------------------------------------
// Irrigation system
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum IrrigationType {
    Drip,
    Sprinkler,
    MicroSpray,
    Surface,
    Subsurface,
    CenterPivot,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SystemStatus {
    Draft,
    Active,
    Maintenance,
    Broken,
    Suspended,
    Archived,
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Maintenance => "maintenance",
            Self::Broken => "broken",
            Self::Suspended => "suspended",
            Self::Archived => "archived",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationSystem {
    pub system_id: String,
    pub code: String,
    pub name: String,
    pub irrigation_type: IrrigationType,
    pub max_flow_rate: Option<f64>,
    pub status: SystemStatus,
    pub last_maintenance: Option<Date>,
    pub maintenance_frequency_days: i64,
}

impl IrrigationSystem {
    pub fn next_maintenance(&self) -> Option<Date> {
        let last = self.last_maintenance?;
        if self.maintenance_frequency_days <= 0 {
            return None;
        }
        last.checked_add(Duration::days(self.maintenance_frequency_days))
    }

    pub fn validate(&self) -> DomainResult<()> {
        if matches!(self.max_flow_rate, Some(r) if r <= 0.0) {
            return Err(IrrigationError::validation(format!(
                "system '{}': max_flow_rate must be positive",
                self.system_id
            )));
        }
        Ok(())
    }

    pub fn activate(&mut self) -> DomainResult<()> {
        if !matches!(self.status, SystemStatus::Draft | SystemStatus::Suspended) {
            return Err(IrrigationError::transition(
                "system",
                "activate",
                self.status,
                "draft or suspended",
            ));
        }
        self.status = SystemStatus::Active;
        Ok(())
    }

    pub fn suspend(&mut self) -> DomainResult<()> {
        if self.status != SystemStatus::Active {
            return Err(IrrigationError::transition(
                "system", "suspend", self.status, "active",
            ));
        }
        self.status = SystemStatus::Suspended;
        Ok(())
    }

    pub fn set_maintenance(&mut self) -> DomainResult<()> {
        if !matches!(self.status, SystemStatus::Active | SystemStatus::Suspended) {
            return Err(IrrigationError::transition(
                "system",
                "set_maintenance",
                self.status,
                "active or suspended",
            ));
        }
        self.status = SystemStatus::Maintenance;
        Ok(())
    }

    pub fn set_broken(&mut self) -> DomainResult<()> {
        if self.status == SystemStatus::Archived {
            return Err(IrrigationError::transition(
                "system",
                "set_broken",
                self.status,
                "any state except archived",
            ));
        }
        self.status = SystemStatus::Broken;
        Ok(())
    }

    pub fn archive(&mut self) {
        self.status = SystemStatus::Archived;
    }

    pub fn reset_to_draft(&mut self) {
        self.status = SystemStatus::Draft;
    }
}

// ---------------------------------------------------------------------------
// Zone
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ZoneState {
    Draft,
    Active,
    Suspended,
    Archived,
}

impl fmt::Display for ZoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Archived => "archived",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Zone {
    pub zone_id: String,
    pub code: String,
    pub name: String,
    pub parcel_id: String,
    pub system_id: String,
    pub surface_ha: f64,
    /// Litres per square metre per day.
    pub water_requirement_daily: f64,
    /// Litres per hour.
    pub water_flow_rate: Option<f64>,
    pub irrigation_frequency_days: i64,
    pub irrigation_duration_min: i64,
    pub state: ZoneState,
}

impl Zone {
    /// Check the zone against its parent parcel. Returns every violation
    /// joined, not just the first one.
    pub fn validate(&self, parcel: &Parcel) -> DomainResult<()> {
        let mut errors = Vec::new();

        if self.surface_ha <= 0.0 {
            errors.push(format!("surface_ha must be positive, got {}", self.surface_ha));
        } else if self.surface_ha > parcel.surface_ha {
            errors.push(format!(
                "surface_ha ({}) exceeds parcel '{}' surface ({})",
                self.surface_ha, parcel.parcel_id, parcel.surface_ha
            ));
        }
        if self.water_requirement_daily <= 0.0 {
            errors.push(format!(
                "water_requirement_daily must be positive, got {}",
                self.water_requirement_daily
            ));
        }
        if let Some(rate) = self.water_flow_rate {
            if rate <= 0.0 {
                errors.push(format!("water_flow_rate must be positive, got {rate}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(IrrigationError::validation(format!(
                "zone '{}': {}",
                self.zone_id,
                errors.join("; ")
            )))
        }
    }

    /// Daily water need of the whole zone in litres.
    pub fn daily_water_needs_l(&self) -> f64 {
        if self.surface_ha <= 0.0 || self.water_requirement_daily <= 0.0 {
            return 0.0;
        }
        self.surface_ha * self.water_requirement_daily * M2_PER_HA
    }

    /// Hours needed to deliver `target_l` (or the daily need) at the zone's
    /// flow rate. Zero without a flow rate.
    pub fn optimal_duration_hours(&self, target_l: Option<f64>) -> f64 {
        let Some(rate) = self.water_flow_rate.filter(|r| *r > 0.0) else {
            return 0.0;
        };
        let volume = target_l
            .filter(|v| *v > 0.0)
            .unwrap_or_else(|| self.daily_water_needs_l());
        volume / rate
    }

    pub fn activate(&mut self) -> DomainResult<()> {
        if !matches!(self.state, ZoneState::Draft | ZoneState::Suspended) {
            return Err(IrrigationError::transition(
                "zone",
                "activate",
                self.state,
                "draft or suspended",
            ));
        }
        self.state = ZoneState::Active;
        Ok(())
    }

    pub fn suspend(&mut self) -> DomainResult<()> {
        if self.state != ZoneState::Active {
            return Err(IrrigationError::transition(
                "zone", "suspend", self.state, "active",
            ));
        }
        self.state = ZoneState::Suspended;
        Ok(())
    }

    pub fn archive(&mut self) {
        self.state = ZoneState::Archived;
    }

    pub fn reset_to_draft(&mut self) {
        self.state = ZoneState::Draft;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn parcel() -> Parcel {
        Parcel {
            parcel_id: "p1".into(),
            name: "North field".into(),
            surface_ha: 2.0,
        }
    }

    fn zone() -> Zone {
        Zone {
            zone_id: "z1".into(),
            code: "ZONE-0001".into(),
            name: "Orchard".into(),
            parcel_id: "p1".into(),
            system_id: "sys1".into(),
            surface_ha: 0.5,
            water_requirement_daily: 2.0,
            water_flow_rate: Some(5000.0),
            irrigation_frequency_days: 2,
            irrigation_duration_min: 60,
            state: ZoneState::Draft,
        }
    }

    fn system() -> IrrigationSystem {
        IrrigationSystem {
            system_id: "sys1".into(),
            code: "SYS-0001".into(),
            name: "Drip line".into(),
            irrigation_type: IrrigationType::Drip,
            max_flow_rate: Some(8000.0),
            status: SystemStatus::Draft,
            last_maintenance: Some(date!(2024 - 01 - 01)),
            maintenance_frequency_days: 90,
        }
    }

    // -- Zone validation ---------------------------------------------------

    #[test]
    fn zone_within_parcel_is_valid() {
        zone().validate(&parcel()).unwrap();
    }

    #[test]
    fn zone_equal_to_parcel_surface_is_valid() {
        let z = Zone {
            surface_ha: 2.0,
            ..zone()
        };
        z.validate(&parcel()).unwrap();
    }

    #[test]
    fn zone_larger_than_parcel_rejected() {
        let z = Zone {
            surface_ha: 2.5,
            ..zone()
        };
        let err = z.validate(&parcel()).unwrap_err();
        assert!(err.to_string().contains("exceeds parcel 'p1'"), "{err}");
    }

    #[test]
    fn zone_non_positive_surface_rejected() {
        let z = Zone {
            surface_ha: 0.0,
            ..zone()
        };
        assert!(z.validate(&parcel()).is_err());
    }

    #[test]
    fn zone_collects_every_violation() {
        let z = Zone {
            surface_ha: -1.0,
            water_requirement_daily: 0.0,
            water_flow_rate: Some(-3.0),
            ..zone()
        };
        let msg = z.validate(&parcel()).unwrap_err().to_string();
        assert!(msg.contains("surface_ha"), "{msg}");
        assert!(msg.contains("water_requirement_daily"), "{msg}");
        assert!(msg.contains("water_flow_rate"), "{msg}");
    }

    // -- Water needs -------------------------------------------------------

    #[test]
    fn daily_water_needs_scales_hectares_to_square_metres() {
        // 0.5 ha * 2 L/m² * 10_000 m²/ha
        assert_eq!(zone().daily_water_needs_l(), 10_000.0);
    }

    #[test]
    fn optimal_duration_uses_daily_need_by_default() {
        assert_eq!(zone().optimal_duration_hours(None), 2.0);
        assert_eq!(zone().optimal_duration_hours(Some(2500.0)), 0.5);
    }

    #[test]
    fn optimal_duration_without_flow_rate_is_zero() {
        let z = Zone {
            water_flow_rate: None,
            ..zone()
        };
        assert_eq!(z.optimal_duration_hours(Some(1000.0)), 0.0);
    }

    // -- Workflows ---------------------------------------------------------

    #[test]
    fn zone_workflow() {
        let mut z = zone();
        z.suspend().unwrap_err();
        z.activate().unwrap();
        z.activate().unwrap_err();
        z.suspend().unwrap();
        z.activate().unwrap();
        z.archive();
        assert_eq!(z.state, ZoneState::Archived);
        z.activate().unwrap_err();
        z.reset_to_draft();
        assert_eq!(z.state, ZoneState::Draft);
    }

    #[test]
    fn system_workflow() {
        let mut s = system();
        s.set_maintenance().unwrap_err();
        s.activate().unwrap();
        s.set_maintenance().unwrap();
        s.set_broken().unwrap();
        s.archive();
        let err = s.set_broken().unwrap_err();
        assert!(matches!(err, IrrigationError::InvalidTransition { .. }));
    }

    #[test]
    fn system_next_maintenance() {
        assert_eq!(system().next_maintenance(), Some(date!(2024 - 03 - 31)));
        let s = IrrigationSystem {
            last_maintenance: None,
            ..system()
        };
        assert_eq!(s.next_maintenance(), None);
    }

    #[test]
    fn system_flow_rate_must_be_positive() {
        let s = IrrigationSystem {
            max_flow_rate: Some(0.0),
            ..system()
        };
        assert!(s.validate().is_err());
    }
}
