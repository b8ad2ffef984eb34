//! Program gate evaluator: may this program create a session today?
//!
//! Checks run in a fixed order and stop at the first failure. The evaluator is
//! pure; the caller supplies the weather snapshot and soil moisture it has on
//! hand (either may be missing, in which case that check is skipped).

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{Date, Duration};

use crate::program::{FrequencyType, Program, ProgramState};

/// Moisture margin above the threshold at which the soil counts as wet.
pub const WET_SOIL_MARGIN_PCT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub precipitation_mm: f64,
    pub temperature_c: f64,
    pub wind_speed_kmh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateContext {
    pub today: Date,
    pub last_execution: Option<Date>,
    pub weather: Option<WeatherSnapshot>,
    /// Percent, from the zone's latest sensor reading.
    pub soil_moisture_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    NotActive,
    StartDateNotReached { start: Date },
    EndDatePassed { end: Date },
    FrequencyNotMet { next_allowed: Date },
    WeekdayNotAllowed,
    RainDetected { mm: f64 },
    TemperatureTooLow { celsius: f64 },
    TemperatureTooHigh { celsius: f64 },
    WindTooStrong { kmh: f64 },
    SoilTooWet { moisture_pct: f64 },
}

impl GateRejection {
    /// Short stable tag, used in logs and status events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotActive => "not active",
            Self::StartDateNotReached { .. } => "start date not reached",
            Self::EndDatePassed { .. } => "end date passed",
            Self::FrequencyNotMet { .. } => "frequency not met",
            Self::WeekdayNotAllowed => "weekday not allowed",
            Self::RainDetected { .. } => "rain detected",
            Self::TemperatureTooLow { .. } => "temperature too low",
            Self::TemperatureTooHigh { .. } => "temperature too high",
            Self::WindTooStrong { .. } => "wind too strong",
            Self::SoilTooWet { .. } => "soil too wet",
        }
    }
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartDateNotReached { start } => write!(f, "{} ({start})", self.reason()),
            Self::EndDatePassed { end } => write!(f, "{} ({end})", self.reason()),
            Self::FrequencyNotMet { next_allowed } => {
                write!(f, "{} (next run {next_allowed})", self.reason())
            }
            Self::RainDetected { mm } => write!(f, "{} ({mm} mm)", self.reason()),
            Self::TemperatureTooLow { celsius } | Self::TemperatureTooHigh { celsius } => {
                write!(f, "{} ({celsius} °C)", self.reason())
            }
            Self::WindTooStrong { kmh } => write!(f, "{} ({kmh} km/h)", self.reason()),
            Self::SoilTooWet { moisture_pct } => {
                write!(f, "{} ({moisture_pct:.1}%)", self.reason())
            }
            Self::NotActive | Self::WeekdayNotAllowed => f.write_str(self.reason()),
        }
    }
}

/// Tag reported when every check passes.
pub const CONDITIONS_MET: &str = "conditions met";

pub fn evaluate(program: &Program, ctx: &GateContext) -> Result<(), GateRejection> {
    if program.state != ProgramState::Active {
        return Err(GateRejection::NotActive);
    }

    if ctx.today < program.start_date {
        return Err(GateRejection::StartDateNotReached {
            start: program.start_date,
        });
    }
    if let Some(end) = program.end_date {
        if ctx.today > end {
            return Err(GateRejection::EndDatePassed { end });
        }
    }

    if let (Some(last), Some(days)) = (ctx.last_execution, program.frequency_days) {
        let next_allowed = last + Duration::days(days);
        if ctx.today < next_allowed {
            return Err(GateRejection::FrequencyNotMet { next_allowed });
        }
    }

    if program.frequency_type == FrequencyType::Weekly
        && !program.weekdays.allows(ctx.today.weekday())
    {
        return Err(GateRejection::WeekdayNotAllowed);
    }

    if let Some(w) = ctx.weather {
        check_weather(program, &w)?;
    }

    if program.use_soil_analysis && program.stop_if_wet_soil {
        if let Some(moisture) = ctx.soil_moisture_pct {
            if moisture > program.soil_moisture_threshold + WET_SOIL_MARGIN_PCT {
                return Err(GateRejection::SoilTooWet {
                    moisture_pct: moisture,
                });
            }
        }
    }

    Ok(())
}

fn check_weather(program: &Program, w: &WeatherSnapshot) -> Result<(), GateRejection> {
    if program.stop_if_rain && w.precipitation_mm >= program.rain_threshold_mm {
        return Err(GateRejection::RainDetected {
            mm: w.precipitation_mm,
        });
    }
    if let Some(min) = program.temperature_min {
        if w.temperature_c < min {
            return Err(GateRejection::TemperatureTooLow {
                celsius: w.temperature_c,
            });
        }
    }
    if let Some(max) = program.temperature_max {
        if w.temperature_c > max {
            return Err(GateRejection::TemperatureTooHigh {
                celsius: w.temperature_c,
            });
        }
    }
    if let Some(max) = program.wind_speed_max {
        if w.wind_speed_kmh > max {
            return Err(GateRejection::WindTooStrong {
                kmh: w.wind_speed_kmh,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::tests::test_program;
    use crate::program::Weekdays;
    use time::macros::date;
    use time::Weekday;

    fn ctx(today: Date) -> GateContext {
        GateContext {
            today,
            last_execution: Some(date!(2024 - 06 - 10)),
            weather: None,
            soil_moisture_pct: None,
        }
    }

    fn calm() -> WeatherSnapshot {
        WeatherSnapshot {
            precipitation_mm: 0.0,
            temperature_c: 20.0,
            wind_speed_kmh: 5.0,
        }
    }

    #[test]
    fn frequency_window_scenario() {
        let p = test_program();
        let err = evaluate(&p, &ctx(date!(2024 - 06 - 11))).unwrap_err();
        assert_eq!(err.reason(), "frequency not met");
        assert_eq!(
            err,
            GateRejection::FrequencyNotMet {
                next_allowed: date!(2024 - 06 - 12)
            }
        );
        evaluate(&p, &ctx(date!(2024 - 06 - 12))).unwrap();
    }

    #[test]
    fn suspended_program_always_rejected() {
        let p = Program {
            state: ProgramState::Suspended,
            ..test_program()
        };
        for today in [date!(2024 - 06 - 12), date!(2024 - 09 - 01)] {
            let mut c = ctx(today);
            c.last_execution = None;
            c.weather = Some(calm());
            assert_eq!(evaluate(&p, &c), Err(GateRejection::NotActive));
        }
    }

    #[test]
    fn date_range_enforced() {
        let p = test_program();
        let mut c = ctx(date!(2023 - 12 - 31));
        c.last_execution = None;
        assert_eq!(evaluate(&p, &c).unwrap_err().reason(), "start date not reached");

        c.today = date!(2025 - 01 - 01);
        assert_eq!(evaluate(&p, &c).unwrap_err().reason(), "end date passed");

        // Both bounds are inclusive.
        c.today = date!(2024 - 12 - 31);
        evaluate(&p, &c).unwrap();
    }

    #[test]
    fn first_run_skips_frequency_check() {
        let p = test_program();
        let mut c = ctx(date!(2024 - 06 - 11));
        c.last_execution = None;
        evaluate(&p, &c).unwrap();
    }

    #[test]
    fn weekly_program_honours_weekday_mask() {
        let p = Program {
            frequency_type: FrequencyType::Weekly,
            frequency_days: None,
            weekdays: Weekdays::none().with(Weekday::Wednesday),
            ..test_program()
        };
        // 2024-06-12 is a Wednesday.
        evaluate(&p, &ctx(date!(2024 - 06 - 12))).unwrap();
        assert_eq!(
            evaluate(&p, &ctx(date!(2024 - 06 - 13))),
            Err(GateRejection::WeekdayNotAllowed)
        );
    }

    #[test]
    fn weekday_mask_ignored_for_non_weekly_programs() {
        let p = test_program();
        assert_eq!(p.weekdays, Weekdays::none());
        evaluate(&p, &ctx(date!(2024 - 06 - 12))).unwrap();
    }

    #[test]
    fn rain_at_threshold_rejects() {
        let p = test_program();
        let mut c = ctx(date!(2024 - 06 - 12));
        c.weather = Some(WeatherSnapshot {
            precipitation_mm: 5.0,
            ..calm()
        });
        assert_eq!(evaluate(&p, &c).unwrap_err().reason(), "rain detected");

        let p = Program {
            stop_if_rain: false,
            ..test_program()
        };
        evaluate(&p, &c).unwrap();
    }

    #[test]
    fn temperature_bounds() {
        let p = Program {
            temperature_min: Some(5.0),
            temperature_max: Some(35.0),
            ..test_program()
        };
        let mut c = ctx(date!(2024 - 06 - 12));

        c.weather = Some(WeatherSnapshot {
            temperature_c: 2.0,
            ..calm()
        });
        assert_eq!(evaluate(&p, &c).unwrap_err().reason(), "temperature too low");

        c.weather = Some(WeatherSnapshot {
            temperature_c: 38.0,
            ..calm()
        });
        assert_eq!(evaluate(&p, &c).unwrap_err().reason(), "temperature too high");
    }

    #[test]
    fn wind_strictly_above_max_rejects() {
        let p = test_program();
        let mut c = ctx(date!(2024 - 06 - 12));
        c.weather = Some(WeatherSnapshot {
            wind_speed_kmh: 15.0,
            ..calm()
        });
        evaluate(&p, &c).unwrap();

        c.weather = Some(WeatherSnapshot {
            wind_speed_kmh: 15.1,
            ..calm()
        });
        assert_eq!(evaluate(&p, &c).unwrap_err().reason(), "wind too strong");
    }

    #[test]
    fn wet_soil_rejects_above_threshold_margin() {
        let p = test_program();
        let mut c = ctx(date!(2024 - 06 - 12));

        c.soil_moisture_pct = Some(50.0);
        evaluate(&p, &c).unwrap();

        c.soil_moisture_pct = Some(50.5);
        let err = evaluate(&p, &c).unwrap_err();
        assert_eq!(err.reason(), "soil too wet");
        assert_eq!(err.to_string(), "soil too wet (50.5%)");

        let p = Program {
            use_soil_analysis: false,
            ..test_program()
        };
        evaluate(&p, &c).unwrap();
    }

    #[test]
    fn missing_soil_reading_skips_check() {
        let p = test_program();
        evaluate(&p, &ctx(date!(2024 - 06 - 12))).unwrap();
    }
}
