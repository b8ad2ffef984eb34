use time::OffsetDateTime;

/// Source of "now" for audit stamps, gate evaluation and scheduling.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Hours between two instants as a float (negative if `to` precedes `from`).
pub fn hours_between(from: OffsetDateTime, to: OffsetDateTime) -> f64 {
    (to - from).as_seconds_f64() / 3600.0
}

pub fn from_unix(ts: i64) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| anyhow::anyhow!("timestamp {ts} out of range: {e}"))
}

#[cfg(test)]
pub struct FixedClock(std::sync::Mutex<OffsetDateTime>);

#[cfg(test)]
impl FixedClock {
    pub fn new(at: OffsetDateTime) -> Self {
        Self(std::sync::Mutex::new(at))
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.0.lock().unwrap() = at;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    #[test]
    fn hours_between_is_fractional() {
        let a = datetime!(2024-06-10 06:00 UTC);
        let b = datetime!(2024-06-10 07:30 UTC);
        assert_eq!(hours_between(a, b), 1.5);
        assert_eq!(hours_between(b, a), -1.5);
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(datetime!(2024-06-10 06:00 UTC));
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), datetime!(2024-06-10 08:00 UTC));
    }

    #[test]
    fn from_unix_round_trips() {
        let t = datetime!(2024-06-10 06:00 UTC);
        assert_eq!(from_unix(t.unix_timestamp()).unwrap(), t);
    }
}
