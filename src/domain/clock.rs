//! Injectable time source
//!
//! Day-boundary and hold-time checks depend on "now"; components take a
//! `Clock` so tests can pin the instant. Daily windows start at the host's
//! local midnight.

use chrono::{DateTime, Local, TimeZone, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Start of the current day in the host's local timezone, as UTC
    fn start_of_today(&self) -> DateTime<Utc> {
        let local = self.now().with_timezone(&Local);
        let midnight = local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time");
        match Local.from_local_datetime(&midnight) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
                dt.with_timezone(&Utc)
            }
            // A DST gap at midnight: fall back to the UTC day boundary
            chrono::LocalResult::None => self
                .now()
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .expect("midnight is a valid time")
                .and_utc(),
        }
    }
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock for tests
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
