//! GPS time reference: the affine mapping between the concentrator counter
//! and UTC, disciplined by the GNSS task and consumed by every task that
//! needs to translate between server-specified UTC and counter time.

use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

/// Maximum admitted delay in seconds of GPS loss before considering the
/// latest sync unusable.
pub const GPS_REF_MAX_AGE: u64 = 30;

/* counter ticks per second, and the admitted slope window (±10 ppm) */
const TS_CPS: f64 = 1E6;
const PLUS_10PPM: f64 = 1.00001;
const MINUS_10PPM: f64 = 0.99999;

/// One accepted synchronisation point.
#[derive(Debug, Clone, Copy)]
pub struct TimeRef {
    pub systime: Option<SystemTime>, /* system time when the sync was accepted */
    pub count_us: u32,               /* concentrator counter at the sync point */
    pub utc: DateTime<Utc>,          /* UTC time at the sync point */
    pub xtal_err: f64,               /* raw clock error: counter seconds per UTC second */
}

impl Default for TimeRef {
    fn default() -> Self {
        Self {
            systime: None,
            count_us: 0,
            utc: DateTime::UNIX_EPOCH,
            xtal_err: 1.0,
        }
    }
}

impl TimeRef {
    /// Age of the reference, `None` if no sync was ever accepted.
    pub fn age(&self) -> Option<u64> {
        let systime = self.systime?;
        SystemTime::now()
            .duration_since(systime)
            .ok()
            .map(|d| d.as_secs())
    }

    fn usable(&self) -> bool {
        self.systime.is_some() && self.xtal_err <= PLUS_10PPM && self.xtal_err >= MINUS_10PPM
    }

    /// Convert a concentrator counter value to UTC using this reference.
    pub fn cnt2utc(&self, count_us: u32) -> Result<DateTime<Utc>> {
        if !self.usable() {
            return Err(anyhow!("time reference is not usable for conversion"));
        }
        let delta_sec = count_us.wrapping_sub(self.count_us) as f64 / (TS_CPS * self.xtal_err);
        Ok(self.utc + chrono::Duration::nanoseconds((delta_sec * 1E9) as i64))
    }

    /// Convert a UTC time to a concentrator counter value using this
    /// reference.
    pub fn utc2cnt(&self, utc: DateTime<Utc>) -> Result<u32> {
        if !self.usable() {
            return Err(anyhow!("time reference is not usable for conversion"));
        }
        let delta = utc.signed_duration_since(self.utc);
        let delta_sec = delta.num_microseconds().unwrap_or(0) as f64 / 1E6;
        Ok(self
            .count_us
            .wrapping_add((delta_sec * TS_CPS * self.xtal_err).round() as i64 as u32))
    }
}

#[derive(Debug, Default)]
struct SyncState {
    tref: TimeRef,
    /* was the update at sync N-1 / N-2 aberrant ? */
    aber_min1: bool,
    aber_min2: bool,
}

/// Shared handle around the time reference. Mutated only by the GNSS task;
/// everyone else takes snapshots.
#[derive(Debug, Default)]
pub struct GpsTimeRef {
    state: Mutex<SyncState>,
}

impl GpsTimeRef {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Both fields of the freshness rule, obtained atomically: the current
    /// reference and whether it is younger than [`GPS_REF_MAX_AGE`].
    pub fn snapshot(&self) -> (TimeRef, bool) {
        let tref = self.lock().tref;
        let valid = matches!(tref.age(), Some(age) if age <= GPS_REF_MAX_AGE);
        (tref, valid)
    }

    /// Try to update the reference with a new (counter, UTC) pair. The
    /// update is screened for aberrant points: the slope between the old and
    /// new point must stay within ±10 ppm of 1.0. One or two consecutive
    /// aberrant points are rejected; a third forces a reference reset.
    pub fn sync(&self, count_us: u32, utc: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();

        let cnt_diff = count_us.wrapping_sub(state.tref.count_us) as f64 / TS_CPS;
        let utc_diff = utc
            .signed_duration_since(state.tref.utc)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1E6;

        let (aber_n0, slope) = if utc_diff != 0.0 {
            let slope = cnt_diff / utc_diff;
            (!(MINUS_10PPM..=PLUS_10PPM).contains(&slope), slope)
        } else {
            (true, 0.0)
        };

        /* never synced before: accept the point as-is, slope is meaningless */
        if state.tref.systime.is_none() {
            state.tref = TimeRef {
                systime: Some(SystemTime::now()),
                count_us,
                utc,
                xtal_err: 1.0,
            };
            state.aber_min1 = false;
            state.aber_min2 = false;
            return Ok(());
        }

        if !aber_n0 {
            /* value not aberrant, sync with the latest point */
            state.tref = TimeRef {
                systime: Some(SystemTime::now()),
                count_us,
                utc,
                xtal_err: slope,
            };
            state.aber_min1 = false;
            state.aber_min2 = false;
            Ok(())
        } else if state.aber_min1 && state.aber_min2 {
            /* 3 successive aberrant values, sync reset */
            let mut xtal_err = state.tref.xtal_err;
            if !(MINUS_10PPM..=PLUS_10PPM).contains(&xtal_err) {
                xtal_err = 1.0;
            }
            state.tref = TimeRef {
                systime: Some(SystemTime::now()),
                count_us,
                utc,
                xtal_err,
            };
            state.aber_min1 = false;
            state.aber_min2 = false;
            Ok(())
        } else {
            /* only 1 or 2 successive aberrant values, ignore */
            state.aber_min2 = state.aber_min1;
            state.aber_min1 = true;
            Err(anyhow!("aberrant GPS sync point rejected"))
        }
    }

    /// Test and tooling hook: install a reference observed at `systime`.
    pub fn force(&self, tref: TimeRef) {
        self.lock().tref = tref;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn utc(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn first_sync_is_always_accepted() {
        let tr = GpsTimeRef::new();
        tr.sync(1_000_000, utc(1_600_000_000)).unwrap();
        let (tref, valid) = tr.snapshot();
        assert!(valid);
        assert_eq!(tref.count_us, 1_000_000);
        assert_eq!(tref.xtal_err, 1.0);
    }

    #[test]
    fn in_range_slope_updates_xtal_err() {
        let tr = GpsTimeRef::new();
        tr.sync(0, utc(1_600_000_000)).unwrap();
        /* 10 s later, counter advanced 10.00005 s: +5 ppm */
        tr.sync(10_000_050, utc(1_600_000_010)).unwrap();
        let (tref, _) = tr.snapshot();
        assert!((tref.xtal_err - 1.000005).abs() < 1e-9);
    }

    #[test]
    fn aberrant_points_rejected_then_reset() {
        let tr = GpsTimeRef::new();
        tr.sync(0, utc(1_600_000_000)).unwrap();
        /* 1 s of UTC but 2 s of counter: wildly out of range */
        assert!(tr.sync(2_000_000, utc(1_600_000_001)).is_err());
        assert!(tr.sync(4_000_000, utc(1_600_000_002)).is_err());
        /* third aberrant point forces a reference reset */
        tr.sync(6_000_000, utc(1_600_000_003)).unwrap();
        let (tref, _) = tr.snapshot();
        assert_eq!(tref.count_us, 6_000_000);
        assert_eq!(tref.xtal_err, 1.0);
    }

    #[test]
    fn cnt2utc_and_back() {
        let tref = TimeRef {
            systime: Some(SystemTime::now()),
            count_us: 1_000_000,
            utc: utc(1_600_000_000),
            xtal_err: 1.0,
        };
        let t = tref.cnt2utc(3_500_000).unwrap();
        assert_eq!(t.timestamp(), 1_600_000_002);
        assert_eq!(t.timestamp_subsec_micros(), 500_000);
        assert_eq!(tref.utc2cnt(t).unwrap(), 3_500_000);
    }

    #[test]
    fn conversion_requires_a_reference() {
        let tref = TimeRef::default();
        assert!(tref.cnt2utc(0).is_err());
        assert!(tref.utc2cnt(utc(0)).is_err());
    }

    #[test]
    fn counter_wrap_is_handled() {
        let tref = TimeRef {
            systime: Some(SystemTime::now()),
            count_us: 4_294_000_000,
            utc: utc(1_600_000_000),
            xtal_err: 1.0,
        };
        /* two seconds later the 32-bit counter has wrapped */
        let t = tref.cnt2utc(1_032_704).unwrap();
        assert_eq!(t.timestamp(), 1_600_000_002);
        assert_eq!(t.timestamp_subsec_micros(), 0);
    }

    #[test]
    fn freshness_window_boundary() {
        let tr = GpsTimeRef::new();
        let now = SystemTime::now();
        tr.force(TimeRef {
            systime: Some(now - Duration::from_secs(GPS_REF_MAX_AGE)),
            count_us: 0,
            utc: utc(1_600_000_000),
            xtal_err: 1.0,
        });
        assert!(tr.snapshot().1, "30 s old reference must still be valid");

        tr.force(TimeRef {
            systime: Some(now - Duration::from_secs(GPS_REF_MAX_AGE + 1)),
            count_us: 0,
            utc: utc(1_600_000_000),
            xtal_err: 1.0,
        });
        assert!(!tr.snapshot().1, "31 s old reference must be invalid");
    }
}
