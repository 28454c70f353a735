//! XTAL frequency-error tracking. A one-shot average over the first
//! [`XERR_INIT_AVG`] samples anchors the estimate, then a low-pass filter
//! tracks slow drift. The correction is invalidated whenever the GPS time
//! reference goes stale.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::shutdown::ExitSignal;
use crate::timeref::GpsTimeRef;

/// Number of measurements the XTAL correction is averaged on as initial value.
pub const XERR_INIT_AVG: u32 = 128;
/// Coefficient for low-pass XTAL error tracking.
pub const XERR_FILT_COEF: f64 = 256.0;

/// Multiplicative adjustment applied to nominal frequencies to compensate
/// local-oscillator drift, valid only while the time reference stays fresh.
#[derive(Debug, Clone, Copy)]
pub struct XtalCorrection {
    pub correct: f64,
    pub ok: bool,
}

impl Default for XtalCorrection {
    fn default() -> Self {
        Self { correct: 1.0, ok: false }
    }
}

#[derive(Debug, Default)]
pub struct SharedXtal {
    state: Mutex<XtalCorrection>,
}

impl SharedXtal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> XtalCorrection {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, value: XtalCorrection) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// Filter state owned by the tracking task.
#[derive(Debug, Default)]
pub struct XtalTracker {
    init_cpt: u32,
    init_acc: f64,
}

impl XtalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one observation cycle. `xtal_err` is the raw clock error from
    /// the latest valid time reference, or `None` when the reference is
    /// stale.
    pub fn step(&mut self, shared: &SharedXtal, xtal_err: Option<f64>) {
        let Some(xtal_err) = xtal_err else {
            /* couldn't sync, or sync too old: invalidate the correction */
            shared.set(XtalCorrection { correct: 1.0, ok: false });
            self.init_cpt = 0;
            self.init_acc = 0.0;
            return;
        };

        if self.init_cpt < XERR_INIT_AVG {
            /* initial accumulation */
            self.init_acc += xtal_err;
            self.init_cpt += 1;
            if self.init_cpt == XERR_INIT_AVG {
                /* initial average calculation */
                shared.set(XtalCorrection {
                    correct: f64::from(XERR_INIT_AVG) / self.init_acc,
                    ok: true,
                });
            }
        } else {
            /* tracking with low-pass filter */
            let mut corr = shared.get();
            corr.correct =
                corr.correct - corr.correct / XERR_FILT_COEF + (1.0 / xtal_err) / XERR_FILT_COEF;
            shared.set(corr);
        }
    }
}

/// Body of the validation task: once per second, revalidate the time
/// reference and update the XTAL correction accordingly.
pub fn thread_valid(
    exit: Arc<ExitSignal>,
    timeref: Arc<GpsTimeRef>,
    xtal: Arc<SharedXtal>,
) -> Result<()> {
    info!("INFO: Validation thread activated.");
    let mut tracker = XtalTracker::new();

    while exit.should_run() {
        std::thread::sleep(Duration::from_millis(1000));

        let (tref, valid) = timeref.snapshot();
        tracker.step(&xtal, valid.then_some(tref.xtal_err));
    }
    info!("INFO: End of validation thread");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_becomes_valid_after_initial_average() {
        let shared = SharedXtal::new();
        let mut tracker = XtalTracker::new();

        for i in 0..XERR_INIT_AVG {
            assert!(!shared.get().ok, "correction valid after {} samples", i);
            tracker.step(&shared, Some(1.000002));
        }
        let corr = shared.get();
        assert!(corr.ok);
        assert!((corr.correct - 1.0 / 1.000002).abs() < 1e-9);
    }

    #[test]
    fn low_pass_tracks_after_average() {
        let shared = SharedXtal::new();
        let mut tracker = XtalTracker::new();
        for _ in 0..XERR_INIT_AVG {
            tracker.step(&shared, Some(1.0));
        }
        assert_eq!(shared.get().correct, 1.0);

        /* a single outlier moves the estimate by at most 1/256 of its weight */
        tracker.step(&shared, Some(1.000008));
        let corr = shared.get();
        assert!(corr.ok);
        let expected = 1.0 - 1.0 / XERR_FILT_COEF + (1.0 / 1.000008) / XERR_FILT_COEF;
        assert!((corr.correct - expected).abs() < 1e-12);
    }

    #[test]
    fn stale_reference_invalidates_and_resets() {
        let shared = SharedXtal::new();
        let mut tracker = XtalTracker::new();
        for _ in 0..XERR_INIT_AVG {
            tracker.step(&shared, Some(1.0));
        }
        assert!(shared.get().ok);

        tracker.step(&shared, None);
        let corr = shared.get();
        assert!(!corr.ok);
        assert_eq!(corr.correct, 1.0);

        /* the accumulator restarts from scratch */
        tracker.step(&shared, Some(1.0));
        assert!(!shared.get().ok);
    }
}
