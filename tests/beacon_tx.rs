//! Beacon scheduling against the scripted concentrator: a pre-armed beacon
//! must reach the TX path aligned to the expected PPS second, with the
//! frequency corrected by the XTAL multiplier.

mod common;

use std::sync::Arc;
use std::time::SystemTime;

use chrono::{TimeZone, Utc};
use common::mock_hal;
use poly_pkt_fwd::beacon::{send_beacon, BeaconArm, BeaconCtx, BEACON_SIZE};
use poly_pkt_fwd::concentrator::Concentrator;
use poly_pkt_fwd::gps::Coord;
use poly_pkt_fwd::hal::TxMode;
use poly_pkt_fwd::shutdown::ExitSignal;
use poly_pkt_fwd::timeref::{GpsTimeRef, TimeRef};
use poly_pkt_fwd::xtal::{SharedXtal, XtalTracker, XERR_INIT_AVG};

fn ctx_with(
    timeref: Arc<GpsTimeRef>,
    xtal: Arc<SharedXtal>,
) -> (BeaconCtx, Arc<std::sync::Mutex<common::MockState>>) {
    let (hal, state) = mock_hal();
    let (_tx, rx) = crossbeam_channel::bounded(1);
    let ctx = BeaconCtx {
        exit: Arc::new(ExitSignal::new()),
        conc: Arc::new(Concentrator::new(Box::new(hal))),
        timeref,
        xtal,
        arm: rx,
        reference_coord: Coord { lat: 52.5, lon: 13.4, alt: 30 },
        beacon_freq_hz: 869_525_000,
    };
    (ctx, state)
}

fn valid_xtal() -> Arc<SharedXtal> {
    let xtal = Arc::new(SharedXtal::new());
    let mut tracker = XtalTracker::new();
    for _ in 0..XERR_INIT_AVG {
        tracker.step(&xtal, Some(1.0));
    }
    assert!(xtal.get().ok);
    xtal
}

fn synced_timeref(utc_sec: i64) -> Arc<GpsTimeRef> {
    let timeref = Arc::new(GpsTimeRef::new());
    timeref.force(TimeRef {
        systime: Some(SystemTime::now()),
        count_us: 1_000_000,
        utc: Utc.timestamp_opt(utc_sec, 0).single().unwrap(),
        xtal_err: 1.0,
    });
    timeref
}

#[test]
fn armed_beacon_is_scheduled_on_gps_pps() {
    let target = 1_600_000_128i64;
    let (ctx, state) = ctx_with(synced_timeref(target - 1), valid_xtal());

    send_beacon(&ctx, BeaconArm { pps_utc_sec: target });

    let sent = state.lock().unwrap().sent.clone();
    assert_eq!(sent.len(), 1);
    let pkt = &sent[0];
    assert_eq!(pkt.tx_mode, TxMode::ON_GPS);
    assert_eq!(pkt.size, BEACON_SIZE);
    assert_eq!(pkt.freq_hz, 869_525_000, "unit XTAL multiplier keeps the nominal frequency");
    /* the frame carries the target PPS second, little endian at bytes 3..7 */
    let t = u32::from_le_bytes([pkt.payload[3], pkt.payload[4], pkt.payload[5], pkt.payload[6]]);
    assert_eq!(i64::from(t), target);
}

#[test]
fn beacon_requires_valid_time_reference() {
    let (ctx, state) = ctx_with(Arc::new(GpsTimeRef::new()), valid_xtal());
    send_beacon(&ctx, BeaconArm { pps_utc_sec: 1_600_000_128 });
    assert!(state.lock().unwrap().sent.is_empty());
}

#[test]
fn beacon_requires_valid_xtal_correction() {
    let target = 1_600_000_128i64;
    let (ctx, state) = ctx_with(synced_timeref(target - 1), Arc::new(SharedXtal::new()));
    send_beacon(&ctx, BeaconArm { pps_utc_sec: target });
    assert!(state.lock().unwrap().sent.is_empty());
}

#[test]
fn stale_pre_arm_is_discarded() {
    let target = 1_600_000_128i64;
    /* the reference has moved past the armed second */
    let (ctx, state) = ctx_with(synced_timeref(target + 5), valid_xtal());
    send_beacon(&ctx, BeaconArm { pps_utc_sec: target });
    assert!(state.lock().unwrap().sent.is_empty());
}
