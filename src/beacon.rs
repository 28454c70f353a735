//! Time beacon: a gateway-originated downlink aligned to a GNSS PPS second,
//! carrying network identity, UTC time and gateway position. The GNSS task
//! pre-arms the beacon one second ahead of the target PPS through a
//! single-slot channel; this task builds the frame, schedules it on the
//! concentrator and polls the TX status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use crate::concentrator::Concentrator;
use crate::gps::Coord;
use crate::hal::{
    LgwPktTx, Modulation, TxMode, BW_125KHZ, CR_LORA_4_5, DR_LORA_SF9, TX_FREE, TX_STATUS_UNKNOWN,
};
use crate::shutdown::ExitSignal;
use crate::timeref::GpsTimeRef;
use crate::xtal::SharedXtal;

/// Time in ms between polls of the beacon TX status.
pub const BEACON_POLL_MS: u64 = 50;
/* poll the TX status for at most 1500 ms */
const BEACON_POLL_MAX: u32 = (1500 / BEACON_POLL_MS) as u32;

/* network ID broadcast in every beacon, 3 bytes only */
const BEACON_NETID: u32 = 0xC0FFEE;

pub const BEACON_SIZE: u16 = 17;

/// Pre-arm message from the GNSS task: the UTC second of the PPS pulse the
/// beacon must ride on.
#[derive(Debug, Clone, Copy)]
pub struct BeaconArm {
    pub pps_utc_sec: i64,
}

/// CRC-8, polynomial 0x87, init 0xFF (beacon first-part integrity).
pub fn crc8_ccit(data: &[u8]) -> u8 {
    const CRC_POLY: u8 = 0x87;
    let mut x: u8 = 0xFF;
    for &b in data {
        x ^= b;
        for _ in 0..8 {
            x = if x & 0x80 != 0 { (x << 1) ^ CRC_POLY } else { x << 1 };
        }
    }
    x
}

/// CRC-CCITT-16, polynomial 0x1021, init 0xFFFF (beacon second-part
/// integrity).
pub fn crc_ccit(data: &[u8]) -> u16 {
    const CRC_POLY: u16 = 0x1021;
    let mut x: u16 = 0xFFFF;
    for &b in data {
        x ^= u16::from(b) << 8;
        for _ in 0..8 {
            x = if x & 0x8000 != 0 { (x << 1) ^ CRC_POLY } else { x << 1 };
        }
    }
    x
}

/// Assemble the 17-byte beacon frame: NetID, UTC seconds of the target PPS,
/// CRC-8, info field, 24-bit scaled latitude and longitude, CRC-16.
/// All multi-byte fields little endian except the trailing CRC-16.
pub fn build_beacon(utc_sec: u32, coord: &Coord, freq_hz: u32) -> LgwPktTx {
    let mut pkt = LgwPktTx {
        freq_hz,
        tx_mode: TxMode::ON_GPS, /* send on PPS pulse */
        rf_chain: 0,             /* antenna A */
        rf_power: 14,
        modulation: Modulation::LORA,
        bandwidth: BW_125KHZ,
        datarate: DR_LORA_SF9,
        coderate: CR_LORA_4_5,
        invert_pol: true,
        preamble: 6,
        no_crc: true,
        no_header: true,
        size: BEACON_SIZE,
        ..Default::default()
    };

    pkt.payload[0] = (BEACON_NETID & 0xFF) as u8;
    pkt.payload[1] = ((BEACON_NETID >> 8) & 0xFF) as u8;
    pkt.payload[2] = ((BEACON_NETID >> 16) & 0xFF) as u8;

    pkt.payload[3] = (utc_sec & 0xFF) as u8;
    pkt.payload[4] = ((utc_sec >> 8) & 0xFF) as u8;
    pkt.payload[5] = ((utc_sec >> 16) & 0xFF) as u8;
    pkt.payload[6] = ((utc_sec >> 24) & 0xFF) as u8;

    pkt.payload[7] = crc8_ccit(&pkt.payload[0..7]);

    /* info field, and the publicly reported position */
    let mut field_latitude = ((coord.lat / 90.0) * f64::from(1 << 23)) as i32;
    if field_latitude > 0x007FFFFF {
        field_latitude = 0x007FFFFF; /* +90 N is represented as 89.99999 N */
    } else if field_latitude < -0x00800000 {
        field_latitude = -0x00800000;
    }
    let field_longitude =
        0x00FFFFFF & (((coord.lon / 180.0) * f64::from(1 << 23)) as i32); /* +180 = -180 = 0x800000 */

    pkt.payload[8] = 0; /* info */
    pkt.payload[9] = (field_latitude & 0xFF) as u8;
    pkt.payload[10] = ((field_latitude >> 8) & 0xFF) as u8;
    pkt.payload[11] = ((field_latitude >> 16) & 0xFF) as u8;
    pkt.payload[12] = (field_longitude & 0xFF) as u8;
    pkt.payload[13] = ((field_longitude >> 8) & 0xFF) as u8;
    pkt.payload[14] = ((field_longitude >> 16) & 0xFF) as u8;

    let field_crc2 = crc_ccit(&pkt.payload[8..15]);
    pkt.payload[15] = (field_crc2 & 0xFF) as u8;
    pkt.payload[16] = ((field_crc2 >> 8) & 0xFF) as u8;

    pkt
}

pub struct BeaconCtx {
    pub exit: Arc<ExitSignal>,
    pub conc: Arc<Concentrator>,
    pub timeref: Arc<GpsTimeRef>,
    pub xtal: Arc<SharedXtal>,
    pub arm: Receiver<BeaconArm>,
    pub reference_coord: Coord,
    pub beacon_freq_hz: u32,
}

/// Schedule one pre-armed beacon: frame it from the current time reference,
/// hand it to the concentrator and poll until the TX path frees up.
pub fn send_beacon(ctx: &BeaconCtx, arm: BeaconArm) {
    let (tref, tref_valid) = ctx.timeref.snapshot();
    let xtal = ctx.xtal.get();
    if !tref_valid || !xtal.ok {
        /* no usable PPS/XTAL discipline, skip this cycle */
        return;
    }

    /* the beacon is prepared 1 sec before beacon time */
    let field_time = tref.utc.timestamp() + 1;
    if field_time != arm.pps_utc_sec {
        warn!("WARNING: [beacon] stale pre-arm (target {}, now {}), skipped", arm.pps_utc_sec, field_time);
        return;
    }

    /* apply the frequency correction to the beacon TX frequency */
    let freq_hz = (xtal.correct * f64::from(ctx.beacon_freq_hz)).round() as u32;
    let pkt = build_beacon(field_time as u32, &ctx.reference_coord, freq_hz);
    info!("NOTE: [beacon] beacon ready to send (frequency {} Hz)", freq_hz);

    if let Err(e) = ctx.conc.send(&pkt) {
        warn!("WARNING: [beacon] failed to send beacon packet: {:#}", e);
        return;
    }

    let mut tx_status = TX_STATUS_UNKNOWN;
    let mut polls = 0;
    while polls < BEACON_POLL_MAX && tx_status != TX_FREE {
        std::thread::sleep(Duration::from_millis(BEACON_POLL_MS));
        tx_status = ctx.conc.tx_status().unwrap_or(TX_STATUS_UNKNOWN);
        polls += 1;
    }
    if tx_status == TX_FREE {
        info!("NOTE: [beacon] beacon sent successfully");
    } else {
        warn!("WARNING: [beacon] beacon was scheduled but failed to TX");
    }
}

/// Body of the beacon task.
pub fn thread_beacon(ctx: BeaconCtx) -> Result<()> {
    info!("INFO: Beacon thread activated.");
    while ctx.exit.should_run() {
        match ctx.arm.recv_timeout(Duration::from_millis(200)) {
            Ok(arm) => send_beacon(&ctx, arm),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("INFO: End of beacon thread");
    Ok(())
}
