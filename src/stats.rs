//! Measurement counters and the periodic status report. Counters accumulate
//! from the data-path tasks and are copied-and-reset by the statistics task
//! once per reporting interval.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use tracing::info;

use crate::gps::Coord;
use crate::protocol::Stat;

#[derive(Debug, Default)]
pub struct UpstreamCounters {
    pub nb_rx_rcv: AtomicU32,       /* packets received */
    pub nb_rx_ok: AtomicU32,        /* packets received with PAYLOAD CRC OK */
    pub nb_rx_bad: AtomicU32,       /* packets received with PAYLOAD CRC ERROR */
    pub nb_rx_nocrc: AtomicU32,     /* packets received with NO PAYLOAD CRC */
    pub up_pkt_fwd: AtomicU32,      /* radio packets forwarded to the server */
    pub up_network_byte: AtomicU32, /* UDP bytes sent for upstream traffic */
    pub up_payload_byte: AtomicU32, /* radio payload bytes sent for upstream traffic */
    pub up_dgram_sent: AtomicU32,   /* datagrams sent for upstream traffic */
    pub up_ack_rcv: AtomicU32,      /* datagrams acknowledged for upstream traffic */
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UpstreamSnapshot {
    pub nb_rx_rcv: u32,
    pub nb_rx_ok: u32,
    pub nb_rx_bad: u32,
    pub nb_rx_nocrc: u32,
    pub up_pkt_fwd: u32,
    pub up_network_byte: u32,
    pub up_payload_byte: u32,
    pub up_dgram_sent: u32,
    pub up_ack_rcv: u32,
}

impl UpstreamCounters {
    pub fn add(&self, counter: &AtomicU32, n: u32) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy all counters and reset them to zero.
    pub fn take(&self) -> UpstreamSnapshot {
        UpstreamSnapshot {
            nb_rx_rcv: self.nb_rx_rcv.swap(0, Ordering::Relaxed),
            nb_rx_ok: self.nb_rx_ok.swap(0, Ordering::Relaxed),
            nb_rx_bad: self.nb_rx_bad.swap(0, Ordering::Relaxed),
            nb_rx_nocrc: self.nb_rx_nocrc.swap(0, Ordering::Relaxed),
            up_pkt_fwd: self.up_pkt_fwd.swap(0, Ordering::Relaxed),
            up_network_byte: self.up_network_byte.swap(0, Ordering::Relaxed),
            up_payload_byte: self.up_payload_byte.swap(0, Ordering::Relaxed),
            up_dgram_sent: self.up_dgram_sent.swap(0, Ordering::Relaxed),
            up_ack_rcv: self.up_ack_rcv.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct DownstreamCounters {
    pub dw_pull_sent: AtomicU32,    /* PULL requests sent */
    pub dw_ack_rcv: AtomicU32,      /* PULL requests acknowledged */
    pub dw_dgram_rcv: AtomicU32,    /* PULL response packets received */
    pub dw_network_byte: AtomicU32, /* UDP bytes received for downstream traffic */
    pub dw_payload_byte: AtomicU32, /* radio payload bytes scheduled for TX */
    pub nb_tx_ok: AtomicU32,        /* packets emitted successfully */
    pub nb_tx_fail: AtomicU32,      /* packets for which TX failed */
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DownstreamSnapshot {
    pub dw_pull_sent: u32,
    pub dw_ack_rcv: u32,
    pub dw_dgram_rcv: u32,
    pub dw_network_byte: u32,
    pub dw_payload_byte: u32,
    pub nb_tx_ok: u32,
    pub nb_tx_fail: u32,
}

impl DownstreamCounters {
    pub fn add(&self, counter: &AtomicU32, n: u32) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn take(&self) -> DownstreamSnapshot {
        DownstreamSnapshot {
            dw_pull_sent: self.dw_pull_sent.swap(0, Ordering::Relaxed),
            dw_ack_rcv: self.dw_ack_rcv.swap(0, Ordering::Relaxed),
            dw_dgram_rcv: self.dw_dgram_rcv.swap(0, Ordering::Relaxed),
            dw_network_byte: self.dw_network_byte.swap(0, Ordering::Relaxed),
            dw_payload_byte: self.dw_payload_byte.swap(0, Ordering::Relaxed),
            nb_tx_ok: self.nb_tx_ok.swap(0, Ordering::Relaxed),
            nb_tx_fail: self.nb_tx_fail.swap(0, Ordering::Relaxed),
        }
    }
}

/// Latest GNSS position published by the ingest task.
#[derive(Debug, Default)]
pub struct GpsMeas {
    state: Mutex<(bool, Coord)>,
}

impl GpsMeas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, coord: Option<Coord>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match coord {
            Some(c) => *state = (true, c),
            None => state.0 = false,
        }
    }

    pub fn get(&self) -> (bool, Coord) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-slot mailbox for the JSON status object, filled by the statistics
/// task and drained by the upstream fan-out.
#[derive(Debug, Default)]
pub struct StatusReport {
    report: Mutex<Option<Stat>>,
}

impl StatusReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, stat: Stat) {
        *self.report.lock().unwrap_or_else(PoisonError::into_inner) = Some(stat);
    }

    pub fn is_ready(&self) -> bool {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn take(&self) -> Option<Stat> {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn ratio(num: u32, den: u32) -> f64 {
    if den > 0 {
        f64::from(num) / f64::from(den)
    } else {
        0.0
    }
}

/// Emit the human-readable report and build the JSON status object for the
/// elapsed interval.
pub fn build_report(
    up: UpstreamSnapshot,
    dw: DownstreamSnapshot,
    gps_enabled: bool,
    timeref_state: Option<(bool, Option<u64>)>, /* (valid, age) when GPS sync is running */
    coord: Option<(Coord, bool)>,               /* (position, fake) */
    platform: &str,
    email: &str,
    description: &str,
) -> Stat {
    let stat_timestamp = Utc::now().format("%F %T %Z").to_string();

    let rx_ok_ratio = ratio(up.nb_rx_ok, up.nb_rx_rcv);
    let rx_bad_ratio = ratio(up.nb_rx_bad, up.nb_rx_rcv);
    let rx_nocrc_ratio = ratio(up.nb_rx_nocrc, up.nb_rx_rcv);
    let up_ack_ratio = ratio(up.up_ack_rcv, up.up_dgram_sent);
    let dw_ack_ratio = ratio(dw.dw_ack_rcv, dw.dw_pull_sent);

    info!("##### {} #####", stat_timestamp);
    info!("# RF packets received by concentrator: {}", up.nb_rx_rcv);
    info!(
        "# CRC_OK: {:.2}%, CRC_FAIL: {:.2}%, NO_CRC: {:.2}%",
        100.0 * rx_ok_ratio,
        100.0 * rx_bad_ratio,
        100.0 * rx_nocrc_ratio
    );
    info!("# RF packets forwarded: {} ({} bytes)", up.up_pkt_fwd, up.up_payload_byte);
    info!("# PUSH_DATA datagrams sent: {} ({} bytes)", up.up_dgram_sent, up.up_network_byte);
    info!("# PUSH_DATA acknowledged: {:.2}%", 100.0 * up_ack_ratio);
    info!("### [DOWNSTREAM] ###");
    info!("# PULL_DATA sent: {} ({:.2}% acknowledged)", dw.dw_pull_sent, 100.0 * dw_ack_ratio);
    info!("# PULL_RESP(onse) datagrams received: {} ({} bytes)", dw.dw_dgram_rcv, dw.dw_network_byte);
    info!("# RF packets sent to concentrator: {} ({} bytes)", dw.nb_tx_ok + dw.nb_tx_fail, dw.dw_payload_byte);
    info!("# TX errors: {}", dw.nb_tx_fail);
    info!("### [GPS] ###");
    if gps_enabled {
        match timeref_state {
            Some((true, age)) => info!("# Valid gps time reference (age: {} sec)", age.unwrap_or(0)),
            Some((false, age)) => info!("# Invalid gps time reference (age: {} sec)", age.unwrap_or(0)),
            None => {}
        }
        match coord {
            Some((c, true)) => info!(
                "# Manual GPS coordinates: latitude {:.5}, longitude {:.5}, altitude {} m",
                c.lat, c.lon, c.alt
            ),
            Some((c, false)) => info!(
                "# System GPS coordinates: latitude {:.5}, longitude {:.5}, altitude {} m",
                c.lat, c.lon, c.alt
            ),
            None => info!("# no valid GPS coordinates available yet"),
        }
    } else {
        info!("# GPS sync is disabled");
    }
    info!("##### END #####");

    let (lati, longi, alti) = match coord {
        Some((c, _)) if gps_enabled => (
            Some((c.lat * 1e5).round() / 1e5),
            Some((c.lon * 1e5).round() / 1e5),
            Some(c.alt),
        ),
        _ => (None, None, None),
    };

    Stat {
        time: stat_timestamp,
        lati,
        longi,
        alti,
        rxnb: up.nb_rx_rcv,
        rxok: up.nb_rx_ok,
        rxfw: up.up_pkt_fwd,
        ackr: (1000.0 * up_ack_ratio).round() / 10.0,
        dwnb: dw.dw_dgram_rcv,
        txnb: dw.nb_tx_ok,
        pfrm: platform.to_string(),
        mail: email.to_string(),
        desc: description.to_string(),
    }
}
